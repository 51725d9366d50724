//! Configuration for the rebalancer CLI and server.
//!
//! The configuration is read from a `config.yml` file in a config folder, which defaults to
//! `.rebalancer` in the current working directory. Every section of the file is optional:
//!
//! ```yaml
//! logging:
//!   level: info
//! metrics:
//!   statsd: 127.0.0.1:8125
//! redis: redis://127.0.0.1:6379
//! upstream:
//!   url: http://127.0.0.1:9000
//! sampling:
//!   min_rate: 0.01
//!   max_explicit_transactions: 10
//! jobs:
//!   concurrency: 4
//!   retry:
//!     max_retries: 5
//!     delay: 5
//! ```
//!
//! Some values can be overridden from the command line or the environment through
//! [`OverridableConfig`].
#![warn(missing_docs)]

mod config;

pub use self::config::*;
