//! Abstraction over Redis caches.
//!
//! The rebalancer writes its sampling rates into Redis hashes and uses a Redis list as its job
//! queue. Both a single instance and a Redis cluster are supported through [`AsyncRedisPool`].
#![warn(missing_docs)]

mod config;
mod pool;

pub use self::config::*;
pub use self::pool::*;
