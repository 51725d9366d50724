//! Logging facade for the rebalancer.
//!
//! # Setup
//!
//! To enable logging, invoke the [`init`] function with a [`LogConfig`]. The configuration
//! implements `serde` traits, so it is usually obtained from the `logging` section of the
//! configuration file. Initialization requires the `init` feature.
//!
//! # Logging
//!
//! Use the five logging macros [`error!`], [`warn!`], [`info!`], [`debug!`] and [`trace!`], which
//! are re-exports of the macros in `tracing`. They accept format strings and structured fields.
//!
//! ## Conventions
//!
//! Log messages should start lowercase and end without punctuation. Prefer short and precise log
//! messages over verbose text, and attach identifiers as fields:
//!
//! ```
//! let org_id = 42;
//! rebalancer_log::info!(org_id, "adjusted project sample rates");
//! ```
//!
//! - [`error!`] for bugs and invalid behavior.
//! - [`warn!`] for undesirable behavior.
//! - [`info!`] for messages relevant to the average operator.
//! - [`debug!`] for messages usually relevant to debugging.
//! - [`trace!`] for full auxiliary information.
//!
//! ## Logging Error Types
//!
//! To log errors with all of their causes, use the [`LogError`] wrapper:
//!
//! ```
//! use std::io::{Error, ErrorKind};
//! use rebalancer_log::LogError;
//!
//! let custom_error = Error::new(ErrorKind::Other, "oh no!");
//! rebalancer_log::error!("operation failed: {}", LogError(&custom_error));
//! ```
//!
//! # Testing
//!
//! For unit testing, call [`init_test!`] at the beginning of the test. It requires the `test`
//! feature and captures logs of the calling crate in the test output.

#![warn(missing_docs)]

mod setup;
pub use setup::*;

#[cfg(feature = "test")]
pub use test::*;

mod utils;
pub use utils::*;

#[doc(inline)]
pub use tracing::{Level, debug, error, info, trace, warn};
