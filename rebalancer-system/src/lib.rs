//! Foundational system components for the rebalancer's services.
//!
//! This crate contains the [`Service`] abstraction that long-running components of the server
//! implement, the [`Controller`] that coordinates a graceful shutdown, and [`run_job`], the wrapper
//! that applies time limits and retries to every job uniformly.
#![warn(missing_docs)]

mod controller;
mod job;
mod service;
mod statsd;

pub use self::controller::*;
pub use self::job::*;
pub use self::service::*;
