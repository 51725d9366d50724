//! Sample rate adjustment models for dynamic sampling.
//!
//! Sentry's ingestion edge keeps a random sample of transactions per project. The rates in this
//! crate rebalance that sample so that low-volume projects and transactions are not drowned out by
//! high-volume ones, while the total number of kept events stays the same.
//!
//! There are two models:
//!
//!  - [`AdjustedModel`] rebalances the sample rates of all projects in an organization.
//!  - [`adjust_sample_rate`] rebalances the sample rates of transaction names within a project.
//!
//! Both share the same principle: every entity receives the same expected number of sampled
//! events, so the rate of an entity is inversely proportional to its volume. Rates are clamped to
//! [`RateBounds`], and whatever budget clamping frees up or consumes is redistributed among the
//! entities that are still within bounds.
//!
//! The crate also defines where rebalanced rates live in the shared cache ([`ProjectRatesKey`],
//! [`TransactionRatesKey`]) and the [`SamplingRule`] format the ingestion edge consumes.
//!
//! The models are pure. They perform no I/O and are deterministic for a given input order.
#![warn(missing_docs)]

mod bounds;
mod keys;
mod project;
mod rules;
mod solver;
mod transaction;

pub use self::bounds::*;
pub use self::keys::*;
pub use self::project::*;
pub use self::rules::*;
pub use self::solver::{BUDGET_EPSILON, MAX_ITERATIONS};
pub use self::transaction::*;
