//! Common identifier types shared by the rebalancer crates.
#![warn(missing_docs)]

mod ids;

pub use self::ids::*;
