//! Long-running services of the rebalancer.

mod scheduler;
mod stats;
mod worker;

pub use self::scheduler::*;
pub use self::stats::*;
pub use self::worker::*;
