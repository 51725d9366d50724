//! Bounded inverse-volume rebalancing.
//!
//! Given volumes `v_i`, a budget `B` of expected sampled events, and bounds `[min, max]`, find a
//! level `k` such that every entity receives `r_i = clamp(k / v_i, min, max)` and
//!
//! ```text
//! F(k) = Σ r_i · v_i = Σ clamp(k, min · v_i, max · v_i) = B
//! ```
//!
//! `k` is the expected number of sampled events per entity that is not clamped. `F` is continuous,
//! piecewise linear and non-decreasing, with a slope equal to the number of entities that are
//! currently within bounds. Each step hands the budget that is still missing (or overspent) to
//! those free entities, which is exact within a linear segment. A bracket around the root guards
//! against steps that jump across segment boundaries, in which case the step bisects instead.

use rebalancer_log::debug;

use crate::RateBounds;

/// Maximum number of steps taken by the solver before giving up on an exact solution.
pub const MAX_ITERATIONS: usize = 100;

/// Tolerance on the spent budget, relative to the budget itself.
pub const BUDGET_EPSILON: f64 = 1e-9;

/// The outcome of [`solve`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Solution {
    /// Expected sampled events per unclamped entity.
    pub level: f64,
    /// Number of steps taken.
    pub iterations: usize,
    /// Whether the budget was met within [`BUDGET_EPSILON`].
    pub converged: bool,
    bounds: RateBounds,
}

impl Solution {
    /// Returns the sample rate for an entity of the given volume.
    ///
    /// Entities without volume receive the upper bound.
    pub fn rate(&self, volume: f64) -> f64 {
        if volume > 0.0 {
            self.bounds.clamp(self.level / volume)
        } else {
            self.bounds.max()
        }
    }
}

struct Problem<'a> {
    volumes: &'a [f64],
    budget: f64,
    bounds: RateBounds,
}

impl Problem<'_> {
    /// Returns `F(level)` and the number of free entities at `level`.
    fn spend(&self, level: f64) -> (f64, usize) {
        let mut spent = 0.0;
        let mut free = 0;

        for &volume in self.volumes.iter().filter(|v| **v > 0.0) {
            let lower = self.bounds.min() * volume;
            let upper = self.bounds.max() * volume;

            if level <= lower {
                spent += lower;
            } else if level >= upper {
                spent += upper;
            } else {
                spent += level;
                free += 1;
            }
        }

        (spent, free)
    }

    fn is_met(&self, spent: f64) -> bool {
        (spent - self.budget).abs() <= BUDGET_EPSILON * self.budget.max(1.0)
    }
}

/// A candidate level together with the bracket known to contain the root.
#[derive(Clone, Copy, Debug)]
struct Allocation {
    level: f64,
    low: f64,
    high: f64,
}

impl Allocation {
    fn step(self, problem: &Problem<'_>, spent: f64, free: usize) -> Self {
        let (low, high) = if spent < problem.budget {
            (self.level, self.high)
        } else {
            (self.low, self.level)
        };

        let next = if free > 0 {
            self.level + (problem.budget - spent) / free as f64
        } else {
            f64::NAN
        };

        let level = if next > low && next < high {
            next
        } else {
            low + (high - low) / 2.0
        };

        Self { level, low, high }
    }
}

/// Finds the level that spends `budget` across `volumes` within `bounds`.
///
/// If the budget cannot be met because every entity would have to go below the lower bound or
/// above the upper bound, all entities are pinned to that bound.
pub fn solve(volumes: &[f64], budget: f64, bounds: RateBounds) -> Solution {
    let positive = volumes.iter().filter(|v| **v > 0.0);
    let floor: f64 = positive.clone().map(|v| v * bounds.min()).sum();
    let ceiling: f64 = positive.clone().map(|v| v * bounds.max()).sum();
    let largest = positive.clone().fold(0.0_f64, |acc, v| acc.max(*v));
    let count = positive.count();

    let pinned = |level| Solution {
        level,
        iterations: 0,
        converged: true,
        bounds,
    };

    if count == 0 || budget >= ceiling {
        return pinned(largest * bounds.max());
    }
    if budget <= floor {
        return pinned(0.0);
    }

    let problem = Problem {
        volumes,
        budget,
        bounds,
    };

    // Start from an equal share of the budget per entity, which is the exact solution when nothing
    // is clamped.
    let mut allocation = Allocation {
        level: budget / count as f64,
        low: 0.0,
        high: largest * bounds.max(),
    };

    for iterations in 0..MAX_ITERATIONS {
        let (spent, free) = problem.spend(allocation.level);
        if problem.is_met(spent) {
            return Solution {
                level: allocation.level,
                iterations,
                converged: true,
                bounds,
            };
        }

        allocation = allocation.step(&problem, spent, free);
    }

    let (spent, _) = problem.spend(allocation.level);
    debug!(
        budget,
        spent,
        entities = count,
        "rebalancing did not converge within {MAX_ITERATIONS} iterations"
    );

    Solution {
        level: allocation.level,
        iterations: MAX_ITERATIONS,
        converged: problem.is_met(spent),
        bounds,
    }
}
