//! Rebalancing of sample rates across the projects of an organization.

use rebalancer_common::ProjectId;
use rebalancer_log::debug;
use serde::{Deserialize, Serialize};

use crate::{RateBounds, solver};

/// Observed volume of a project within the fetch window.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProjectVolume {
    /// The project the volume was observed for.
    pub project_id: ProjectId,
    /// Number of root transactions counted in the window.
    pub count_per_root: u64,
    /// The currently effective sample rate of the project.
    pub blended_sample_rate: f64,
}

/// A new sample rate for a project, as computed by [`AdjustedModel`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdjustedProjectRate {
    /// The project this rate applies to.
    pub project_id: ProjectId,
    /// The rebalanced sample rate, within the model's bounds.
    pub new_sample_rate: f64,
}

/// Rebalances sample rates across the projects of a single organization.
///
/// The total number of sampled root transactions is kept at `total volume × target rate`, while
/// every project is given the same expected number of sampled events. Low-volume projects are
/// boosted and high-volume projects are reduced, within [`RateBounds`].
///
/// Unless overridden with [`with_target_rate`](Self::with_target_rate), the target rate is the
/// volume-weighted average of the projects' current blended rates, which keeps the number of
/// sampled events in the organization unchanged.
#[derive(Clone, Debug)]
pub struct AdjustedModel {
    projects: Vec<ProjectVolume>,
    target_rate: Option<f64>,
    bounds: RateBounds,
}

impl AdjustedModel {
    /// Creates a model for the given projects.
    pub fn new(projects: Vec<ProjectVolume>, bounds: RateBounds) -> Self {
        Self {
            projects,
            target_rate: None,
            bounds,
        }
    }

    /// Overrides the overall rate the organization should be sampled at.
    pub fn with_target_rate(mut self, target_rate: f64) -> Self {
        self.target_rate = Some(target_rate);
        self
    }

    /// Returns the projects this model was created with.
    pub fn projects(&self) -> &[ProjectVolume] {
        &self.projects
    }

    /// Total number of root transactions across all projects.
    pub fn total_volume(&self) -> u64 {
        self.projects.iter().map(|p| p.count_per_root).sum()
    }

    /// The volume-weighted average of the current blended sample rates.
    ///
    /// Falls back to the unweighted mean if no project has any volume.
    pub fn blended_rate(&self) -> f64 {
        if self.projects.is_empty() {
            return 0.0;
        }

        let total = self.total_volume();
        if total == 0 {
            let sum: f64 = self.projects.iter().map(|p| p.blended_sample_rate).sum();
            return sum / self.projects.len() as f64;
        }

        let sampled: f64 = self
            .projects
            .iter()
            .map(|p| p.count_per_root as f64 * p.blended_sample_rate)
            .sum();

        sampled / total as f64
    }

    /// The rate the organization is sampled at after adjustment.
    pub fn target_rate(&self) -> f64 {
        self.target_rate.unwrap_or_else(|| self.blended_rate())
    }

    /// Computes one adjusted rate per project, in input order.
    pub fn adjust_sample_rates(&self) -> Vec<AdjustedProjectRate> {
        if self.projects.is_empty() {
            return Vec::new();
        }

        let volumes: Vec<f64> = self
            .projects
            .iter()
            .map(|p| p.count_per_root as f64)
            .collect();

        let budget = self.total_volume() as f64 * self.target_rate();
        let solution = solver::solve(&volumes, budget, self.bounds);

        debug!(
            projects = self.projects.len(),
            budget,
            iterations = solution.iterations,
            converged = solution.converged,
            "adjusted project sample rates"
        );

        self.projects
            .iter()
            .zip(volumes)
            .map(|(project, volume)| AdjustedProjectRate {
                project_id: project.project_id,
                new_sample_rate: solution.rate(volume),
            })
            .collect()
    }
}
