use rebalancer_sampling::SamplingRule;

use crate::backends::{CacheError, Project, RateCache};

/// Returns the uniform sampling rule of a project.
///
/// The rule carries the rebalanced rate of the project if one is cached. Rebalancing is an
/// optimization on top of the static plan, so without a cached rate the rule falls back to
/// `base_rate`.
pub async fn uniform_rule(
    project: &Project,
    base_rate: f64,
    cache: &dyn RateCache,
) -> Result<SamplingRule, CacheError> {
    let cached = cache
        .get_project_rate(project.organization_id, project.id)
        .await?;

    if cached.is_none() {
        rebalancer_log::trace!(project_id = %project.id, "no rebalanced rate, using base rate");
    }

    Ok(SamplingRule::uniform(cached.unwrap_or(base_rate)))
}
