//! Writes adjusted rates to the cache and invalidates affected project configs.

use std::sync::Arc;
use std::time::Duration;

use rebalancer_common::{OrganizationId, ProjectId};
use rebalancer_sampling::{AdjustedProjectRate, NamedRate};
use rebalancer_statsd::metric;
use tokio::time::Instant;

use crate::backends::{CacheError, ConfigInvalidator, InvalidateProjectConfig, RateCache};
use crate::statsd::{RebalancerCounters, RebalancerTimers};

/// Invalidation trigger after project rates of an organization changed.
pub const PROJECT_BIAS_TRIGGER: &str = "dynamic_sampling_prioritise_project_bias";

/// Invalidation trigger after transaction rates of a project changed.
pub const TRANSACTION_BIAS_TRIGGER: &str = "dynamic_sampling_prioritise_transaction_bias";

/// Writes rebalanced rates to the shared cache and invalidates the affected project configs.
///
/// All writes overwrite previous values, so publishing the same rates again after a partial
/// failure leaves the cache in the same state. Invalidations are only sent once the cache write
/// has succeeded, so the ingestion edge never recomputes a config before the new rates are
/// readable.
#[derive(Clone)]
pub struct RatePublisher {
    cache: Arc<dyn RateCache>,
    invalidator: Arc<dyn ConfigInvalidator>,
    ttl: Duration,
}

impl RatePublisher {
    /// Creates a publisher writing project rates with the given expiry.
    pub fn new(
        cache: Arc<dyn RateCache>,
        invalidator: Arc<dyn ConfigInvalidator>,
        ttl: Duration,
    ) -> Self {
        Self {
            cache,
            invalidator,
            ttl,
        }
    }

    /// Stores the rates of an organization's projects and invalidates each project's config.
    pub async fn publish_project_rates(
        &self,
        org_id: OrganizationId,
        rates: &[AdjustedProjectRate],
    ) -> Result<(), CacheError> {
        if rates.is_empty() {
            return Ok(());
        }

        let started = Instant::now();
        self.cache.set_project_rates(org_id, rates, self.ttl).await?;

        for rate in rates {
            self.invalidate(rate.project_id, PROJECT_BIAS_TRIGGER).await?;
        }

        metric!(timer(RebalancerTimers::Publish) = started.elapsed(), kind = "projects");
        rebalancer_log::debug!(
            org_id = %org_id,
            projects = rates.len(),
            "published project rates"
        );

        Ok(())
    }

    /// Replaces the transaction rates of a project and invalidates its config.
    pub async fn publish_transaction_rates(
        &self,
        org_id: OrganizationId,
        project_id: ProjectId,
        named_rates: &[NamedRate],
        default_rate: f64,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let started = Instant::now();
        self.cache
            .set_transaction_rates(org_id, project_id, named_rates, default_rate, ttl)
            .await?;

        self.invalidate(project_id, TRANSACTION_BIAS_TRIGGER).await?;

        metric!(timer(RebalancerTimers::Publish) = started.elapsed(), kind = "transactions");
        rebalancer_log::debug!(
            org_id = %org_id,
            project_id = %project_id,
            named = named_rates.len(),
            default_rate,
            "published transaction rates"
        );

        Ok(())
    }

    async fn invalidate(
        &self,
        project_id: ProjectId,
        trigger: &'static str,
    ) -> Result<(), CacheError> {
        let message = InvalidateProjectConfig {
            project_id,
            trigger: trigger.to_owned(),
        };

        self.invalidator.invalidate(message).await?;
        metric!(counter(RebalancerCounters::Invalidations) += 1, trigger = trigger);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{MemoryRateCache, RecordingInvalidator};

    const TTL: Duration = Duration::from_secs(86_400);

    fn publisher() -> (RatePublisher, Arc<MemoryRateCache>, Arc<RecordingInvalidator>) {
        let cache = Arc::new(MemoryRateCache::default());
        let invalidator = Arc::new(RecordingInvalidator::default());
        let publisher = RatePublisher::new(cache.clone(), invalidator.clone(), TTL);
        (publisher, cache, invalidator)
    }

    fn rate(project_id: u64, new_sample_rate: f64) -> AdjustedProjectRate {
        AdjustedProjectRate {
            project_id: ProjectId::new(project_id),
            new_sample_rate,
        }
    }

    #[tokio::test]
    async fn test_publish_project_rates() {
        let (publisher, cache, invalidator) = publisher();
        let org_id = OrganizationId::new(1);

        publisher
            .publish_project_rates(org_id, &[rate(10, 1.0), rate(11, 0.45)])
            .await
            .unwrap();

        let cached = cache.get_project_rate(org_id, ProjectId::new(11)).await;
        assert_eq!(cached.unwrap(), Some(0.45));
        let key = rebalancer_sampling::ProjectRatesKey::new(org_id);
        assert_eq!(cache.ttl(key.as_str()), Some(TTL));

        let messages = invalidator.messages();
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|m| m.trigger == PROJECT_BIAS_TRIGGER));
        assert_eq!(messages[0].project_id, ProjectId::new(10));
    }

    #[tokio::test]
    async fn test_publish_is_idempotent() {
        let (publisher, cache, _) = publisher();
        let org_id = OrganizationId::new(1);
        let rates = [rate(10, 1.0), rate(11, 0.45)];

        publisher.publish_project_rates(org_id, &rates).await.unwrap();
        let once = cache.snapshot();

        publisher.publish_project_rates(org_id, &rates).await.unwrap();
        assert_eq!(cache.snapshot(), once);
    }

    #[tokio::test]
    async fn test_publish_nothing() {
        let (publisher, cache, invalidator) = publisher();

        publisher
            .publish_project_rates(OrganizationId::new(1), &[])
            .await
            .unwrap();

        assert!(cache.snapshot().is_empty());
        assert!(invalidator.messages().is_empty());
    }

    #[tokio::test]
    async fn test_publish_transaction_rates_replaces_names() {
        let (publisher, cache, invalidator) = publisher();
        let org_id = OrganizationId::new(1);
        let project_id = ProjectId::new(10);

        let first = [
            NamedRate {
                transaction_name: "/a".to_owned(),
                sample_rate: 0.1,
            },
            NamedRate {
                transaction_name: "/b".to_owned(),
                sample_rate: 1.0,
            },
        ];
        publisher
            .publish_transaction_rates(org_id, project_id, &first, 0.2, TTL)
            .await
            .unwrap();

        let second = [NamedRate {
            transaction_name: "/c".to_owned(),
            sample_rate: 0.5,
        }];
        publisher
            .publish_transaction_rates(org_id, project_id, &second, 0.3, TTL)
            .await
            .unwrap();

        let cached = cache.get_transaction_rates(org_id, project_id).await.unwrap();
        assert_eq!(cached.named_rates, second);
        assert_eq!(cached.default_rate, Some(0.3));

        let messages = invalidator.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].trigger, TRANSACTION_BIAS_TRIGGER);
    }

    #[tokio::test]
    async fn test_no_invalidation_after_failed_write() {
        let (publisher, cache, invalidator) = publisher();
        cache.fail_next_writes(1);

        let result = publisher
            .publish_project_rates(OrganizationId::new(1), &[rate(10, 1.0)])
            .await;

        assert!(result.unwrap_err().is_transient());
        assert!(invalidator.messages().is_empty());
    }
}
