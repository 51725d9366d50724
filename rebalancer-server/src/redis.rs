//! Redis-backed implementations of the rate cache, the invalidation channel and the job queue.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use rebalancer_common::{OrganizationId, ProjectId};
use rebalancer_redis::{AsyncRedisPool, redis};
use rebalancer_sampling::{AdjustedProjectRate, NamedRate, ProjectRatesKey, TransactionRatesKey};

use crate::backends::{
    CacheError, CachedTransactionRates, ConfigInvalidator, InvalidateProjectConfig, JobQueue,
    QueueError, RateCache,
};
use crate::jobs::Job;

fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

/// Rebalanced rates stored in Redis hashes.
///
/// See [`ProjectRatesKey`] and [`TransactionRatesKey`] for the layout of the hashes.
#[derive(Clone, Debug)]
pub struct RedisRateCache {
    pool: AsyncRedisPool,
}

impl RedisRateCache {
    /// Creates a cache on top of the given pool.
    pub fn new(pool: AsyncRedisPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RateCache for RedisRateCache {
    async fn set_project_rates(
        &self,
        org_id: OrganizationId,
        rates: &[AdjustedProjectRate],
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let key = ProjectRatesKey::new(org_id);

        let mut pipeline = redis::pipe();
        for rate in rates {
            pipeline
                .hset(
                    key.as_str(),
                    ProjectRatesKey::field(rate.project_id),
                    rate.new_sample_rate,
                )
                .ignore();
        }
        pipeline.pexpire(key.as_str(), ttl_millis(ttl)).ignore();

        self.pool.execute::<()>(&pipeline).await?;
        Ok(())
    }

    async fn set_transaction_rates(
        &self,
        org_id: OrganizationId,
        project_id: ProjectId,
        named_rates: &[NamedRate],
        default_rate: f64,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let key = TransactionRatesKey::new(org_id, project_id);

        // Names that dropped out of the explicit set must not linger.
        let mut pipeline = redis::pipe();
        pipeline.del(key.as_str()).ignore();
        for rate in named_rates {
            pipeline
                .hset(
                    key.as_str(),
                    TransactionRatesKey::name_field(&rate.transaction_name),
                    rate.sample_rate,
                )
                .ignore();
        }
        pipeline
            .hset(key.as_str(), TransactionRatesKey::DEFAULT_FIELD, default_rate)
            .ignore();
        pipeline.pexpire(key.as_str(), ttl_millis(ttl)).ignore();

        self.pool.execute::<()>(&pipeline).await?;
        Ok(())
    }

    async fn get_project_rate(
        &self,
        org_id: OrganizationId,
        project_id: ProjectId,
    ) -> Result<Option<f64>, CacheError> {
        let key = ProjectRatesKey::new(org_id);

        let rate = self
            .pool
            .query(
                redis::cmd("HGET")
                    .arg(key.as_str())
                    .arg(ProjectRatesKey::field(project_id)),
            )
            .await?;

        Ok(rate)
    }

    async fn get_transaction_rates(
        &self,
        org_id: OrganizationId,
        project_id: ProjectId,
    ) -> Result<CachedTransactionRates, CacheError> {
        let key = TransactionRatesKey::new(org_id, project_id);

        let fields: BTreeMap<String, f64> = self
            .pool
            .query(redis::cmd("HGETALL").arg(key.as_str()))
            .await?;

        let mut rates = CachedTransactionRates::default();
        for (field, sample_rate) in fields {
            match TransactionRatesKey::parse_field(&field) {
                Some(name) => rates.named_rates.push(NamedRate {
                    transaction_name: name.to_owned(),
                    sample_rate,
                }),
                None if field == TransactionRatesKey::DEFAULT_FIELD => {
                    rates.default_rate = Some(sample_rate)
                }
                None => {
                    rebalancer_log::debug!(key = %key, field = %field, "ignoring unknown rate field")
                }
            }
        }

        Ok(rates)
    }
}

/// Publishes project config invalidations as JSON on a Redis channel.
#[derive(Clone, Debug)]
pub struct RedisInvalidator {
    pool: AsyncRedisPool,
    channel: String,
}

impl RedisInvalidator {
    /// Creates an invalidator publishing on `channel`.
    pub fn new(pool: AsyncRedisPool, channel: impl Into<String>) -> Self {
        Self {
            pool,
            channel: channel.into(),
        }
    }
}

#[async_trait]
impl ConfigInvalidator for RedisInvalidator {
    async fn invalidate(&self, message: InvalidateProjectConfig) -> Result<(), CacheError> {
        let payload = serde_json::to_string(&message)?;

        self.pool
            .query::<()>(redis::cmd("PUBLISH").arg(&self.channel).arg(payload))
            .await?;

        Ok(())
    }
}

/// A job queue in a Redis list.
///
/// Jobs are pushed to the head of the list and popped from its tail, so they are processed in
/// the order they were enqueued. Any number of worker processes can share a queue.
#[derive(Clone, Debug)]
pub struct RedisJobQueue {
    pool: AsyncRedisPool,
    key: String,
}

impl RedisJobQueue {
    /// Creates a queue stored under `key`.
    pub fn new(pool: AsyncRedisPool, key: impl Into<String>) -> Self {
        Self {
            pool,
            key: key.into(),
        }
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, job: &Job) -> Result<(), QueueError> {
        let payload = serde_json::to_string(job)?;

        self.pool
            .query::<()>(redis::cmd("LPUSH").arg(&self.key).arg(payload))
            .await?;

        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Job>, QueueError> {
        let popped: Option<(String, String)> = self
            .pool
            .query(
                redis::cmd("BRPOP")
                    .arg(&self.key)
                    .arg(timeout.as_secs_f64()),
            )
            .await?;

        match popped {
            Some((_, payload)) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }
}
