use std::sync::Arc;

use anyhow::{Context, Result};
use rebalancer_config::Config;
use rebalancer_redis::AsyncRedisPool;
use rebalancer_system::{Addr, Controller, ServiceRunner};
use tokio::runtime::Runtime;

use crate::jobs::{Backends, JobRunner};
use crate::redis::{RedisInvalidator, RedisJobQueue, RedisRateCache};
use crate::services::{RebalancerStats, Scheduler, SchedulerService, WorkerService};
use crate::upstream::UpstreamClient;

/// Indicates the type of failure of the server.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, thiserror::Error)]
pub enum ServiceError {
    /// Initializing the Redis pool failed.
    #[error("could not initialize redis pool")]
    Redis,

    /// The upstream client could not be created.
    #[error("could not initialize upstream client")]
    Upstream,

    /// The tokio runtime could not be created.
    #[error("could not create the runtime")]
    Runtime,
}

/// Selects the services started by a process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// The scheduler and the workers.
    All,
    /// Only workers executing queued jobs.
    Worker,
    /// Only the scheduler enqueueing the periodic jobs.
    Scheduler,
}

impl Role {
    fn runs_scheduler(self) -> bool {
        matches!(self, Self::All | Self::Scheduler)
    }

    fn runs_workers(self) -> bool {
        matches!(self, Self::All | Self::Worker)
    }
}

/// Constructs a tokio [`Runtime`] configured for running [services](rebalancer_system::Service).
pub fn create_runtime(name: &str) -> Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .thread_name(name)
        .enable_all()
        .build()
        .context(ServiceError::Runtime)
}

/// Creates the backends talking to the upstream API and Redis.
pub fn create_backends(config: &Config, redis_pool: AsyncRedisPool) -> Result<Backends> {
    let upstream = UpstreamClient::new(config.upstream_url(), config.upstream_timeout())
        .context(ServiceError::Upstream)?;
    let upstream = Arc::new(upstream);

    Ok(Backends {
        volumes: upstream.clone(),
        gates: upstream.clone(),
        entities: upstream.clone(),
        blended_rates: upstream,
        cache: Arc::new(RedisRateCache::new(redis_pool.clone())),
        invalidator: Arc::new(RedisInvalidator::new(
            redis_pool.clone(),
            config.invalidation_channel(),
        )),
        queue: Arc::new(RedisJobQueue::new(redis_pool, config.job_queue())),
    })
}

/// Server state.
pub struct ServiceState {
    config: Arc<Config>,
    scheduler: Option<Addr<Scheduler>>,
    runner: ServiceRunner,
}

impl ServiceState {
    /// Starts the services of the given role on the current runtime.
    pub fn start(config: Arc<Config>, role: Role, controller: &Controller) -> Result<Self> {
        let redis_pool = AsyncRedisPool::from_config(config.redis()).context(ServiceError::Redis)?;
        let backends = create_backends(&config, redis_pool.clone())?;

        let mut runner = ServiceRunner::new();
        runner.start(RebalancerStats::new(
            config.clone(),
            redis_pool,
            controller.handle(),
        ));

        let scheduler = role.runs_scheduler().then(|| {
            runner.start(SchedulerService::new(
                config.clone(),
                backends.queue.clone(),
                controller.handle(),
            ))
        });

        if role.runs_workers() {
            let queue = backends.queue.clone();
            let jobs = Arc::new(JobRunner::new(config.clone(), backends));
            runner.start(WorkerService::new(
                jobs,
                queue,
                config.job_concurrency(),
                controller.handle(),
            ));
        }

        rebalancer_log::info!(
            role = ?role,
            concurrency = config.job_concurrency(),
            "rebalancer services started"
        );

        Ok(Self {
            config,
            scheduler,
            runner,
        })
    }

    /// Returns a reference to the rebalancer configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the address of the scheduler, if this process runs it.
    pub fn scheduler(&self) -> Option<&Addr<Scheduler>> {
        self.scheduler.as_ref()
    }

    /// Waits until all services have stopped.
    pub async fn join(mut self) {
        self.runner.join().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles() {
        assert!(Role::All.runs_scheduler() && Role::All.runs_workers());
        assert!(Role::Worker.runs_workers() && !Role::Worker.runs_scheduler());
        assert!(Role::Scheduler.runs_scheduler() && !Role::Scheduler.runs_workers());
    }

    #[tokio::test]
    async fn test_invalid_upstream() {
        let config = Config::from_json_value(serde_json::json!({
            "upstream": {"url": "not a url"}
        }))
        .unwrap();
        let pool = AsyncRedisPool::single("redis://127.0.0.1:6379", &Default::default()).unwrap();

        let error = create_backends(&config, pool).err().unwrap();
        assert_eq!(
            error.downcast_ref::<ServiceError>(),
            Some(&ServiceError::Upstream)
        );
    }
}
