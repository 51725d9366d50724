//! The rebalancer server application.
//!
//! This crate periodically redistributes the sample rate budget of organizations across their
//! projects, and of projects across their transactions. It contains the [`run`] function which
//! starts the scheduler and worker services, and the jobs they execute.
//!
//! # Jobs
//!
//! Rebalancing is split into four jobs communicating through a durable [job queue](JobQueue):
//!
//! ```text
//! scheduler ──> prioritise_projects ──> process_projects_sample_rates (per organization)
//!           └─> prioritise_transactions ──> process_transaction_biases (per project)
//! ```
//!
//! The root jobs page through observed volumes with the [`VolumeFetcher`] and fan out. The leaf
//! jobs compute rates with the models of `rebalancer-sampling` and write them to the shared cache
//! through the [`RatePublisher`], which also tells the ingestion edge to pick up the new rates.
//!
//! Every job runs under a [`JobPolicy`](rebalancer_system::JobPolicy) with a soft and a hard time
//! limit and retries after transient failures. See the [`Config`] documentation for the options.
#![warn(missing_docs)]

mod backends;
mod fetcher;
mod jobs;
mod publisher;
mod redis;
mod rules;
mod service;
mod services;
mod statsd;
mod upstream;

#[cfg(test)]
mod testutils;

use std::sync::Arc;

use anyhow::{Context, Result};
use rebalancer_config::Config;
use rebalancer_redis::AsyncRedisPool;
use rebalancer_system::Controller;

pub use self::backends::*;
pub use self::fetcher::*;
pub use self::jobs::*;
pub use self::publisher::*;
pub use self::redis::*;
pub use self::rules::*;
pub use self::service::*;
pub use self::services::*;
pub use self::upstream::*;

/// Runs the rebalancer services of the given role.
///
/// This blocks the current thread until a shutdown signal is received and all services have
/// stopped.
pub fn run(config: Config, role: Role) -> Result<()> {
    let config = Arc::new(config);
    let runtime = create_runtime("rebalancer")?;

    runtime.block_on(async {
        let controller = Controller::start(config.shutdown_timeout());
        let state = ServiceState::start(config.clone(), role, &controller)?;

        let shutdown = controller.handle().notified().await;
        rebalancer_log::info!(
            timeout = ?shutdown.timeout,
            "shutting down rebalancer services"
        );

        state.join().await;
        Ok(())
    })
}

/// Enqueues every periodic job once and returns the number of enqueued jobs.
pub fn schedule_once(config: Config) -> Result<usize> {
    let runtime = create_runtime("rebalancer-schedule")?;

    runtime.block_on(async {
        let pool = AsyncRedisPool::from_config(config.redis()).context(ServiceError::Redis)?;
        let queue = RedisJobQueue::new(pool, config.job_queue());
        let count = enqueue_root_jobs(&queue)
            .await
            .context("failed to enqueue jobs")?;
        Ok(count)
    })
}
