//! Workers executing jobs from the queue.

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use rebalancer_statsd::metric;
use rebalancer_system::{JobFailure, Receiver, Service, ShutdownHandle};
use tokio::task::JoinSet;

use crate::backends::{JobQueue, QueueError};
use crate::jobs::{Job, JobError, JobRunner};
use crate::statsd::RebalancerCounters;

/// How long a worker waits for a job before checking for a shutdown.
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Resolves once jobs in flight must be abandoned.
///
/// On an immediate shutdown this is right away, on a graceful shutdown after its timeout.
async fn abandon_jobs(shutdown: &mut ShutdownHandle) {
    if let Some(timeout) = shutdown.notified().await.timeout {
        tokio::time::sleep(timeout).await;
    }
}

fn report(job: &Job, result: Result<(), JobFailure<JobError>>) {
    let name = job.kind().name();
    match result {
        Ok(()) => rebalancer_log::debug!(job = name, "job completed"),
        Err(JobFailure::Failed { attempts, error }) => rebalancer_log::error!(
            error = &error as &dyn Error,
            job = name,
            attempts,
            "job failed"
        ),
        // Already logged when the limit was hit.
        Err(JobFailure::TimedOut(_)) => (),
    }
}

/// Runs jobs from the queue until a shutdown.
///
/// A service runs `concurrency` independent loops. Each loop takes one job at a time from the
/// queue and runs it to completion under the job's policy. On a graceful shutdown, loops stop
/// taking new jobs and finish the job in flight unless the shutdown timeout passes first.
pub struct WorkerService {
    runner: Arc<JobRunner>,
    queue: Arc<dyn JobQueue>,
    concurrency: usize,
    shutdown: ShutdownHandle,
}

impl WorkerService {
    /// Creates a worker service running up to `concurrency` jobs at a time.
    pub fn new(
        runner: Arc<JobRunner>,
        queue: Arc<dyn JobQueue>,
        concurrency: usize,
        shutdown: ShutdownHandle,
    ) -> Self {
        Self {
            runner,
            queue,
            concurrency,
            shutdown,
        }
    }

    async fn work(
        worker: usize,
        runner: Arc<JobRunner>,
        queue: Arc<dyn JobQueue>,
        mut shutdown: ShutdownHandle,
    ) {
        while shutdown.get().is_none() {
            let job = match queue.dequeue(POLL_TIMEOUT).await {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(QueueError::Payload(error)) => {
                    metric!(counter(RebalancerCounters::JobDiscarded) += 1);
                    rebalancer_log::error!(
                        error = &error as &dyn Error,
                        worker,
                        "discarding invalid job payload"
                    );
                    continue;
                }
                Err(error) if error.is_transient() => {
                    rebalancer_log::error!(
                        error = &error as &dyn Error,
                        worker,
                        "failed to take job from the queue"
                    );
                    tokio::time::sleep(POLL_TIMEOUT).await;
                    continue;
                }
                Err(error) => {
                    rebalancer_log::error!(
                        error = &error as &dyn Error,
                        worker,
                        "job queue unavailable, stopping worker"
                    );
                    break;
                }
            };

            rebalancer_log::debug!(job = job.kind().name(), worker, "starting job");

            tokio::select! {
                biased;

                result = runner.run(&job) => report(&job, result),
                () = abandon_jobs(&mut shutdown) => {
                    rebalancer_log::warn!(
                        job = job.kind().name(),
                        worker,
                        "shutdown timeout reached, abandoning job"
                    );
                    break;
                }
            }
        }
    }
}

impl Service for WorkerService {
    type Interface = ();

    async fn run(self, _rx: Receiver<Self::Interface>) {
        let mut workers = JoinSet::new();
        for worker in 0..self.concurrency {
            workers.spawn(Self::work(
                worker,
                self.runner.clone(),
                self.queue.clone(),
                self.shutdown.clone(),
            ));
        }

        while let Some(result) = workers.join_next().await {
            if let Err(error) = result {
                rebalancer_log::error!(
                    error = &error as &dyn Error,
                    "worker terminated unexpectedly"
                );
            }
        }

        rebalancer_log::info!("workers stopped");
    }
}
