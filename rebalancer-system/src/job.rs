//! Runs jobs with retries and a soft time limit.

use std::error::Error;
use std::future::Future;
use std::time::Duration;

use rebalancer_statsd::metric;
use tokio::time::Instant;

use crate::statsd::{SystemCounters, SystemTimers};

/// Classifies job errors into transient and permanent failures.
///
/// Only transient failures, such as timeouts of a datastore, are retried by [`run_job`].
pub trait Retryable {
    /// Returns `true` if running the job again may succeed.
    fn is_transient(&self) -> bool;
}

/// Time limits and retries applied to every attempt of a job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JobPolicy {
    /// After this time, [`JobContext::soft_limit_exceeded`] asks the job to wrap up.
    pub soft_time_limit: Duration,
    /// After this time, the attempt is aborted.
    pub time_limit: Duration,
    /// Number of retries after transient failures.
    pub max_retries: u32,
    /// Delay before each retry.
    pub retry_delay: Duration,
}

/// State of a single job attempt, passed to the job function.
#[derive(Clone, Debug)]
pub struct JobContext {
    name: &'static str,
    attempt: u32,
    started: Instant,
    soft_deadline: Instant,
}

impl JobContext {
    /// Creates the context for the first attempt of a job starting now.
    pub fn new(name: &'static str, soft_time_limit: Duration) -> Self {
        let started = Instant::now();
        Self {
            name,
            attempt: 0,
            started,
            soft_deadline: started + soft_time_limit,
        }
    }

    /// The name of the running job.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Zero-based number of the attempt.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Time since the attempt started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Returns `true` once the soft time limit has passed.
    ///
    /// Jobs check this between units of work and stop early, keeping the work done so far.
    pub fn soft_limit_exceeded(&self) -> bool {
        Instant::now() >= self.soft_deadline
    }
}

/// The error returned by [`run_job`].
#[derive(Debug, thiserror::Error)]
pub enum JobFailure<E> {
    /// The job failed permanently or ran out of retries.
    #[error("job failed after {attempts} attempts")]
    Failed {
        /// Number of attempts made, including the first.
        attempts: u32,
        /// The error of the last attempt.
        #[source]
        error: E,
    },
    /// The job exceeded its hard time limit and was aborted.
    #[error("job exceeded its time limit of {}s", .0.as_secs())]
    TimedOut(Duration),
}

/// Runs a job under the given policy.
///
/// Every attempt receives a fresh [`JobContext`] and is aborted once it exceeds the hard time
/// limit. Attempts failing with a [transient](Retryable::is_transient) error are retried after
/// the retry delay, up to `max_retries` times. Time outs and permanent errors are not retried.
pub async fn run_job<F, Fut, E>(
    name: &'static str,
    policy: JobPolicy,
    mut job: F,
) -> Result<(), JobFailure<E>>
where
    F: FnMut(JobContext) -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Error + Retryable + 'static,
{
    let mut attempt = 0;

    loop {
        metric!(counter(SystemCounters::JobStart) += 1, job = name);

        let context = JobContext {
            attempt,
            ..JobContext::new(name, policy.soft_time_limit)
        };
        let started = context.started;

        let result = tokio::time::timeout(policy.time_limit, job(context)).await;

        let elapsed = started.elapsed();
        metric!(timer(SystemTimers::JobDuration) = elapsed, job = name);
        if elapsed > policy.soft_time_limit {
            metric!(counter(SystemCounters::JobSoftTimeout) += 1, job = name);
        }

        let error = match result {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(error)) => error,
            Err(_) => {
                metric!(counter(SystemCounters::JobHardTimeout) += 1, job = name);
                rebalancer_log::error!(
                    job = name,
                    attempt,
                    "job exceeded its time limit of {}s",
                    policy.time_limit.as_secs()
                );
                return Err(JobFailure::TimedOut(policy.time_limit));
            }
        };

        if !error.is_transient() || attempt >= policy.max_retries {
            metric!(counter(SystemCounters::JobFailed) += 1, job = name);
            return Err(JobFailure::Failed {
                attempts: attempt + 1,
                error,
            });
        }

        metric!(counter(SystemCounters::JobRetry) += 1, job = name);
        rebalancer_log::warn!(
            job = name,
            attempt,
            error = &error as &dyn Error,
            "job failed, retrying in {}s",
            policy.retry_delay.as_secs()
        );

        attempt += 1;
        tokio::time::sleep(policy.retry_delay).await;
    }
}
