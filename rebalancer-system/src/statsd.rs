use rebalancer_statsd::{CounterMetric, TimerMetric};

/// Counter metrics for job execution.
pub enum SystemCounters {
    /// Number of job attempts started.
    ///
    /// This metric is tagged with:
    ///  - `job`: The name of the job.
    JobStart,
    /// Number of job attempts that failed transiently and will be retried.
    ///
    /// This metric is tagged with:
    ///  - `job`: The name of the job.
    JobRetry,
    /// Number of jobs that failed permanently or exhausted their retries.
    ///
    /// This metric is tagged with:
    ///  - `job`: The name of the job.
    JobFailed,
    /// Number of jobs aborted after exceeding their hard time limit.
    ///
    /// This metric is tagged with:
    ///  - `job`: The name of the job.
    JobHardTimeout,
    /// Number of job attempts that ran past their soft time limit.
    ///
    /// This metric is tagged with:
    ///  - `job`: The name of the job.
    JobSoftTimeout,
}

impl CounterMetric for SystemCounters {
    fn name(&self) -> &'static str {
        match *self {
            SystemCounters::JobStart => "jobs.start",
            SystemCounters::JobRetry => "jobs.retry",
            SystemCounters::JobFailed => "jobs.failed",
            SystemCounters::JobHardTimeout => "jobs.hard_timeout",
            SystemCounters::JobSoftTimeout => "jobs.soft_timeout",
        }
    }
}

/// Timer metrics for job execution.
pub enum SystemTimers {
    /// Duration of a single job attempt, including attempts that fail.
    ///
    /// This metric is tagged with:
    ///  - `job`: The name of the job.
    JobDuration,
}

impl TimerMetric for SystemTimers {
    fn name(&self) -> &'static str {
        match *self {
            SystemTimers::JobDuration => "jobs.duration",
        }
    }
}
