//! Periodic scheduling of the root jobs.

use std::sync::Arc;
use std::time::Duration;

use rebalancer_config::{Config, JobKind};
use rebalancer_system::{
    AsyncResponse, FromMessage, Interface, Receiver, Sender, Service, ShutdownHandle,
};
use tokio::time::Instant;

use crate::backends::{JobQueue, QueueError};
use crate::jobs::{Job, enqueue};

/// Enqueues the root job of the given kind immediately, outside of its schedule.
///
/// Responds `true` if the job was enqueued, and `false` if the kind has no root job or the queue
/// rejected it.
#[derive(Clone, Copy, Debug)]
pub struct TriggerJob(pub JobKind);

/// Messages of the [`SchedulerService`].
#[derive(Debug)]
pub enum Scheduler {
    /// See [`TriggerJob`].
    TriggerJob(TriggerJob, Sender<bool>),
}

impl Interface for Scheduler {}

impl FromMessage<TriggerJob> for Scheduler {
    type Response = AsyncResponse<bool>;

    fn from_message(message: TriggerJob, sender: Sender<bool>) -> Self {
        Self::TriggerJob(message, sender)
    }
}

/// Enqueues every root job once.
///
/// Returns the number of enqueued jobs.
pub async fn enqueue_root_jobs(queue: &dyn JobQueue) -> Result<usize, QueueError> {
    let mut count = 0;
    for job in JobKind::ALL.into_iter().filter_map(Job::root) {
        enqueue(queue, &job).await?;
        count += 1;
    }
    Ok(count)
}

#[derive(Debug)]
struct ScheduleEntry {
    job: Job,
    interval: Duration,
    next: Instant,
}

/// Enqueues the root jobs at their configured intervals.
///
/// Every root job is enqueued once when the service starts. Later runs are spaced by the job's
/// interval, and runs missed while the queue was unavailable are skipped rather than caught up.
pub struct SchedulerService {
    config: Arc<Config>,
    queue: Arc<dyn JobQueue>,
    shutdown: ShutdownHandle,
}

impl SchedulerService {
    /// Creates a scheduler that stops once `shutdown` is notified.
    pub fn new(config: Arc<Config>, queue: Arc<dyn JobQueue>, shutdown: ShutdownHandle) -> Self {
        Self {
            config,
            queue,
            shutdown,
        }
    }

    fn entries(&self) -> Vec<ScheduleEntry> {
        let now = Instant::now();
        JobKind::ALL
            .into_iter()
            .filter_map(|kind| {
                Some(ScheduleEntry {
                    job: Job::root(kind)?,
                    interval: self.config.schedule_interval(kind)?,
                    next: now,
                })
            })
            .collect()
    }

    async fn enqueue(&self, job: &Job) -> bool {
        match enqueue(self.queue.as_ref(), job).await {
            Ok(()) => {
                rebalancer_log::info!(job = job.kind().name(), "scheduled job");
                true
            }
            Err(error) => {
                rebalancer_log::error!(
                    error = &error as &dyn std::error::Error,
                    job = job.kind().name(),
                    "failed to schedule job"
                );
                false
            }
        }
    }

    async fn run_due(&self, entries: &mut [ScheduleEntry]) {
        let now = Instant::now();
        for entry in entries.iter_mut().filter(|entry| entry.next <= now) {
            self.enqueue(&entry.job).await;

            while entry.next <= now {
                entry.next += entry.interval;
            }
        }
    }

    async fn handle_message(&self, message: Scheduler) {
        match message {
            Scheduler::TriggerJob(TriggerJob(kind), sender) => {
                let enqueued = match Job::root(kind) {
                    Some(job) => self.enqueue(&job).await,
                    None => false,
                };
                sender.send(enqueued);
            }
        }
    }
}

impl Service for SchedulerService {
    type Interface = Scheduler;

    async fn run(self, mut rx: Receiver<Self::Interface>) {
        let mut entries = self.entries();
        let mut shutdown = self.shutdown.clone();

        loop {
            let next = entries.iter().map(|entry| entry.next).min();
            let due = async {
                match next {
                    Some(next) => tokio::time::sleep_until(next).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;

                _ = shutdown.notified() => break,
                Some(message) = rx.recv() => self.handle_message(message).await,
                () = due => self.run_due(&mut entries).await,
            }
        }

        rebalancer_log::info!("scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use rebalancer_system::{Controller, ShutdownMode};

    use super::*;
    use crate::testutils::LocalJobQueue;

    fn scheduler(
        queue: Arc<LocalJobQueue>,
        controller: &Controller,
    ) -> rebalancer_system::Addr<Scheduler> {
        scheduler_with(
            serde_json::json!({"prioritise_projects": 60, "prioritise_transactions": 120}),
            queue,
            controller,
        )
    }

    fn scheduler_with(
        schedule: serde_json::Value,
        queue: Arc<LocalJobQueue>,
        controller: &Controller,
    ) -> rebalancer_system::Addr<Scheduler> {
        let config = Config::from_json_value(serde_json::json!({"schedule": schedule})).unwrap();
        SchedulerService::new(Arc::new(config), queue, controller.handle()).start_detached()
    }

    fn count(queue: &LocalJobQueue, job: &Job) -> usize {
        queue.jobs().iter().filter(|queued| *queued == job).count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_schedule() {
        let queue = Arc::new(LocalJobQueue::default());
        let controller = Controller::new(Duration::from_secs(1));
        let _addr = scheduler(queue.clone(), &controller);

        tokio::time::sleep(Duration::from_secs(130)).await;
        controller.shutdown(ShutdownMode::Graceful);

        // Runs at 0, 60 and 120 seconds, and at 0 and 120 seconds.
        assert_eq!(count(&queue, &Job::PrioritiseProjects), 3);
        assert_eq!(count(&queue, &Job::PrioritiseTransactions), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_on_shutdown() {
        let queue = Arc::new(LocalJobQueue::default());
        let controller = Controller::new(Duration::from_secs(1));
        let addr = scheduler(queue.clone(), &controller);

        tokio::time::sleep(Duration::from_secs(1)).await;
        controller.shutdown(ShutdownMode::Graceful);
        tokio::time::sleep(Duration::from_secs(600)).await;

        assert_eq!(queue.jobs().len(), 2);
        assert!(addr.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_disables_job() {
        let queue = Arc::new(LocalJobQueue::default());
        let controller = Controller::new(Duration::from_secs(1));
        let addr = scheduler_with(
            serde_json::json!({"prioritise_projects": 0, "prioritise_transactions": 60}),
            queue.clone(),
            &controller,
        );

        tokio::time::sleep(Duration::from_secs(90)).await;
        controller.shutdown(ShutdownMode::Graceful);
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(count(&queue, &Job::PrioritiseProjects), 0);
        assert_eq!(count(&queue, &Job::PrioritiseTransactions), 2);
        assert!(addr.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_job() {
        let queue = Arc::new(LocalJobQueue::default());
        let controller = Controller::new(Duration::from_secs(1));
        let addr = scheduler(queue.clone(), &controller);

        tokio::time::sleep(Duration::from_secs(1)).await;
        let root = addr.send(TriggerJob(JobKind::PrioritiseTransactions)).await;
        let child = addr.send(TriggerJob(JobKind::ProcessTransactionBiases)).await;

        assert_eq!(root, Ok(true));
        assert_eq!(child, Ok(false));
        assert_eq!(count(&queue, &Job::PrioritiseTransactions), 2);
    }

    #[tokio::test]
    async fn test_enqueue_root_jobs() {
        let queue = LocalJobQueue::default();

        let count = enqueue_root_jobs(&queue).await.unwrap();

        assert_eq!(count, 2);
        assert_eq!(
            queue.jobs(),
            [Job::PrioritiseProjects, Job::PrioritiseTransactions]
        );
    }
}
