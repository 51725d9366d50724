//! The four rebalancing jobs.
//!
//! Two root jobs page through observed volumes and fan out into one job per organization or
//! project:
//!
//!  - `prioritise_projects` enqueues a `process_projects_sample_rates` job per organization,
//!    which rebalances and publishes the rates of that organization's projects.
//!  - `prioritise_transactions` enqueues a `process_transaction_biases` job per project of every
//!    enabled organization, which rebalances and publishes that project's transaction rates.
//!
//! Jobs communicate only through their serialized arguments and the rate cache, so any number of
//! workers can run them concurrently and in any order.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::pin;
use std::sync::Arc;

use futures::future;
use futures::stream::TryStreamExt;
use rebalancer_common::{OrganizationId, ProjectId};
use rebalancer_config::{Config, JobKind};
use rebalancer_sampling::{
    AdjustedModel, ProjectTransactions, ProjectVolume, RateBounds, adjust_sample_rate,
};
use rebalancer_statsd::metric;
use rebalancer_system::{JobContext, JobFailure, JobPolicy, Retryable, run_job};
use serde::{Deserialize, Serialize};

use crate::backends::{
    BlendedRates, CacheError, ConfigInvalidator, EntityLookup, Feature, FeatureGates, FetchError,
    JobQueue, LookupError, Project, QueueError, RateCache, VolumeQuery,
};
use crate::fetcher::{OrgProjectCounts, VolumeFetcher};
use crate::publisher::RatePublisher;
use crate::statsd::{RebalancerCounters, RebalancerDistributions, RebalancerTimers};

/// A unit of work in the job queue, together with its arguments.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum Job {
    /// Fans out into one [`Job::ProcessProjectsSampleRates`] per organization.
    PrioritiseProjects,
    /// Rebalances the project rates of one organization.
    ProcessProjectsSampleRates(OrgProjectCounts),
    /// Fans out into one [`Job::ProcessTransactionBiases`] per project.
    PrioritiseTransactions,
    /// Rebalances the transaction rates of one project.
    ProcessTransactionBiases(ProjectTransactions),
}

impl Job {
    /// Returns the kind of this job.
    pub fn kind(&self) -> JobKind {
        match self {
            Self::PrioritiseProjects => JobKind::PrioritiseProjects,
            Self::ProcessProjectsSampleRates(_) => JobKind::ProcessProjectsSampleRates,
            Self::PrioritiseTransactions => JobKind::PrioritiseTransactions,
            Self::ProcessTransactionBiases(_) => JobKind::ProcessTransactionBiases,
        }
    }

    /// Returns the root job of a periodic job kind.
    pub fn root(kind: JobKind) -> Option<Self> {
        match kind {
            JobKind::PrioritiseProjects => Some(Self::PrioritiseProjects),
            JobKind::PrioritiseTransactions => Some(Self::PrioritiseTransactions),
            JobKind::ProcessProjectsSampleRates | JobKind::ProcessTransactionBiases => None,
        }
    }
}

/// Pushes a job to the queue.
pub(crate) async fn enqueue(queue: &dyn JobQueue, job: &Job) -> Result<(), QueueError> {
    queue.enqueue(job).await?;
    metric!(
        counter(RebalancerCounters::JobEnqueued) += 1,
        job = job.kind().name()
    );
    Ok(())
}

/// An error of a single job attempt.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Volumes could not be fetched.
    #[error("failed to fetch volumes")]
    Fetch(#[from] FetchError),
    /// An organization, project, feature flag or blended rate could not be looked up.
    #[error("failed to look up entities")]
    Lookup(#[from] LookupError),
    /// Rates could not be published.
    #[error("failed to publish rates")]
    Publish(#[from] CacheError),
    /// A follow-up job could not be enqueued.
    #[error("failed to enqueue job")]
    Queue(#[from] QueueError),
}

impl Retryable for JobError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Fetch(error) => error.is_transient(),
            Self::Lookup(error) => error.is_transient(),
            Self::Publish(error) => error.is_transient(),
            Self::Queue(error) => error.is_transient(),
        }
    }
}

/// The collaborators of the jobs.
#[derive(Clone)]
pub struct Backends {
    /// Source of observed volumes.
    pub volumes: Arc<dyn VolumeQuery>,
    /// Feature flags per organization.
    pub gates: Arc<dyn FeatureGates>,
    /// Organization and project records.
    pub entities: Arc<dyn EntityLookup>,
    /// Blended sample rates per project.
    pub blended_rates: Arc<dyn BlendedRates>,
    /// Where rebalanced rates are written.
    pub cache: Arc<dyn RateCache>,
    /// Where project config invalidations are sent.
    pub invalidator: Arc<dyn ConfigInvalidator>,
    /// The job queue for fanned out jobs.
    pub queue: Arc<dyn JobQueue>,
}

/// The gate decision of the organization seen last in an ordered sequence.
///
/// Consecutive items of the same organization reuse the decision, so the gate is evaluated once
/// per organization.
#[derive(Clone, Copy, Debug, Default)]
struct GateMemo {
    last: Option<(OrganizationId, bool)>,
}

impl GateMemo {
    /// Returns the decision for `org_id` and the memo for the next item.
    async fn advance<F, Fut>(
        self,
        org_id: OrganizationId,
        evaluate: F,
    ) -> Result<(Self, bool), JobError>
    where
        F: FnOnce(OrganizationId) -> Fut,
        Fut: Future<Output = Result<bool, JobError>>,
    {
        match self.last {
            Some((last, enabled)) if last == org_id => Ok((self, enabled)),
            _ => {
                let enabled = evaluate(org_id).await?;
                let memo = Self {
                    last: Some((org_id, enabled)),
                };
                Ok((memo, enabled))
            }
        }
    }
}

/// Executes jobs against the configured backends.
pub struct JobRunner {
    config: Arc<Config>,
    fetcher: VolumeFetcher,
    publisher: RatePublisher,
    gates: Arc<dyn FeatureGates>,
    entities: Arc<dyn EntityLookup>,
    blended_rates: Arc<dyn BlendedRates>,
    queue: Arc<dyn JobQueue>,
    bounds: RateBounds,
}

impl JobRunner {
    /// Creates a runner for the given configuration.
    pub fn new(config: Arc<Config>, backends: Backends) -> Self {
        Self {
            fetcher: VolumeFetcher::new(backends.volumes, &config),
            publisher: RatePublisher::new(
                backends.cache,
                backends.invalidator,
                config.cache_ttl(),
            ),
            gates: backends.gates,
            entities: backends.entities,
            blended_rates: backends.blended_rates,
            queue: backends.queue,
            bounds: config.sampling_bounds(),
            config,
        }
    }

    /// Returns the retry and time limit policy of a job kind.
    pub fn policy(&self, kind: JobKind) -> JobPolicy {
        JobPolicy {
            soft_time_limit: self.config.job_soft_time_limit(kind),
            time_limit: self.config.job_time_limit(kind),
            max_retries: self.config.job_max_retries(),
            retry_delay: self.config.job_retry_delay(),
        }
    }

    /// Runs a job to completion under its policy, retrying transient failures.
    pub async fn run(&self, job: &Job) -> Result<(), JobFailure<JobError>> {
        let kind = job.kind();
        run_job(kind.name(), self.policy(kind), move |context| {
            self.execute(job, context)
        })
        .await
    }

    /// Looks up the blended sample rate of a project, ignoring rates outside of `[0, 1]`.
    async fn blended_rate(&self, project: &Project) -> Result<Option<f64>, JobError> {
        let rate = self.blended_rates.get_blended_sample_rate(project).await?;

        Ok(rate.filter(|&rate| {
            let valid = (0.0..=1.0).contains(&rate);
            if !valid {
                rebalancer_log::warn!(
                    project_id = %project.id,
                    rate,
                    "ignoring blended sample rate outside of [0, 1]"
                );
            }
            valid
        }))
    }

    /// Runs a single attempt of a job.
    pub async fn execute(&self, job: &Job, context: JobContext) -> Result<(), JobError> {
        match job {
            Job::PrioritiseProjects => self.prioritise_projects(&context).await,
            Job::ProcessProjectsSampleRates(counts) => {
                self.process_projects_sample_rates(counts).await
            }
            Job::PrioritiseTransactions => self.prioritise_transactions(&context).await,
            Job::ProcessTransactionBiases(transactions) => {
                self.process_transaction_biases(transactions).await
            }
        }
    }

    async fn prioritise_projects(&self, context: &JobContext) -> Result<(), JobError> {
        let mut organizations = pin!(self.fetcher.fetch_project_volumes());
        let mut scheduled = 0;

        while let Some(counts) = organizations.try_next().await? {
            enqueue(self.queue.as_ref(), &Job::ProcessProjectsSampleRates(counts)).await?;
            scheduled += 1;

            if context.soft_limit_exceeded() {
                rebalancer_log::warn!(
                    job = context.name(),
                    scheduled,
                    "soft time limit exceeded, stopping early"
                );
                break;
            }
        }

        rebalancer_log::info!(organizations = scheduled, "scheduled project rebalancing");
        Ok(())
    }

    async fn process_projects_sample_rates(
        &self,
        counts: &OrgProjectCounts,
    ) -> Result<(), JobError> {
        let org_id = counts.org_id;
        if !self
            .is_enabled(org_id, Feature::PrioritiseByProjectBias)
            .await?
        {
            return Ok(());
        }

        let counts_by_project: BTreeMap<ProjectId, u64> = counts
            .projects
            .iter()
            .map(|count| (count.project_id, count.count_per_root))
            .collect();
        let project_ids: Vec<_> = counts_by_project.keys().copied().collect();

        let mut projects = self.entities.get_many_projects(&project_ids).await?;
        projects.sort_by_key(|project| project.id);

        let mut volumes = Vec::with_capacity(projects.len());
        for project in &projects {
            let Some(&count_per_root) = counts_by_project.get(&project.id) else {
                continue;
            };

            match self.blended_rate(project).await? {
                Some(blended_sample_rate) => volumes.push(ProjectVolume {
                    project_id: project.id,
                    count_per_root,
                    blended_sample_rate,
                }),
                None => {
                    metric!(counter(RebalancerCounters::ProjectsSkippedNoRate) += 1);
                    rebalancer_log::debug!(
                        org_id = %org_id,
                        project_id = %project.id,
                        "skipping project without blended sample rate"
                    );
                }
            }
        }

        if volumes.is_empty() {
            return Ok(());
        }

        let mut model = AdjustedModel::new(volumes, self.bounds);
        if let Some(target_rate) = self.config.target_overall_rate() {
            model = model.with_target_rate(target_rate);
        }

        let rates = metric!(timer(RebalancerTimers::ModelProjects), {
            model.adjust_sample_rates()
        });
        metric!(
            distribution(RebalancerDistributions::ModelEntities) = rates.len() as u64,
            model = "projects"
        );

        self.publisher.publish_project_rates(org_id, &rates).await?;
        Ok(())
    }

    async fn prioritise_transactions(&self, context: &JobContext) -> Result<(), JobError> {
        let scheduled = self
            .fetcher
            .fetch_transaction_volumes()
            .map_err(JobError::from)
            .try_take_while(|_| future::ready(Ok(!context.soft_limit_exceeded())))
            .try_fold(
                (GateMemo::default(), 0usize),
                move |(memo, scheduled), transactions| async move {
                    let (memo, enabled) = memo
                        .advance(transactions.org_id, |org_id| {
                            self.is_enabled(org_id, Feature::PrioritiseByTransactionBias)
                        })
                        .await?;

                    if !enabled {
                        return Ok((memo, scheduled));
                    }

                    let job = Job::ProcessTransactionBiases(transactions);
                    enqueue(self.queue.as_ref(), &job).await?;
                    Ok::<_, JobError>((memo, scheduled + 1))
                },
            )
            .await?
            .1;

        if context.soft_limit_exceeded() {
            rebalancer_log::warn!(
                job = context.name(),
                scheduled,
                "soft time limit exceeded, stopping early"
            );
        }

        rebalancer_log::info!(projects = scheduled, "scheduled transaction rebalancing");
        Ok(())
    }

    async fn process_transaction_biases(
        &self,
        transactions: &ProjectTransactions,
    ) -> Result<(), JobError> {
        let ProjectTransactions {
            org_id,
            project_id,
            ref transaction_counts,
        } = *transactions;

        let Some(project) = self.entities.get_project(project_id).await? else {
            rebalancer_log::debug!(project_id = %project_id, "skipping unknown project");
            return Ok(());
        };

        let Some(sample_rate) = self.blended_rate(&project).await? else {
            metric!(counter(RebalancerCounters::TransactionsSkippedNoRate) += 1);
            rebalancer_log::debug!(
                project_id = %project_id,
                "skipping project without blended sample rate"
            );
            return Ok(());
        };

        let (named_rates, default_rate) = metric!(timer(RebalancerTimers::ModelTransactions), {
            adjust_sample_rate(
                transaction_counts,
                sample_rate,
                self.config.max_explicit_transactions(),
                self.bounds,
            )
        });
        metric!(
            distribution(RebalancerDistributions::ModelEntities) = named_rates.len() as u64,
            model = "transactions"
        );

        self.publisher
            .publish_transaction_rates(
                org_id,
                project_id,
                &named_rates,
                default_rate,
                self.config.cache_ttl(),
            )
            .await?;

        Ok(())
    }

    /// Returns `true` if the organization exists and has the feature enabled.
    async fn is_enabled(
        &self,
        org_id: OrganizationId,
        feature: Feature,
    ) -> Result<bool, JobError> {
        let Some(organization) = self.entities.get_organization(org_id).await? else {
            rebalancer_log::debug!(org_id = %org_id, "skipping unknown organization");
            return Ok(false);
        };

        let enabled = self.gates.has(feature, organization.id).await?;
        if !enabled {
            metric!(
                counter(RebalancerCounters::GateDisabled) += 1,
                feature = feature.as_str()
            );
        }

        Ok(enabled)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rebalancer_sampling::TransactionVolume;

    use super::*;
    use crate::fetcher::ProjectCount;
    use crate::publisher::{PROJECT_BIAS_TRIGGER, TRANSACTION_BIAS_TRIGGER};
    use crate::testutils::{TestBackends, project_row, transaction_row};

    fn config(value: serde_json::Value) -> Arc<Config> {
        Arc::new(Config::from_json_value(value).unwrap())
    }

    fn default_config() -> Arc<Config> {
        config(serde_json::json!({
            "sampling": {"min_rate": 0.01, "max_rate": 1.0}
        }))
    }

    fn org_counts(org_id: u64, projects: &[(u64, u64)]) -> OrgProjectCounts {
        OrgProjectCounts {
            org_id: OrganizationId::new(org_id),
            projects: projects
                .iter()
                .map(|&(project_id, count_per_root)| ProjectCount {
                    project_id: ProjectId::new(project_id),
                    count_per_root,
                })
                .collect(),
        }
    }

    #[test]
    fn test_job_serialization() {
        let jobs = vec![
            Job::PrioritiseProjects,
            Job::ProcessProjectsSampleRates(org_counts(1, &[(10, 100), (11, 1000)])),
            Job::PrioritiseTransactions,
            Job::ProcessTransactionBiases(ProjectTransactions {
                org_id: OrganizationId::new(1),
                project_id: ProjectId::new(10),
                transaction_counts: vec![TransactionVolume::new("/api/users/", 42)],
            }),
        ];

        insta::assert_json_snapshot!(jobs, @r#"
        [
          {
            "job": "prioritise_projects"
          },
          {
            "job": "process_projects_sample_rates",
            "org_id": 1,
            "projects": [
              {
                "project_id": 10,
                "count_per_root": 100
              },
              {
                "project_id": 11,
                "count_per_root": 1000
              }
            ]
          },
          {
            "job": "prioritise_transactions"
          },
          {
            "job": "process_transaction_biases",
            "org_id": 1,
            "project_id": 10,
            "transaction_counts": [
              {
                "transaction_name": "/api/users/",
                "count": 42
              }
            ]
          }
        ]
        "#);

        let json = serde_json::to_string(&jobs).unwrap();
        let parsed: Vec<Job> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, jobs);
    }

    #[test]
    fn test_root_jobs() {
        let roots: Vec<_> = JobKind::ALL.into_iter().filter_map(Job::root).collect();
        assert_eq!(roots, [Job::PrioritiseProjects, Job::PrioritiseTransactions]);
        assert!(roots.iter().all(|job| Job::root(job.kind()).as_ref() == Some(job)));
    }

    #[tokio::test]
    async fn test_prioritise_projects_fans_out() {
        let backends = TestBackends::new().with_project_rows(vec![
            project_row(1, 10, 100),
            project_row(1, 11, 1000),
            project_row(2, 20, 5),
        ]);
        let runner = JobRunner::new(default_config(), backends.backends());

        runner.run(&Job::PrioritiseProjects).await.unwrap();

        assert_eq!(
            backends.queue.jobs(),
            [
                Job::ProcessProjectsSampleRates(org_counts(1, &[(10, 100), (11, 1000)])),
                Job::ProcessProjectsSampleRates(org_counts(2, &[(20, 5)])),
            ]
        );
    }

    #[tokio::test]
    async fn test_process_projects_sample_rates() {
        let backends = TestBackends::new()
            .with_organization(1, true)
            .with_project(1, 10, Some(0.5))
            .with_project(1, 11, Some(0.5));
        let runner = JobRunner::new(default_config(), backends.backends());

        let job = Job::ProcessProjectsSampleRates(org_counts(1, &[(10, 100), (11, 1000)]));
        runner.run(&job).await.unwrap();

        let org_id = OrganizationId::new(1);
        let low = backends.cache.project_rate(org_id, ProjectId::new(10));
        let high = backends.cache.project_rate(org_id, ProjectId::new(11));
        assert_eq!(low, Some(1.0));
        assert!((high.unwrap() - 0.45).abs() < 1e-9);

        let messages = backends.invalidator.messages();
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|m| m.trigger == PROJECT_BIAS_TRIGGER));
    }

    #[tokio::test]
    async fn test_process_projects_with_target_rate() {
        let backends = TestBackends::new()
            .with_organization(1, true)
            .with_project(1, 10, Some(0.5))
            .with_project(1, 11, Some(0.5));
        let config = config(serde_json::json!({
            "sampling": {"target_overall_rate": 0.1}
        }));
        let runner = JobRunner::new(config, backends.backends());

        let job = Job::ProcessProjectsSampleRates(org_counts(1, &[(10, 100), (11, 1000)]));
        runner.run(&job).await.unwrap();

        // A budget of 110 is split evenly between both projects.
        let org_id = OrganizationId::new(1);
        let low = backends.cache.project_rate(org_id, ProjectId::new(10)).unwrap();
        let high = backends.cache.project_rate(org_id, ProjectId::new(11)).unwrap();
        assert!((low - 0.55).abs() < 1e-9);
        assert!((high - 0.055).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_process_projects_gate_disabled() {
        let backends = TestBackends::new()
            .with_organization(1, false)
            .with_project(1, 10, Some(0.5));
        let runner = JobRunner::new(default_config(), backends.backends());

        let job = Job::ProcessProjectsSampleRates(org_counts(1, &[(10, 100)]));
        runner.run(&job).await.unwrap();

        assert!(backends.cache.snapshot().is_empty());
        assert!(backends.invalidator.messages().is_empty());
    }

    #[tokio::test]
    async fn test_process_projects_skips_missing_rates() {
        let backends = TestBackends::new()
            .with_organization(1, true)
            .with_project(1, 10, Some(0.5))
            .with_project(1, 11, None);
        let runner = JobRunner::new(default_config(), backends.backends());

        // Project 12 no longer exists.
        let job = Job::ProcessProjectsSampleRates(org_counts(1, &[(10, 100), (11, 1000), (12, 1)]));
        runner.run(&job).await.unwrap();

        let org_id = OrganizationId::new(1);
        assert_eq!(backends.cache.project_rate(org_id, ProjectId::new(10)), Some(0.5));
        assert_eq!(backends.cache.project_rate(org_id, ProjectId::new(11)), None);
        assert_eq!(backends.invalidator.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_prioritise_transactions_gates_once_per_org() {
        let backends = TestBackends::new()
            .with_organization(1, true)
            .with_organization(2, false)
            .with_organization(3, true)
            .with_transaction_rows(vec![
                transaction_row(1, 10, "/a", 5),
                transaction_row(1, 11, "/a", 7),
                transaction_row(1, 12, "/b", 1),
                transaction_row(2, 20, "/a", 3),
                transaction_row(3, 30, "/c", 9),
            ]);
        let runner = JobRunner::new(default_config(), backends.backends());

        runner.run(&Job::PrioritiseTransactions).await.unwrap();

        let scheduled: Vec<_> = backends
            .queue
            .jobs()
            .into_iter()
            .map(|job| match job {
                Job::ProcessTransactionBiases(t) => (t.org_id.value(), t.project_id.value()),
                other => panic!("unexpected job {other:?}"),
            })
            .collect();
        assert_eq!(scheduled, [(1, 10), (1, 11), (1, 12), (3, 30)]);

        let checks = backends.gates.checks();
        assert_eq!(
            checks,
            [
                (Feature::PrioritiseByTransactionBias, OrganizationId::new(1)),
                (Feature::PrioritiseByTransactionBias, OrganizationId::new(2)),
                (Feature::PrioritiseByTransactionBias, OrganizationId::new(3)),
            ]
        );
    }

    #[tokio::test]
    async fn test_process_transaction_biases() {
        let backends = TestBackends::new()
            .with_organization(1, true)
            .with_project(1, 10, Some(0.1));
        let runner = JobRunner::new(default_config(), backends.backends());

        let job = Job::ProcessTransactionBiases(ProjectTransactions {
            org_id: OrganizationId::new(1),
            project_id: ProjectId::new(10),
            transaction_counts: vec![
                TransactionVolume::new("a", 1000),
                TransactionVolume::new("b", 10),
                TransactionVolume::new("c", 1),
            ],
        });
        runner.run(&job).await.unwrap();

        let cached = backends
            .cache
            .get_transaction_rates(OrganizationId::new(1), ProjectId::new(10))
            .await
            .unwrap();

        let names: Vec<_> = cached
            .named_rates
            .iter()
            .map(|rate| rate.transaction_name.as_str())
            .collect();
        assert_eq!(names, ["a", "b", "c"]);
        assert_eq!(cached.default_rate, Some(0.1));

        let messages = backends.invalidator.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].trigger, TRANSACTION_BIAS_TRIGGER);
    }

    #[tokio::test]
    async fn test_process_transaction_biases_without_rate() {
        let backends = TestBackends::new()
            .with_organization(1, true)
            .with_project(1, 10, None);
        let runner = JobRunner::new(default_config(), backends.backends());

        let job = Job::ProcessTransactionBiases(ProjectTransactions {
            org_id: OrganizationId::new(1),
            project_id: ProjectId::new(10),
            transaction_counts: vec![TransactionVolume::new("a", 1000)],
        });
        runner.run(&job).await.unwrap();

        assert!(backends.cache.snapshot().is_empty());
        assert!(backends.invalidator.messages().is_empty());
    }

    #[tokio::test]
    async fn test_out_of_range_blended_rate_skipped() {
        let backends = TestBackends::new()
            .with_organization(1, true)
            .with_project(1, 10, Some(1.5))
            .with_project(1, 11, Some(0.5));
        let runner = JobRunner::new(default_config(), backends.backends());

        let job = Job::ProcessTransactionBiases(ProjectTransactions {
            org_id: OrganizationId::new(1),
            project_id: ProjectId::new(10),
            transaction_counts: vec![
                TransactionVolume::new("a", 100),
                TransactionVolume::new("b", 1),
            ],
        });
        runner.run(&job).await.unwrap();
        assert!(backends.cache.snapshot().is_empty());

        let job = Job::ProcessProjectsSampleRates(org_counts(1, &[(10, 100), (11, 1000)]));
        runner.run(&job).await.unwrap();

        let org_id = OrganizationId::new(1);
        assert_eq!(backends.cache.project_rate(org_id, ProjectId::new(10)), None);
        assert_eq!(backends.cache.project_rate(org_id, ProjectId::new(11)), Some(0.5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried() {
        let backends = TestBackends::new()
            .with_organization(1, true)
            .with_project(1, 10, Some(0.5));
        backends.cache.fail_next_writes(2);
        let runner = JobRunner::new(default_config(), backends.backends());

        let job = Job::ProcessProjectsSampleRates(org_counts(1, &[(10, 100)]));
        runner.run(&job).await.unwrap();

        let org_id = OrganizationId::new(1);
        assert_eq!(backends.cache.project_rate(org_id, ProjectId::new(10)), Some(0.5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted() {
        let backends = TestBackends::new()
            .with_organization(1, true)
            .with_project(1, 10, Some(0.5));
        backends.cache.fail_next_writes(10);
        let config = config(serde_json::json!({
            "jobs": {"retry": {"max_retries": 2, "delay": 5}}
        }));
        let runner = JobRunner::new(config, backends.backends());

        let job = Job::ProcessProjectsSampleRates(org_counts(1, &[(10, 100)]));
        let error = runner.run(&job).await.unwrap_err();

        assert!(matches!(error, JobFailure::Failed { attempts: 3, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_soft_limit_stops_fan_out() {
        rebalancer_log::init_test!();

        let backends = TestBackends::new()
            .with_project_rows(vec![
                project_row(1, 10, 1),
                project_row(2, 20, 1),
                project_row(3, 30, 1),
                project_row(4, 40, 1),
            ])
            .with_query_latency(Duration::from_secs(1));
        let config = config(serde_json::json!({
            "fetch": {"chunk_size": 1},
            "jobs": {"prioritise_projects": {"soft_time_limit": 2, "time_limit": 100}}
        }));
        let runner = JobRunner::new(config, backends.backends());

        runner.run(&Job::PrioritiseProjects).await.unwrap();

        // The first organization is complete after two pages, at which point the limit is hit.
        assert_eq!(backends.queue.jobs().len(), 1);
    }

    #[test]
    fn test_gate_metric() {
        let captures = rebalancer_statsd::with_capturing_test_client(|| {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();

            let backends = TestBackends::new()
                .with_organization(1, false)
                .with_transaction_rows(vec![
                    transaction_row(1, 10, "/a", 1),
                    transaction_row(1, 11, "/a", 1),
                ]);
            let runner = JobRunner::new(default_config(), backends.backends());
            runtime
                .block_on(runner.run(&Job::PrioritiseTransactions))
                .unwrap();
        });

        let gates: Vec<_> = captures
            .iter()
            .filter(|m| m.starts_with("ds.gate.disabled"))
            .collect();
        assert_eq!(
            gates,
            ["ds.gate.disabled:1|c|#feature:organizations:ds-prioritise-by-transaction-bias"]
        );
    }
}
