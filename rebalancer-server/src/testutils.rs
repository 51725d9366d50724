//! In-memory fakes of the backends for tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rebalancer_common::{OrganizationId, ProjectId};
use rebalancer_redis::redis;
use rebalancer_sampling::{AdjustedProjectRate, NamedRate, ProjectRatesKey, TransactionRatesKey};
use reqwest::StatusCode;
use tokio::sync::Notify;

use crate::backends::{
    BlendedRates, CacheError, CachedTransactionRates, ConfigInvalidator, EntityLookup, Feature,
    FeatureGates, FetchError, InvalidateProjectConfig, JobQueue, LookupError, Organization,
    Project, ProjectVolumeRow, QueueError, RateCache, TransactionVolumeRow, VolumeQuery,
    VolumeRequest,
};
use crate::jobs::{Backends, Job};
use crate::upstream::UpstreamError;

pub fn project_row(org_id: u64, project_id: u64, count_per_root: u64) -> ProjectVolumeRow {
    ProjectVolumeRow {
        org_id: OrganizationId::new(org_id),
        project_id: ProjectId::new(project_id),
        count_per_root,
    }
}

pub fn transaction_row(
    org_id: u64,
    project_id: u64,
    transaction_name: &str,
    count: u64,
) -> TransactionVolumeRow {
    TransactionVolumeRow {
        org_id: OrganizationId::new(org_id),
        project_id: ProjectId::new(project_id),
        transaction_name: transaction_name.to_owned(),
        count,
    }
}

/// Takes one failure from the counter if any are left.
fn take_failure(failures: &AtomicUsize) -> bool {
    failures
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn page<T: Clone>(rows: &[T], request: &VolumeRequest) -> Vec<T> {
    rows.iter()
        .skip(request.offset)
        .take(request.limit)
        .cloned()
        .collect()
}

/// Serves volume rows from memory and records every request.
#[derive(Debug, Default)]
pub struct MockVolumeQuery {
    project_rows: Mutex<Vec<ProjectVolumeRow>>,
    transaction_rows: Mutex<Vec<TransactionVolumeRow>>,
    latency: Mutex<Option<Duration>>,
    failures: AtomicUsize,
    requests: Mutex<Vec<VolumeRequest>>,
}

impl MockVolumeQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_project_rows(self, rows: Vec<ProjectVolumeRow>) -> Self {
        self.set_project_rows(rows);
        self
    }

    pub fn with_transaction_rows(self, rows: Vec<TransactionVolumeRow>) -> Self {
        self.set_transaction_rows(rows);
        self
    }

    /// Delays every query by `latency` of tokio time.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.set_latency(latency);
        self
    }

    /// Fails the next `count` queries with a transient error.
    pub fn with_failures(self, count: usize) -> Self {
        self.failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn set_project_rows(&self, rows: Vec<ProjectVolumeRow>) {
        *self.project_rows.lock() = rows;
    }

    pub fn set_transaction_rows(&self, rows: Vec<TransactionVolumeRow>) {
        *self.transaction_rows.lock() = rows;
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    pub fn requests(&self) -> Vec<VolumeRequest> {
        self.requests.lock().clone()
    }

    async fn begin(&self, request: &VolumeRequest) -> Result<(), FetchError> {
        self.requests.lock().push(request.clone());

        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if take_failure(&self.failures) {
            let error = UpstreamError::ResponseError(StatusCode::SERVICE_UNAVAILABLE);
            return Err(FetchError::Upstream(error));
        }

        Ok(())
    }
}

#[async_trait]
impl VolumeQuery for MockVolumeQuery {
    async fn query_project_volumes(
        &self,
        request: &VolumeRequest,
    ) -> Result<Vec<ProjectVolumeRow>, FetchError> {
        self.begin(request).await?;
        Ok(page(&self.project_rows.lock(), request))
    }

    async fn query_transaction_volumes(
        &self,
        request: &VolumeRequest,
    ) -> Result<Vec<TransactionVolumeRow>, FetchError> {
        self.begin(request).await?;
        Ok(page(&self.transaction_rows.lock(), request))
    }
}

/// Organizations and projects with their blended rates.
#[derive(Debug, Default)]
pub struct StaticEntities {
    organizations: Mutex<BTreeMap<OrganizationId, Organization>>,
    projects: Mutex<BTreeMap<ProjectId, (Project, Option<f64>)>>,
}

impl StaticEntities {
    pub fn add_organization(&self, org_id: OrganizationId) {
        let organization = Organization {
            id: org_id,
            slug: format!("org-{org_id}"),
        };
        self.organizations.lock().insert(org_id, organization);
    }

    pub fn add_project(&self, project: Project, blended_rate: Option<f64>) {
        self.projects.lock().insert(project.id, (project, blended_rate));
    }
}

#[async_trait]
impl EntityLookup for StaticEntities {
    async fn get_organization(
        &self,
        org_id: OrganizationId,
    ) -> Result<Option<Organization>, LookupError> {
        Ok(self.organizations.lock().get(&org_id).cloned())
    }

    async fn get_project(&self, project_id: ProjectId) -> Result<Option<Project>, LookupError> {
        let projects = self.projects.lock();
        Ok(projects.get(&project_id).map(|(project, _)| project.clone()))
    }

    async fn get_many_projects(
        &self,
        project_ids: &[ProjectId],
    ) -> Result<Vec<Project>, LookupError> {
        let projects = self.projects.lock();
        // Reversed to make sure callers do not rely on the order.
        Ok(project_ids
            .iter()
            .rev()
            .filter_map(|id| projects.get(id).map(|(project, _)| project.clone()))
            .collect())
    }
}

#[async_trait]
impl BlendedRates for StaticEntities {
    async fn get_blended_sample_rate(&self, project: &Project) -> Result<Option<f64>, LookupError> {
        let projects = self.projects.lock();
        Ok(projects.get(&project.id).and_then(|(_, rate)| *rate))
    }
}

/// Feature flags per organization that record every check.
#[derive(Debug, Default)]
pub struct StaticGates {
    enabled: Mutex<BTreeMap<OrganizationId, bool>>,
    checks: Mutex<Vec<(Feature, OrganizationId)>>,
}

impl StaticGates {
    /// Enables or disables all features for an organization.
    pub fn set(&self, org_id: OrganizationId, enabled: bool) {
        self.enabled.lock().insert(org_id, enabled);
    }

    pub fn checks(&self) -> Vec<(Feature, OrganizationId)> {
        self.checks.lock().clone()
    }
}

#[async_trait]
impl FeatureGates for StaticGates {
    async fn has(&self, feature: Feature, org_id: OrganizationId) -> Result<bool, LookupError> {
        self.checks.lock().push((feature, org_id));
        let enabled = self.enabled.lock();
        Ok(enabled.get(&org_id).copied().unwrap_or(false))
    }
}

/// Contents of a [`MemoryRateCache`], keyed like the Redis hashes.
pub type CacheSnapshot = BTreeMap<String, BTreeMap<String, String>>;

/// A rate cache in memory with the same key layout as Redis.
#[derive(Debug, Default)]
pub struct MemoryRateCache {
    hashes: Mutex<CacheSnapshot>,
    ttls: Mutex<BTreeMap<String, Duration>>,
    failures: AtomicUsize,
}

impl MemoryRateCache {
    /// Fails the next `count` writes with a connection error.
    pub fn fail_next_writes(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn project_rate(&self, org_id: OrganizationId, project_id: ProjectId) -> Option<f64> {
        let key = ProjectRatesKey::new(org_id);
        let hashes = self.hashes.lock();
        let value = hashes.get(key.as_str())?.get(&ProjectRatesKey::field(project_id))?;
        value.parse().ok()
    }

    pub fn ttl(&self, key: &str) -> Option<Duration> {
        self.ttls.lock().get(key).copied()
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        self.hashes.lock().clone()
    }

    fn check_write(&self) -> Result<(), CacheError> {
        if take_failure(&self.failures) {
            let error = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
            return Err(redis::RedisError::from(error).into());
        }
        Ok(())
    }

    fn expire(&self, key: &str, ttl: Duration) {
        self.ttls.lock().insert(key.to_owned(), ttl);
    }
}

#[async_trait]
impl RateCache for MemoryRateCache {
    async fn set_project_rates(
        &self,
        org_id: OrganizationId,
        rates: &[AdjustedProjectRate],
        ttl: Duration,
    ) -> Result<(), CacheError> {
        self.check_write()?;

        let key = ProjectRatesKey::new(org_id);
        let mut hashes = self.hashes.lock();
        let hash = hashes.entry(key.as_str().to_owned()).or_default();
        for rate in rates {
            hash.insert(
                ProjectRatesKey::field(rate.project_id),
                rate.new_sample_rate.to_string(),
            );
        }
        drop(hashes);

        self.expire(key.as_str(), ttl);
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
        self.check_write()?;

        let key = TransactionRatesKey::new(org_id, project_id);
        let mut hash: BTreeMap<_, _> = named_rates
            .iter()
            .map(|rate| {
                let field = TransactionRatesKey::name_field(&rate.transaction_name);
                (field, rate.sample_rate.to_string())
            })
            .collect();
        hash.insert(
            TransactionRatesKey::DEFAULT_FIELD.to_owned(),
            default_rate.to_string(),
        );

        self.hashes.lock().insert(key.as_str().to_owned(), hash);
        self.expire(key.as_str(), ttl);
        Ok(())
    }

    async fn get_project_rate(
        &self,
        org_id: OrganizationId,
        project_id: ProjectId,
    ) -> Result<Option<f64>, CacheError> {
        Ok(self.project_rate(org_id, project_id))
    }

    async fn get_transaction_rates(
        &self,
        org_id: OrganizationId,
        project_id: ProjectId,
    ) -> Result<CachedTransactionRates, CacheError> {
        let key = TransactionRatesKey::new(org_id, project_id);
        let hashes = self.hashes.lock();

        let mut rates = CachedTransactionRates::default();
        for (field, value) in hashes.get(key.as_str()).into_iter().flatten() {
            let Ok(sample_rate) = value.parse() else {
                continue;
            };
            match TransactionRatesKey::parse_field(field) {
                Some(name) => rates.named_rates.push(NamedRate {
                    transaction_name: name.to_owned(),
                    sample_rate,
                }),
                None => rates.default_rate = Some(sample_rate),
            }
        }

        Ok(rates)
    }
}

/// Records invalidations instead of sending them.
#[derive(Debug, Default)]
pub struct RecordingInvalidator {
    messages: Mutex<Vec<InvalidateProjectConfig>>,
}

impl RecordingInvalidator {
    pub fn messages(&self) -> Vec<InvalidateProjectConfig> {
        self.messages.lock().clone()
    }
}

#[async_trait]
impl ConfigInvalidator for RecordingInvalidator {
    async fn invalidate(&self, message: InvalidateProjectConfig) -> Result<(), CacheError> {
        self.messages.lock().push(message);
        Ok(())
    }
}

/// A job queue in memory.
#[derive(Debug, Default)]
pub struct LocalJobQueue {
    jobs: Mutex<VecDeque<Job>>,
    notify: Notify,
}

impl LocalJobQueue {
    /// Returns the jobs currently waiting in the queue, oldest first.
    pub fn jobs(&self) -> Vec<Job> {
        self.jobs.lock().iter().cloned().collect()
    }
}

#[async_trait]
impl JobQueue for LocalJobQueue {
    async fn enqueue(&self, job: &Job) -> Result<(), QueueError> {
        self.jobs.lock().push_back(job.clone());
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Job>, QueueError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let next = self.jobs.lock().pop_front();
            if let Some(job) = next {
                return Ok(Some(job));
            }

            let notified = self.notify.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }
}

/// A complete set of fake backends.
pub struct TestBackends {
    pub volumes: Arc<MockVolumeQuery>,
    pub entities: Arc<StaticEntities>,
    pub gates: Arc<StaticGates>,
    pub cache: Arc<MemoryRateCache>,
    pub invalidator: Arc<RecordingInvalidator>,
    pub queue: Arc<LocalJobQueue>,
}

impl TestBackends {
    pub fn new() -> Self {
        Self {
            volumes: Arc::default(),
            entities: Arc::default(),
            gates: Arc::default(),
            cache: Arc::default(),
            invalidator: Arc::default(),
            queue: Arc::default(),
        }
    }

    /// Adds an organization with all features enabled or disabled.
    pub fn with_organization(self, org_id: u64, enabled: bool) -> Self {
        let org_id = OrganizationId::new(org_id);
        self.entities.add_organization(org_id);
        self.gates.set(org_id, enabled);
        self
    }

    pub fn with_project(self, org_id: u64, project_id: u64, blended_rate: Option<f64>) -> Self {
        let project = Project {
            id: ProjectId::new(project_id),
            organization_id: OrganizationId::new(org_id),
        };
        self.entities.add_project(project, blended_rate);
        self
    }

    pub fn with_project_rows(self, rows: Vec<ProjectVolumeRow>) -> Self {
        self.volumes.set_project_rows(rows);
        self
    }

    pub fn with_transaction_rows(self, rows: Vec<TransactionVolumeRow>) -> Self {
        self.volumes.set_transaction_rows(rows);
        self
    }

    pub fn with_query_latency(self, latency: Duration) -> Self {
        self.volumes.set_latency(latency);
        self
    }

    pub fn backends(&self) -> Backends {
        Backends {
            volumes: self.volumes.clone(),
            gates: self.gates.clone(),
            entities: self.entities.clone(),
            blended_rates: self.entities.clone(),
            cache: self.cache.clone(),
            invalidator: self.invalidator.clone(),
            queue: self.queue.clone(),
        }
    }
}
