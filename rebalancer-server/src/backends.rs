//! External systems the rebalancer reads from and writes to.
//!
//! Every collaborator is a trait, so jobs can run against the upstream API and Redis in
//! production and against the in-memory fakes of [`testutils`](crate::testutils) in tests.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rebalancer_common::{OrganizationId, ProjectId};
use rebalancer_redis::{RedisError, redis};
use rebalancer_sampling::{AdjustedProjectRate, NamedRate};
use serde::{Deserialize, Serialize};

use crate::jobs::Job;
use crate::upstream::UpstreamError;

/// Feature flags gating the rebalancing of an organization.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Feature {
    /// Enables rebalancing of project rates within an organization.
    ///
    /// Serialized as `organizations:ds-prioritise-by-project-bias`.
    #[serde(rename = "organizations:ds-prioritise-by-project-bias")]
    PrioritiseByProjectBias,
    /// Enables rebalancing of transaction rates within the projects of an organization.
    ///
    /// Serialized as `organizations:ds-prioritise-by-transaction-bias`.
    #[serde(rename = "organizations:ds-prioritise-by-transaction-bias")]
    PrioritiseByTransactionBias,
}

impl Feature {
    /// Returns the serialized name of the feature flag.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PrioritiseByProjectBias => "organizations:ds-prioritise-by-project-bias",
            Self::PrioritiseByTransactionBias => "organizations:ds-prioritise-by-transaction-bias",
        }
    }
}

/// An organization as known to the entity store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    /// The organization's id.
    pub id: OrganizationId,
    /// The organization's URL slug.
    #[serde(default)]
    pub slug: String,
}

/// A project as known to the entity store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    /// The project's id.
    pub id: ProjectId,
    /// The organization owning the project.
    pub organization_id: OrganizationId,
}

/// The time range and resolution of a volume query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryWindow {
    /// Inclusive start of the window.
    pub start: DateTime<Utc>,
    /// Exclusive end of the window.
    pub end: DateTime<Utc>,
    /// Bucket size of the underlying time series in seconds.
    pub granularity: u64,
}

impl QueryWindow {
    /// Creates a window of the given length ending now.
    pub fn last(length: Duration, granularity: Duration) -> Self {
        let end = Utc::now();
        let start = chrono::Duration::from_std(length)
            .ok()
            .and_then(|length| end.checked_sub_signed(length))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        Self {
            start,
            end,
            granularity: granularity.as_secs(),
        }
    }
}

/// A single page of a volume query.
///
/// Rows are ordered by organization, project and transaction name, so consecutive pages continue
/// where the previous one ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRequest {
    /// The time range to count volumes in.
    #[serde(flatten)]
    pub window: QueryWindow,
    /// Number of rows to skip.
    pub offset: usize,
    /// Maximum number of rows to return.
    pub limit: usize,
}

/// Root transaction volume of a project.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectVolumeRow {
    /// The organization owning the project.
    pub org_id: OrganizationId,
    /// The project.
    pub project_id: ProjectId,
    /// Number of root transactions in the window.
    pub count_per_root: u64,
}

/// Volume of a single transaction name in a project.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionVolumeRow {
    /// The organization owning the project.
    pub org_id: OrganizationId,
    /// The project.
    pub project_id: ProjectId,
    /// The transaction name.
    pub transaction_name: String,
    /// Number of transactions with this name in the window.
    pub count: u64,
}

/// Rebalanced transaction rates of a project as read back from the cache.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CachedTransactionRates {
    /// Explicit rates per transaction name.
    pub named_rates: Vec<NamedRate>,
    /// Rate of all names without an explicit rate.
    pub default_rate: Option<f64>,
}

/// A request to recompute the configuration of a project at the ingestion edge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidateProjectConfig {
    /// The project whose configuration is outdated.
    pub project_id: ProjectId,
    /// Why the configuration is outdated.
    pub trigger: String,
}

/// Returns `true` if a Redis operation may succeed when attempted again.
pub(crate) fn is_transient_redis_error(error: &RedisError) -> bool {
    match error {
        RedisError::Redis(error) => is_transient_redis_command(error),
        RedisError::Pool(_) => true,
        RedisError::Config(_) | RedisError::Build(_) => false,
    }
}

fn is_transient_redis_command(error: &redis::RedisError) -> bool {
    error.is_io_error()
        || error.is_timeout()
        || error.is_connection_dropped()
        || error.is_connection_refusal()
}

/// An error querying the analytics datastore.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The query could not be sent or was rejected.
    #[error("failed to query volumes")]
    Upstream(#[from] UpstreamError),
}

impl FetchError {
    /// Returns `true` if the query may succeed when sent again.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Upstream(error) => error.is_transient(),
        }
    }
}

/// An error looking up organizations, projects, feature flags or blended rates.
#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    /// The lookup could not be sent or was rejected.
    #[error("failed to look up entity")]
    Upstream(#[from] UpstreamError),
}

impl LookupError {
    /// Returns `true` if the lookup may succeed when sent again.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Upstream(error) => error.is_transient(),
        }
    }
}

/// An error reading or writing the rate cache or publishing invalidations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Communication with Redis failed.
    #[error("failed to access the rate cache")]
    Redis(#[from] RedisError),
    /// A notification could not be serialized.
    #[error("failed to serialize notification")]
    Serialize(#[from] serde_json::Error),
}

impl CacheError {
    /// Returns `true` if the operation may succeed when attempted again.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Redis(error) => is_transient_redis_error(error),
            Self::Serialize(_) => false,
        }
    }
}

impl From<redis::RedisError> for CacheError {
    fn from(error: redis::RedisError) -> Self {
        Self::Redis(error.into())
    }
}

/// An error pushing to or popping from the job queue.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Communication with Redis failed.
    #[error("failed to access the job queue")]
    Redis(#[from] RedisError),
    /// A job could not be serialized or a queued payload could not be parsed.
    #[error("invalid job payload")]
    Payload(#[from] serde_json::Error),
    /// The queue has been closed.
    #[error("the job queue is closed")]
    Closed,
}

impl QueueError {
    /// Returns `true` if the operation may succeed when attempted again.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Redis(error) => is_transient_redis_error(error),
            Self::Payload(_) | Self::Closed => false,
        }
    }
}

impl From<redis::RedisError> for QueueError {
    fn from(error: redis::RedisError) -> Self {
        Self::Redis(error.into())
    }
}

/// Paged access to observed volumes in the analytics datastore.
#[async_trait]
pub trait VolumeQuery: Send + Sync {
    /// Returns root transaction counts per project, ordered by organization and project.
    async fn query_project_volumes(
        &self,
        request: &VolumeRequest,
    ) -> Result<Vec<ProjectVolumeRow>, FetchError>;

    /// Returns transaction counts per name, ordered by organization, project and name.
    async fn query_transaction_volumes(
        &self,
        request: &VolumeRequest,
    ) -> Result<Vec<TransactionVolumeRow>, FetchError>;
}

/// Feature flag checks per organization.
#[async_trait]
pub trait FeatureGates: Send + Sync {
    /// Returns `true` if the feature is enabled for the organization.
    async fn has(&self, feature: Feature, org_id: OrganizationId) -> Result<bool, LookupError>;
}

/// Lookup of organizations and projects.
#[async_trait]
pub trait EntityLookup: Send + Sync {
    /// Returns the organization, or `None` if it does not exist.
    async fn get_organization(
        &self,
        org_id: OrganizationId,
    ) -> Result<Option<Organization>, LookupError>;

    /// Returns the project, or `None` if it does not exist.
    async fn get_project(&self, project_id: ProjectId) -> Result<Option<Project>, LookupError>;

    /// Returns all projects that exist among the given ids, in no particular order.
    async fn get_many_projects(&self, project_ids: &[ProjectId])
    -> Result<Vec<Project>, LookupError>;
}

/// Lookup of the static sample rate derived from a project's subscription plan.
#[async_trait]
pub trait BlendedRates: Send + Sync {
    /// Returns the blended sample rate, or `None` if the project is not sampled.
    async fn get_blended_sample_rate(&self, project: &Project) -> Result<Option<f64>, LookupError>;
}

/// Shared key-value store for rebalanced rates.
#[async_trait]
pub trait RateCache: Send + Sync {
    /// Stores the rates of projects in an organization and refreshes the hash's expiry.
    async fn set_project_rates(
        &self,
        org_id: OrganizationId,
        rates: &[AdjustedProjectRate],
        ttl: Duration,
    ) -> Result<(), CacheError>;

    /// Replaces all transaction rates of a project.
    async fn set_transaction_rates(
        &self,
        org_id: OrganizationId,
        project_id: ProjectId,
        named_rates: &[NamedRate],
        default_rate: f64,
        ttl: Duration,
    ) -> Result<(), CacheError>;

    /// Returns the cached rate of a project, if any.
    async fn get_project_rate(
        &self,
        org_id: OrganizationId,
        project_id: ProjectId,
    ) -> Result<Option<f64>, CacheError>;

    /// Returns the cached transaction rates of a project.
    async fn get_transaction_rates(
        &self,
        org_id: OrganizationId,
        project_id: ProjectId,
    ) -> Result<CachedTransactionRates, CacheError>;
}

/// Notifies the ingestion edge that project configurations are outdated.
#[async_trait]
pub trait ConfigInvalidator: Send + Sync {
    /// Emits the invalidation without waiting for it to be processed.
    async fn invalidate(&self, message: InvalidateProjectConfig) -> Result<(), CacheError>;
}

/// Durable queue of jobs shared by all workers.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Appends a job to the queue.
    async fn enqueue(&self, job: &Job) -> Result<(), QueueError>;

    /// Waits up to `timeout` for the next job.
    async fn dequeue(&self, timeout: Duration) -> Result<Option<Job>, QueueError>;
}
