//! Paged retrieval of observed volumes, grouped per organization or project.

use std::mem;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, Stream, TryStreamExt};
use rebalancer_common::{OrganizationId, ProjectId};
use rebalancer_config::Config;
use rebalancer_sampling::{ProjectTransactions, TransactionVolume};
use rebalancer_statsd::metric;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::backends::{
    FetchError, ProjectVolumeRow, QueryWindow, TransactionVolumeRow, VolumeQuery, VolumeRequest,
};
use crate::statsd::{RebalancerCounters, RebalancerDistributions, RebalancerTimers};

/// Root transaction count of a project.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectCount {
    /// The project.
    pub project_id: ProjectId,
    /// Number of root transactions in the fetch window.
    pub count_per_root: u64,
}

/// Project volumes of a single organization.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgProjectCounts {
    /// The organization.
    pub org_id: OrganizationId,
    /// Counts of all projects with volume in the fetch window.
    pub projects: Vec<ProjectCount>,
}

/// A row type that can be paged through and grouped.
trait VolumeRow: Sized + Send + 'static {
    /// Rows with equal keys are consecutive in the result set and form a group.
    type Key: PartialEq;

    /// Tag of the query in logs and metrics.
    const QUERY: &'static str;

    fn group_key(&self) -> Self::Key;

    fn fetch<'a>(
        query: &'a dyn VolumeQuery,
        request: &'a VolumeRequest,
    ) -> BoxFuture<'a, Result<Vec<Self>, FetchError>>;
}

impl VolumeRow for ProjectVolumeRow {
    type Key = OrganizationId;
    const QUERY: &'static str = "projects";

    fn group_key(&self) -> Self::Key {
        self.org_id
    }

    fn fetch<'a>(
        query: &'a dyn VolumeQuery,
        request: &'a VolumeRequest,
    ) -> BoxFuture<'a, Result<Vec<Self>, FetchError>> {
        query.query_project_volumes(request)
    }
}

impl VolumeRow for TransactionVolumeRow {
    type Key = (OrganizationId, ProjectId);
    const QUERY: &'static str = "transactions";

    fn group_key(&self) -> Self::Key {
        (self.org_id, self.project_id)
    }

    fn fetch<'a>(
        query: &'a dyn VolumeQuery,
        request: &'a VolumeRequest,
    ) -> BoxFuture<'a, Result<Vec<Self>, FetchError>> {
        query.query_transaction_volumes(request)
    }
}

/// Progress through the pages of a single fetch.
struct Pager<R> {
    offset: usize,
    more: bool,
    /// Rows of the group that continues on the next page.
    pending: Vec<R>,
}

impl<R: VolumeRow> Pager<R> {
    fn new() -> Self {
        Self {
            offset: 0,
            more: true,
            pending: Vec::new(),
        }
    }

    /// Splits a page into groups that are complete, keeping the last group pending if more pages
    /// follow.
    fn push_page(&mut self, rows: Vec<R>) -> Vec<Vec<R>> {
        let mut complete = Vec::new();

        for row in rows {
            let continues = match self.pending.first() {
                Some(first) => first.group_key() == row.group_key(),
                None => true,
            };

            if !continues {
                complete.push(mem::take(&mut self.pending));
            }
            self.pending.push(row);
        }

        if !self.more && !self.pending.is_empty() {
            complete.push(mem::take(&mut self.pending));
        }

        complete
    }
}

/// Reads project and transaction volumes from the analytics datastore.
///
/// Volumes are read in pages of `chunk_size` rows within a fixed wall-clock budget. Rows arrive
/// sorted, so consecutive rows of the same organization or project form a group that is yielded
/// as soon as the next group starts. Once the budget is exhausted, fetching stops early: groups
/// yielded so far are kept, and the group that was still being read is dropped.
pub struct VolumeFetcher {
    query: Arc<dyn VolumeQuery>,
    chunk_size: usize,
    max_duration: Duration,
    window: Duration,
    granularity: Duration,
}

impl VolumeFetcher {
    /// Creates a fetcher from the `fetch` section of the configuration.
    pub fn new(query: Arc<dyn VolumeQuery>, config: &Config) -> Self {
        Self {
            query,
            chunk_size: config.fetch_chunk_size(),
            max_duration: config.fetch_max_duration(),
            window: config.fetch_window(),
            granularity: config.fetch_granularity(),
        }
    }

    /// Returns the root transaction volumes of all projects, one item per organization.
    pub fn fetch_project_volumes(
        &self,
    ) -> impl Stream<Item = Result<OrgProjectCounts, FetchError>> + Send + '_ {
        self.grouped::<ProjectVolumeRow>().map_ok(|rows| {
            // Groups are never empty.
            let org_id = rows[0].org_id;
            let projects = rows
                .into_iter()
                .map(|row| ProjectCount {
                    project_id: row.project_id,
                    count_per_root: row.count_per_root,
                })
                .collect();

            OrgProjectCounts { org_id, projects }
        })
    }

    /// Returns the transaction volumes of all projects, one item per project.
    ///
    /// Items of the same organization are consecutive.
    pub fn fetch_transaction_volumes(
        &self,
    ) -> impl Stream<Item = Result<ProjectTransactions, FetchError>> + Send + '_ {
        self.grouped::<TransactionVolumeRow>().map_ok(|rows| {
            let (org_id, project_id) = rows[0].group_key();
            let transaction_counts = rows
                .into_iter()
                .map(|row| TransactionVolume::new(row.transaction_name, row.count))
                .collect();

            ProjectTransactions {
                org_id,
                project_id,
                transaction_counts,
            }
        })
    }

    fn grouped<R: VolumeRow>(
        &self,
    ) -> impl Stream<Item = Result<Vec<R>, FetchError>> + Send + '_ {
        let window = QueryWindow::last(self.window, self.granularity);
        let deadline = Instant::now() + self.max_duration;

        stream::try_unfold(Pager::<R>::new(), move |mut pager| async move {
            if !pager.more {
                return Ok(None);
            }

            if Instant::now() >= deadline {
                rebalancer_log::error!(
                    query = R::QUERY,
                    offset = pager.offset,
                    "volume fetch ran out of time after {}s",
                    self.max_duration.as_secs()
                );
                metric!(counter(RebalancerCounters::FetchPartial) += 1, query = R::QUERY);
                return Ok(None);
            }

            let request = VolumeRequest {
                window,
                offset: pager.offset,
                limit: self.chunk_size + 1,
            };

            let started = Instant::now();
            let mut rows = R::fetch(self.query.as_ref(), &request).await?;
            metric!(timer(RebalancerTimers::FetchQuery) = started.elapsed(), query = R::QUERY);
            metric!(
                distribution(RebalancerDistributions::FetchRows) = rows.len() as u64,
                query = R::QUERY
            );

            // The extra row only signals that another page follows.
            pager.more = rows.len() > self.chunk_size;
            rows.truncate(self.chunk_size);
            pager.offset += self.chunk_size;

            let complete = pager.push_page(rows);
            Ok::<_, FetchError>(Some((complete, pager)))
        })
        .map_ok(|groups| stream::iter(groups.into_iter().map(Ok::<_, FetchError>)))
        .try_flatten()
    }
}
