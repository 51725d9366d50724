use rebalancer_statsd::{CounterMetric, DistributionMetric, GaugeMetric, TimerMetric};

/// Counter metrics of the rebalancing jobs.
pub enum RebalancerCounters {
    /// Number of projects left out of a rebalancing because they have no blended rate.
    ProjectsSkippedNoRate,
    /// Number of projects whose transactions were not rebalanced because they have no blended rate.
    TransactionsSkippedNoRate,
    /// Number of organizations skipped because the rebalancing feature is disabled.
    ///
    /// This metric is tagged with:
    ///  - `feature`: The feature flag that was checked.
    GateDisabled,
    /// Number of fetches that ran out of time before all pages were read.
    ///
    /// This metric is tagged with:
    ///  - `query`: Either `projects` or `transactions`.
    FetchPartial,
    /// Number of project configuration invalidations emitted.
    ///
    /// This metric is tagged with:
    ///  - `trigger`: The reason for the invalidation.
    Invalidations,
    /// Number of jobs pushed to the queue.
    ///
    /// This metric is tagged with:
    ///  - `job`: The name of the job.
    JobEnqueued,
    /// Number of queued payloads that could not be parsed and were dropped.
    JobDiscarded,
}

impl CounterMetric for RebalancerCounters {
    fn name(&self) -> &'static str {
        match *self {
            RebalancerCounters::ProjectsSkippedNoRate => "ds.projects.skipped_no_rate",
            RebalancerCounters::TransactionsSkippedNoRate => "ds.transactions.skipped_no_rate",
            RebalancerCounters::GateDisabled => "ds.gate.disabled",
            RebalancerCounters::FetchPartial => "ds.fetch.partial",
            RebalancerCounters::Invalidations => "ds.invalidations",
            RebalancerCounters::JobEnqueued => "jobs.enqueued",
            RebalancerCounters::JobDiscarded => "jobs.discarded",
        }
    }
}

/// Timer metrics of the rebalancing jobs.
pub enum RebalancerTimers {
    /// Time spent in a single page query against the analytics datastore.
    ///
    /// This metric is tagged with:
    ///  - `query`: Either `projects` or `transactions`.
    FetchQuery,
    /// Time spent writing rates to the cache, including invalidations.
    ///
    /// This metric is tagged with:
    ///  - `kind`: Either `projects` or `transactions`.
    Publish,
    /// Time spent computing project rates of one organization.
    ModelProjects,
    /// Time spent computing transaction rates of one project.
    ModelTransactions,
}

impl TimerMetric for RebalancerTimers {
    fn name(&self) -> &'static str {
        match *self {
            RebalancerTimers::FetchQuery => "ds.fetch.query",
            RebalancerTimers::Publish => "ds.publish",
            RebalancerTimers::ModelProjects => "ds.model.projects",
            RebalancerTimers::ModelTransactions => "ds.model.transactions",
        }
    }
}

/// Gauge metrics of the rebalancer process.
pub enum RebalancerGauges {
    /// The number of connections currently managed by the Redis pool.
    RedisPoolConnections,
    /// The number of idle connections in the Redis pool.
    RedisPoolIdleConnections,
}

impl GaugeMetric for RebalancerGauges {
    fn name(&self) -> &'static str {
        match *self {
            RebalancerGauges::RedisPoolConnections => "redis.pool.connections",
            RebalancerGauges::RedisPoolIdleConnections => "redis.pool.idle_connections",
        }
    }
}

/// Distribution metrics of the rebalancing jobs.
pub enum RebalancerDistributions {
    /// Number of rows returned by a single page query.
    ///
    /// This metric is tagged with:
    ///  - `query`: Either `projects` or `transactions`.
    FetchRows,
    /// Number of entities a model computed rates for.
    ///
    /// This metric is tagged with:
    ///  - `model`: Either `projects` or `transactions`.
    ModelEntities,
}

impl DistributionMetric for RebalancerDistributions {
    fn name(&self) -> &'static str {
        match *self {
            RebalancerDistributions::FetchRows => "ds.fetch.rows",
            RebalancerDistributions::ModelEntities => "ds.model.entities",
        }
    }
}
