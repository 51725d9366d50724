use std::collections::BTreeMap;
use std::error::Error;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fmt, fs};

use rebalancer_log::{LogConfig, LogLevel};
use rebalancer_redis::RedisConfig;
use rebalancer_sampling::RateBounds;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

type BoxedError = Box<dyn Error + Send + Sync + 'static>;

#[derive(Debug, Default)]
enum ConfigErrorSource {
    /// An error occurring independently.
    #[default]
    None,
    /// An error originating from a configuration file.
    File(PathBuf),
    /// An error originating in a field, either in the file or from an override.
    Field(&'static str),
}

/// Indicates config related errors.
#[derive(Debug)]
pub struct ConfigError {
    source: ConfigErrorSource,
    kind: ConfigErrorKind,
    inner: Option<BoxedError>,
}

impl ConfigError {
    #[inline]
    fn new(kind: ConfigErrorKind) -> Self {
        Self {
            source: ConfigErrorSource::None,
            kind,
            inner: None,
        }
    }

    #[inline]
    fn wrap<E>(inner: E, kind: ConfigErrorKind) -> Self
    where
        E: Into<BoxedError>,
    {
        Self {
            inner: Some(inner.into()),
            ..Self::new(kind)
        }
    }

    #[inline]
    fn for_field<E>(inner: E, field: &'static str) -> Self
    where
        E: Into<BoxedError>,
    {
        Self::wrap(inner, ConfigErrorKind::InvalidValue).field(field)
    }

    #[inline]
    fn file<P: AsRef<Path>>(mut self, p: P) -> Self {
        self.source = ConfigErrorSource::File(p.as_ref().to_path_buf());
        self
    }

    #[inline]
    fn field(mut self, name: &'static str) -> Self {
        self.source = ConfigErrorSource::Field(name);
        self
    }

    /// Returns the error kind of the error.
    pub fn kind(&self) -> ConfigErrorKind {
        self.kind
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            ConfigErrorSource::None => self.kind.fmt(f),
            ConfigErrorSource::File(file_name) => {
                write!(f, "{} (file {})", self.kind, file_name.display())
            }
            ConfigErrorSource::Field(name) => write!(f, "{} (field {})", self.kind, name),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.inner
            .as_ref()
            .map(|e| e.as_ref() as &(dyn Error + 'static))
    }
}

/// Indicates config related errors.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, thiserror::Error)]
pub enum ConfigErrorKind {
    /// Failed to open the file.
    #[error("could not open config file")]
    CouldNotOpenFile,
    /// Failed to serialize the configuration.
    #[error("could not write config file")]
    CouldNotWriteFile,
    /// Parsing YAML failed.
    #[error("could not parse yaml config file")]
    BadYaml,
    /// Parsing JSON failed.
    #[error("could not parse json config file")]
    BadJson,
    /// Invalid config value.
    #[error("invalid config value")]
    InvalidValue,
}

/// The jobs run by the rebalancer.
///
/// The first and the third job are scheduled periodically and fan out into the others.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Fetches project volumes of all organizations.
    PrioritiseProjects,
    /// Rebalances and publishes project rates of one organization.
    ProcessProjectsSampleRates,
    /// Fetches transaction volumes of all projects.
    PrioritiseTransactions,
    /// Rebalances and publishes transaction rates of one project.
    ProcessTransactionBiases,
}

impl JobKind {
    /// All job kinds.
    pub const ALL: [Self; 4] = [
        Self::PrioritiseProjects,
        Self::ProcessProjectsSampleRates,
        Self::PrioritiseTransactions,
        Self::ProcessTransactionBiases,
    ];

    /// Returns the name of the job as used in logs, metrics and the queue.
    pub fn name(self) -> &'static str {
        match self {
            Self::PrioritiseProjects => "prioritise_projects",
            Self::ProcessProjectsSampleRates => "process_projects_sample_rates",
            Self::PrioritiseTransactions => "prioritise_transactions",
            Self::ProcessTransactionBiases => "process_transaction_biases",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Structure used to hold information about configuration overrides via
/// CLI parameters or environment variables.
#[derive(Debug, Default)]
pub struct OverridableConfig {
    /// The redis server url.
    pub redis_url: Option<String>,
    /// The base url of the host application's internal API.
    pub upstream: Option<String>,
    /// Hostname and port of the statsd server.
    pub statsd: Option<String>,
    /// The log level of the rebalancer crates.
    pub log_level: Option<String>,
    /// Number of jobs executed concurrently by a worker process.
    pub concurrency: Option<String>,
}

/// Controls the metrics system.
#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct Metrics {
    /// Hostname and port of the statsd server.
    ///
    /// Defaults to `None`, which disables metrics.
    statsd: Option<String>,
    /// Common prefix that should be added to all metrics.
    prefix: String,
    /// Default tags to apply to all metrics.
    default_tags: BTreeMap<String, String>,
    /// Tag name to report the hostname to for each metric. Defaults to not sending such a tag.
    hostname_tag: Option<String>,
    /// Global sample rate for all emitted metrics between `0.0` and `1.0`.
    sample_rate: f64,
    /// Aggregate metrics locally before sending them to statsd.
    aggregate: bool,
    /// Interval for periodic metrics emitted by the stats service, in seconds.
    ///
    /// Set to `0` to disable periodic metrics.
    periodic_secs: u64,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: None,
            prefix: "rebalancer".into(),
            default_tags: BTreeMap::new(),
            hostname_tag: None,
            sample_rate: 1.0,
            aggregate: true,
            periodic_secs: 5,
        }
    }
}

/// Where volumes, entities and feature gates are queried from.
#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct Upstream {
    /// Base url of the host application's internal API.
    url: String,
    /// Timeout for a single request in seconds.
    timeout: u64,
}

impl Default for Upstream {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:9000".into(),
            timeout: 30,
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct Sampling {
    /// Lower bound of every computed rate.
    min_rate: f64,
    /// Upper bound of every computed rate.
    max_rate: f64,
    /// The overall rate organizations are rebalanced to.
    ///
    /// Defaults to the volume-weighted blended rate of the organization's projects.
    target_overall_rate: Option<f64>,
    /// Maximum number of transaction names with an explicit rate per project.
    max_explicit_transactions: usize,
    /// Expiry of rebalanced rates in the cache, in seconds.
    cache_ttl: u64,
}

impl Default for Sampling {
    fn default() -> Self {
        Self {
            min_rate: 0.0,
            max_rate: 1.0,
            target_overall_rate: None,
            max_explicit_transactions: 10,
            cache_ttl: 24 * 60 * 60,
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct Fetch {
    /// Number of rows requested per page.
    chunk_size: usize,
    /// Time budget for fetching all pages of one job, in seconds.
    max_duration: u64,
    /// Length of the queried time window, in seconds.
    window: u64,
    /// Granularity of the queried time series, in seconds.
    granularity: u64,
}

impl Default for Fetch {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            max_duration: 60,
            window: 6 * 60 * 60,
            granularity: 60 * 60,
        }
    }
}

/// Intervals of the periodic jobs in seconds. `0` disables the periodic run.
#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct Schedule {
    prioritise_projects: u64,
    prioritise_transactions: u64,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            prioritise_projects: 60 * 60,
            prioritise_transactions: 60 * 60,
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct Retry {
    /// Attempts after the first failure.
    max_retries: u32,
    /// Delay between attempts in seconds.
    delay: u64,
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            max_retries: 5,
            delay: 5,
        }
    }
}

/// Time limits of a single job in seconds.
#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
struct JobLimits {
    /// After this, the job is asked to wrap up.
    soft_time_limit: u64,
    /// After this, the job is aborted.
    time_limit: u64,
}

impl JobLimits {
    const fn new(soft_time_limit: u64) -> Self {
        Self {
            soft_time_limit,
            time_limit: soft_time_limit + 5,
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct Jobs {
    /// Number of jobs a worker process runs at the same time.
    concurrency: usize,
    /// Name of the durable queue.
    queue: String,
    /// Maximum time to wait for jobs in flight on a graceful shutdown, in seconds.
    shutdown_timeout: u64,
    retry: Retry,
    prioritise_projects: JobLimits,
    process_projects_sample_rates: JobLimits,
    prioritise_transactions: JobLimits,
    process_transaction_biases: JobLimits,
}

impl Jobs {
    fn limits(&self, kind: JobKind) -> JobLimits {
        match kind {
            JobKind::PrioritiseProjects => self.prioritise_projects,
            JobKind::ProcessProjectsSampleRates => self.process_projects_sample_rates,
            JobKind::PrioritiseTransactions => self.prioritise_transactions,
            JobKind::ProcessTransactionBiases => self.process_transaction_biases,
        }
    }
}

impl Default for Jobs {
    fn default() -> Self {
        Self {
            concurrency: 4,
            queue: "ds:jobs".into(),
            shutdown_timeout: 30,
            retry: Retry::default(),
            prioritise_projects: JobLimits::new(2 * 60 * 60),
            process_projects_sample_rates: JobLimits::new(25 * 60),
            prioritise_transactions: JobLimits::new(25 * 60),
            process_transaction_biases: JobLimits::new(25 * 60),
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct Notifications {
    /// The pub/sub channel project config invalidations are published to.
    channel: String,
}

impl Default for Notifications {
    fn default() -> Self {
        Self {
            channel: "ds:invalidate-project-config".into(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct ConfigValues {
    #[serde(default)]
    logging: LogConfig,
    #[serde(default)]
    metrics: Metrics,
    #[serde(default)]
    redis: RedisConfig,
    #[serde(default)]
    upstream: Upstream,
    #[serde(default)]
    sampling: Sampling,
    #[serde(default)]
    fetch: Fetch,
    #[serde(default)]
    schedule: Schedule,
    #[serde(default)]
    jobs: Jobs,
    #[serde(default)]
    notifications: Notifications,
}

impl ConfigValues {
    const FILE_NAME: &'static str = "config.yml";

    fn path(base: &Path) -> PathBuf {
        base.join(Self::FILE_NAME)
    }

    fn load(base: &Path) -> Result<Self, ConfigError> {
        let path = Self::path(base);

        let f = fs::File::open(&path)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotOpenFile).file(&path))?;

        load_yaml(io::BufReader::new(f)).map_err(|e| e.file(&path))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        RateBounds::new(self.sampling.min_rate, self.sampling.max_rate)
            .map_err(|e| ConfigError::for_field(e, "sampling.min_rate"))?;

        if let Some(rate) = self.sampling.target_overall_rate {
            if !(0.0..=1.0).contains(&rate) {
                return Err(ConfigError::new(ConfigErrorKind::InvalidValue)
                    .field("sampling.target_overall_rate"));
            }
        }

        if self.sampling.max_explicit_transactions == 0 {
            return Err(ConfigError::new(ConfigErrorKind::InvalidValue)
                .field("sampling.max_explicit_transactions"));
        }

        if self.fetch.chunk_size == 0 {
            return Err(ConfigError::new(ConfigErrorKind::InvalidValue).field("fetch.chunk_size"));
        }

        if self.jobs.concurrency == 0 {
            return Err(ConfigError::new(ConfigErrorKind::InvalidValue).field("jobs.concurrency"));
        }

        if !(0.0..=1.0).contains(&self.metrics.sample_rate) {
            return Err(
                ConfigError::new(ConfigErrorKind::InvalidValue).field("metrics.sample_rate")
            );
        }

        for kind in JobKind::ALL {
            let limits = self.jobs.limits(kind);
            if limits.time_limit < limits.soft_time_limit {
                return Err(
                    ConfigError::new(ConfigErrorKind::InvalidValue).field("jobs.time_limit")
                );
            }
        }

        Ok(())
    }
}

fn load_yaml<R: io::Read, T: DeserializeOwned>(reader: R) -> Result<T, ConfigError> {
    serde_yaml::from_reader(reader).map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadYaml))
}

/// Config struct.
#[derive(Default)]
pub struct Config {
    values: ConfigValues,
    path: PathBuf,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("path", &self.path)
            .field("values", &self.values)
            .finish()
    }
}

impl Config {
    /// Loads a config from a given config folder.
    ///
    /// The folder must contain a `config.yml`. All sections of the file are optional.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let path = env::current_dir()
            .map(|x| x.join(path.as_ref()))
            .unwrap_or_else(|_| path.as_ref().to_path_buf());

        let values = ConfigValues::load(&path)?;
        values.validate()?;

        Ok(Config { values, path })
    }

    /// Creates a config from a JSON value.
    ///
    /// This is mostly useful for tests.
    pub fn from_json_value(value: serde_json::Value) -> Result<Config, ConfigError> {
        let values: ConfigValues = serde_json::from_value(value)
            .map_err(|err| ConfigError::wrap(err, ConfigErrorKind::BadJson))?;
        values.validate()?;

        Ok(Config {
            values,
            path: PathBuf::new(),
        })
    }

    /// Override configuration with values coming from other sources (e.g. env variables or
    /// command line parameters).
    pub fn apply_override(
        &mut self,
        overrides: OverridableConfig,
    ) -> Result<&mut Self, ConfigError> {
        if let Some(redis) = overrides.redis_url {
            self.values.redis = RedisConfig::Single(redis);
        }

        if let Some(upstream) = overrides.upstream {
            self.values.upstream.url = upstream;
        }

        if let Some(statsd) = overrides.statsd {
            self.values.metrics.statsd = Some(statsd);
        }

        if let Some(level) = overrides.log_level {
            self.values.logging.level = level
                .parse::<LogLevel>()
                .map_err(|err| ConfigError::for_field(err, "log_level"))?;
        }

        if let Some(concurrency) = overrides.concurrency {
            self.values.jobs.concurrency = concurrency
                .parse()
                .map_err(|err| ConfigError::for_field(err, "concurrency"))?;
        }

        self.values.validate()?;
        Ok(self)
    }

    /// Returns the folder the config was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Dumps out a YAML string of the values.
    pub fn to_yaml_string(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(&self.values)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotWriteFile))
    }

    /// Writes the YAML representation of the values to the given writer.
    pub fn write_yaml<W: Write>(&self, writer: W) -> Result<(), ConfigError> {
        serde_yaml::to_writer(writer, &self.values)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotWriteFile))
    }

    /// Returns the logging configuration.
    pub fn logging(&self) -> &LogConfig {
        &self.values.logging
    }

    /// Returns the address of the statsd server, if metrics are enabled.
    pub fn statsd_addr(&self) -> Option<&str> {
        self.values.metrics.statsd.as_deref()
    }

    /// Return the prefix for statsd metrics.
    pub fn metrics_prefix(&self) -> &str {
        &self.values.metrics.prefix
    }

    /// Returns the default tags for statsd metrics.
    pub fn metrics_default_tags(&self) -> &BTreeMap<String, String> {
        &self.values.metrics.default_tags
    }

    /// Returns the name of the hostname tag that should be attached to each outgoing metric.
    pub fn metrics_hostname_tag(&self) -> Option<&str> {
        self.values.metrics.hostname_tag.as_deref()
    }

    /// Returns the global sample rate for all metrics.
    pub fn metrics_sample_rate(&self) -> f64 {
        self.values.metrics.sample_rate
    }

    /// Returns `true` if metrics are aggregated locally.
    pub fn metrics_aggregate(&self) -> bool {
        self.values.metrics.aggregate
    }

    /// Returns the interval for periodic metrics, or `None` if they are disabled.
    pub fn metrics_periodic_interval(&self) -> Option<Duration> {
        match self.values.metrics.periodic_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Returns the redis configuration.
    pub fn redis(&self) -> &RedisConfig {
        &self.values.redis
    }

    /// Base url of the host application's internal API.
    pub fn upstream_url(&self) -> &str {
        &self.values.upstream.url
    }

    /// Timeout of a single upstream request.
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.values.upstream.timeout)
    }

    /// Bounds of all computed sample rates.
    pub fn sampling_bounds(&self) -> RateBounds {
        // Checked when loading the configuration.
        RateBounds::new(self.values.sampling.min_rate, self.values.sampling.max_rate)
            .unwrap_or_default()
    }

    /// Overall rate organizations are rebalanced to, if configured.
    pub fn target_overall_rate(&self) -> Option<f64> {
        self.values.sampling.target_overall_rate
    }

    /// Maximum number of explicitly priced transaction names per project.
    pub fn max_explicit_transactions(&self) -> usize {
        self.values.sampling.max_explicit_transactions
    }

    /// Expiry of rebalanced rates in the cache.
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.values.sampling.cache_ttl)
    }

    /// Number of rows fetched per page.
    pub fn fetch_chunk_size(&self) -> usize {
        self.values.fetch.chunk_size
    }

    /// Time budget for paging through volumes.
    pub fn fetch_max_duration(&self) -> Duration {
        Duration::from_secs(self.values.fetch.max_duration)
    }

    /// Length of the time window volumes are counted in.
    pub fn fetch_window(&self) -> Duration {
        Duration::from_secs(self.values.fetch.window)
    }

    /// Granularity of the volume queries.
    pub fn fetch_granularity(&self) -> Duration {
        Duration::from_secs(self.values.fetch.granularity)
    }

    /// Returns the interval of a periodic job.
    ///
    /// Returns `None` if the job is not periodic or its interval is configured as `0`.
    pub fn schedule_interval(&self, kind: JobKind) -> Option<Duration> {
        let secs = match kind {
            JobKind::PrioritiseProjects => self.values.schedule.prioritise_projects,
            JobKind::PrioritiseTransactions => self.values.schedule.prioritise_transactions,
            _ => return None,
        };

        match secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Number of jobs a worker runs concurrently.
    pub fn job_concurrency(&self) -> usize {
        self.values.jobs.concurrency
    }

    /// Name of the durable job queue.
    pub fn job_queue(&self) -> &str {
        &self.values.jobs.queue
    }

    /// Maximum time to wait for jobs in flight on a graceful shutdown.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.values.jobs.shutdown_timeout)
    }

    /// Number of retries after a transient failure.
    pub fn job_max_retries(&self) -> u32 {
        self.values.jobs.retry.max_retries
    }

    /// Delay between retries.
    pub fn job_retry_delay(&self) -> Duration {
        Duration::from_secs(self.values.jobs.retry.delay)
    }

    /// Time after which a job is asked to wrap up.
    pub fn job_soft_time_limit(&self, kind: JobKind) -> Duration {
        Duration::from_secs(self.values.jobs.limits(kind).soft_time_limit)
    }

    /// Time after which a job is aborted.
    pub fn job_time_limit(&self, kind: JobKind) -> Duration {
        Duration::from_secs(self.values.jobs.limits(kind).time_limit)
    }

    /// The channel project config invalidations are published to.
    pub fn invalidation_channel(&self) -> &str {
        &self.values.notifications.channel
    }
}
