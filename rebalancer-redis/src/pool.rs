use std::fmt;

use deadpool::managed::{BuildError, PoolError};
use deadpool_redis::redis::{Cmd, FromRedisValue, Pipeline};
use deadpool_redis::{ConfigError, Runtime, cluster};
use thiserror::Error;

use crate::config::{RedisConfig, RedisConfigOptions};

pub use deadpool_redis::redis;

/// Failure of a Redis command or of the pool executing it.
#[derive(Debug, Error)]
pub enum RedisError {
    /// The command was rejected or the connection failed while it ran.
    #[error("failed to communicate with redis: {0}")]
    Redis(#[from] redis::RedisError),

    /// No connection could be checked out of the pool.
    #[error("no redis connection available: {0}")]
    Pool(#[from] PoolError<redis::RedisError>),

    /// The server URLs could not be parsed.
    #[error("invalid redis configuration: {0}")]
    Config(#[from] ConfigError),

    /// The pool could not be built.
    #[error("failed to create redis pool: {0}")]
    Build(#[from] BuildError),
}

/// Occupancy of an [`AsyncRedisPool`], reported as gauges.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RedisPoolStats {
    /// Connections currently open, idle or in use.
    pub connections: u32,
    /// Open connections waiting for a command.
    pub idle_connections: u32,
}

#[derive(Clone)]
enum Backend {
    Single(deadpool_redis::Pool),
    Cluster(cluster::Pool),
}

/// Pooled connections to the Redis instance or cluster holding rates and jobs.
///
/// Connections are opened lazily on the first command and returned to the pool after every
/// command or pipeline. Cloning the pool is cheap and shares its connections.
#[derive(Clone)]
pub struct AsyncRedisPool {
    backend: Backend,
}

impl AsyncRedisPool {
    /// Creates a pool for the configured single instance or cluster.
    pub fn from_config(config: &RedisConfig) -> Result<Self, RedisError> {
        let options = config.options();
        match config {
            RedisConfig::Single(server) | RedisConfig::SingleWithOpts { server, .. } => {
                Self::single(server, &options)
            }
            RedisConfig::Cluster { cluster_nodes, .. } => {
                let pool = cluster::Config::from_urls(cluster_nodes.clone())
                    .builder()?
                    .max_size(max_size(&options))
                    .runtime(Runtime::Tokio1)
                    .build()?;
                Ok(Self {
                    backend: Backend::Cluster(pool),
                })
            }
        }
    }

    /// Creates a pool for a single Redis instance at the given `redis://` URL.
    pub fn single(server: &str, options: &RedisConfigOptions) -> Result<Self, RedisError> {
        let pool = deadpool_redis::Config::from_url(server)
            .builder()?
            .max_size(max_size(options))
            .runtime(Runtime::Tokio1)
            .build()?;

        Ok(Self {
            backend: Backend::Single(pool),
        })
    }

    /// Runs a single command on a pooled connection.
    pub async fn query<T: FromRedisValue>(&self, cmd: &Cmd) -> Result<T, RedisError> {
        let value = match &self.backend {
            Backend::Single(pool) => cmd.query_async(&mut pool.get().await?).await?,
            Backend::Cluster(pool) => cmd.query_async(&mut pool.get().await?).await?,
        };
        Ok(value)
    }

    /// Sends all commands of a pipeline on one pooled connection.
    pub async fn execute<T: FromRedisValue>(&self, pipeline: &Pipeline) -> Result<T, RedisError> {
        let value = match &self.backend {
            Backend::Single(pool) => pipeline.query_async(&mut pool.get().await?).await?,
            Backend::Cluster(pool) => pipeline.query_async(&mut pool.get().await?).await?,
        };
        Ok(value)
    }

    /// Returns the current occupancy of the pool.
    pub fn stats(&self) -> RedisPoolStats {
        let status = match &self.backend {
            Backend::Single(pool) => pool.status(),
            Backend::Cluster(pool) => pool.status(),
        };

        RedisPoolStats {
            connections: u32::try_from(status.size).unwrap_or(u32::MAX),
            idle_connections: u32::try_from(status.available).unwrap_or(u32::MAX),
        }
    }

    fn mode(&self) -> &'static str {
        match self.backend {
            Backend::Single(_) => "single",
            Backend::Cluster(_) => "cluster",
        }
    }
}

impl fmt::Debug for AsyncRedisPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncRedisPool")
            .field("mode", &self.mode())
            .field("stats", &self.stats())
            .finish()
    }
}

fn max_size(options: &RedisConfigOptions) -> usize {
    usize::try_from(options.max_connections).unwrap_or(usize::MAX)
}
