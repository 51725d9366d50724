use serde::{Deserialize, Serialize};

const fn default_max_connections() -> u32 {
    24
}

/// Additional configuration options for a redis client.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct RedisConfigOptions {
    /// Maximum number of connections managed by the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for RedisConfigOptions {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
        }
    }
}

/// Configuration for connecting a redis client.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
#[serde(untagged)]
pub enum RedisConfig {
    /// Connect to a Redis cluster.
    Cluster {
        /// List of `redis://` urls to use in cluster mode.
        ///
        /// This can also be a single node which is configured in cluster mode.
        cluster_nodes: Vec<String>,

        /// Additional configuration options for the redis client and a connections pool.
        #[serde(flatten)]
        options: RedisConfigOptions,
    },

    /// Connect to a single Redis instance.
    ///
    /// Contains the `redis://` url to the node.
    Single(String),

    /// Connect to a single Redis instance with additional options.
    SingleWithOpts {
        /// Contains the `redis://` url to the node.
        server: String,

        /// Additional configuration options for the redis client and a connections pool.
        #[serde(flatten)]
        options: RedisConfigOptions,
    },
}

impl RedisConfig {
    /// Returns the pool options, defaulted for the plain single-url form.
    pub fn options(&self) -> RedisConfigOptions {
        match self {
            Self::Cluster { options, .. } | Self::SingleWithOpts { options, .. } => options.clone(),
            Self::Single(_) => RedisConfigOptions::default(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self::Single("redis://127.0.0.1:6379".to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_single_opts() {
        let yaml = r#"
server: "redis://127.0.0.1:6379"
max_connections: 42
"#;

        let config: RedisConfig = serde_yaml::from_str(yaml).unwrap();

        match config {
            RedisConfig::SingleWithOpts { server, options } => {
                assert_eq!(options.max_connections, 42);
                assert_eq!(server, "redis://127.0.0.1:6379");
            }
            e => panic!("Expected RedisConfig::SingleWithOpts but got {e:?}"),
        }
    }

    #[test]
    fn test_redis_single() {
        let config: RedisConfig = serde_yaml::from_str(r#""redis://127.0.0.1:6379""#).unwrap();
        assert_eq!(config, RedisConfig::default());
        assert_eq!(config.options().max_connections, 24);
    }

    #[test]
    fn test_redis_cluster() {
        let yaml = r#"
cluster_nodes:
  - "redis://127.0.0.1:7000"
  - "redis://127.0.0.2:7000"
max_connections: 8
"#;

        let config: RedisConfig = serde_yaml::from_str(yaml).unwrap();

        match config {
            RedisConfig::Cluster {
                cluster_nodes,
                options,
            } => {
                assert_eq!(cluster_nodes.len(), 2);
                assert_eq!(options.max_connections, 8);
            }
            e => panic!("Expected RedisConfig::Cluster but got {e:?}"),
        }
    }
}
