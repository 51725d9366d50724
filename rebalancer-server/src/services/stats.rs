use std::sync::Arc;

use rebalancer_config::Config;
use rebalancer_redis::{AsyncRedisPool, RedisPoolStats};
use rebalancer_statsd::metric;
use rebalancer_system::{Receiver, Service, ShutdownHandle};
use tokio::time::interval;

use crate::statsd::RebalancerGauges;

/// Rebalancer Stats Service.
///
/// Service which collects stats periodically and emits them via statsd.
pub struct RebalancerStats {
    config: Arc<Config>,
    redis_pool: AsyncRedisPool,
    shutdown: ShutdownHandle,
}

impl RebalancerStats {
    /// Creates the service, which stops once `shutdown` is notified.
    pub fn new(config: Arc<Config>, redis_pool: AsyncRedisPool, shutdown: ShutdownHandle) -> Self {
        Self {
            config,
            redis_pool,
            shutdown,
        }
    }

    fn redis_pool(&self) {
        let RedisPoolStats {
            connections,
            idle_connections,
        } = self.redis_pool.stats();

        metric!(gauge(RebalancerGauges::RedisPoolConnections) = u64::from(connections));
        metric!(gauge(RebalancerGauges::RedisPoolIdleConnections) = u64::from(idle_connections));
    }
}

impl Service for RebalancerStats {
    type Interface = ();

    async fn run(mut self, _rx: Receiver<Self::Interface>) {
        let Some(mut ticker) = self.config.metrics_periodic_interval().map(interval) else {
            return;
        };

        loop {
            self.redis_pool();

            tokio::select! {
                _ = ticker.tick() => (),
                _ = self.shutdown.notified() => break,
            }
        }
    }
}
