use anyhow::{Context, Result};
use rebalancer_config::Config;
use rebalancer_server::Role;
use rebalancer_statsd::MetricsClientConfig;

/// Initializes logging from the `logging` section of the config.
pub fn init_logging(config: &Config) {
    rebalancer_log::init(config.logging());
}

/// Print spawn infos to the log.
pub fn dump_spawn_infos(config: &Config, role: Role) {
    if config.path().as_os_str().is_empty() {
        rebalancer_log::info!("launching rebalancer without config folder");
    } else {
        rebalancer_log::info!(
            "launching rebalancer from config folder {}",
            config.path().display()
        );
    }
    rebalancer_log::info!("  role: {role:?}");
    rebalancer_log::info!("  upstream: {}", config.upstream_url());
    rebalancer_log::info!("  job queue: {}", config.job_queue());
    rebalancer_log::info!("  log level: {}", config.logging().level);
}

/// Initialize the metric system.
pub fn init_metrics(config: &Config) -> Result<()> {
    let Some(host) = config.statsd_addr() else {
        return Ok(());
    };

    let mut default_tags = config.metrics_default_tags().clone();
    if let Some(hostname_tag) = config.metrics_hostname_tag()
        && let Some(hostname) = hostname::get().ok().and_then(|s| s.into_string().ok())
    {
        default_tags.insert(hostname_tag.to_owned(), hostname);
    }

    rebalancer_statsd::init(MetricsClientConfig {
        prefix: config.metrics_prefix(),
        host,
        default_tags,
        default_sample_rate: config.metrics_sample_rate().into(),
        aggregate: config.metrics_aggregate(),
    })
    .with_context(|| format!("could not initialize metrics for {host}"))?;

    Ok(())
}
