use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::ArgMatches;
use rebalancer_config::{Config, ConfigErrorKind, OverridableConfig};
use rebalancer_server::Role;

use crate::cliapp::make_app;
use crate::setup;

const DEFAULT_CONFIG_PATH: &str = ".rebalancer";

/// Runs the command line application.
pub fn execute() -> Result<()> {
    let app = make_app();
    let matches = app.get_matches();

    let mut config = load_config(matches.get_one::<PathBuf>("config"))?;
    config.apply_override(extract_config_args(&matches))?;

    match matches.subcommand() {
        Some(("run", _)) => run(config, Role::All),
        Some(("worker", _)) => run(config, Role::Worker),
        Some(("schedule", matches)) if matches.get_flag("once") => schedule_once(config),
        Some(("schedule", _)) => run(config, Role::Scheduler),
        Some(("config", matches)) => manage_config(&config, matches),
        _ => unreachable!(),
    }
}

/// Loads the config from the given folder.
///
/// Without an explicit folder, a missing config file in the default folder falls back to the
/// default configuration.
fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let Some(path) = path else {
        return match Config::from_path(DEFAULT_CONFIG_PATH) {
            Err(error) if error.kind() == ConfigErrorKind::CouldNotOpenFile => Ok(Config::default()),
            result => result.context("could not load config"),
        };
    };

    Config::from_path(path)
        .with_context(|| format!("could not load config from {}", path.display()))
}

/// Extract config arguments from a parsed command line arguments object.
fn extract_config_args(matches: &ArgMatches) -> OverridableConfig {
    let get = |name: &str| matches.get_one::<String>(name).cloned();

    OverridableConfig {
        redis_url: get("redis_url"),
        upstream: get("upstream"),
        statsd: get("statsd"),
        log_level: get("log_level"),
        concurrency: get("concurrency"),
    }
}

fn manage_config(config: &Config, matches: &ArgMatches) -> Result<()> {
    let Some(("show", matches)) = matches.subcommand() else {
        unreachable!();
    };

    let mut stdout = io::stdout().lock();
    match matches.get_one::<String>("format").map(String::as_str) {
        Some("debug") => writeln!(stdout, "{config:#?}")?,
        _ => config.write_yaml(&mut stdout)?,
    }

    Ok(())
}

fn schedule_once(config: Config) -> Result<()> {
    setup::init_logging(&config);
    setup::init_metrics(&config)?;

    let count = rebalancer_server::schedule_once(config)?;
    rebalancer_log::info!("enqueued {count} jobs");
    Ok(())
}

fn run(config: Config, role: Role) -> Result<()> {
    setup::init_logging(&config);
    setup::dump_spawn_infos(&config, role);
    setup::init_metrics(&config)?;

    rebalancer_server::run(config, role)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    #[test]
    fn test_extract_config_args() {
        let matches = make_app()
            .try_get_matches_from([
                "rebalancer",
                "run",
                "--redis-url",
                "redis://other:6379",
                "--log-level",
                "debug",
            ])
            .unwrap();

        let overrides = extract_config_args(&matches);
        assert_eq!(overrides.redis_url.as_deref(), Some("redis://other:6379"));
        assert_eq!(overrides.log_level.as_deref(), Some("debug"));
        assert_eq!(overrides.statsd, None);
    }

    #[test]
    fn test_missing_explicit_config() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");

        assert!(load_config(Some(&missing)).is_err());
    }

    #[test]
    fn test_load_config() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.yml"), "jobs:\n  concurrency: 7\n").unwrap();

        let config = load_config(Some(&dir.path().to_path_buf())).unwrap();
        assert_eq!(config.job_concurrency(), 7);
        assert_eq!(config.path(), Path::new(dir.path()));
    }
}
