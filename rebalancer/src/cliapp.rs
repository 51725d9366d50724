// This module implements the definition of the command line app.

use clap::builder::ValueParser;
use clap::{Arg, ArgAction, Command};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ABOUT: &str = "Redistributes dynamic sampling rates across projects and transactions.";

/// Arguments overriding values of the config file.
fn override_args() -> [Arg; 5] {
    [
        Arg::new("redis_url")
            .long("redis-url")
            .value_name("URL")
            .env("REBALANCER_REDIS_URL")
            .global(true)
            .help("Redis server URL."),
        Arg::new("upstream")
            .long("upstream")
            .value_name("URL")
            .env("REBALANCER_UPSTREAM_URL")
            .global(true)
            .help("Base URL of the internal API providing volumes and entities."),
        Arg::new("statsd")
            .long("statsd")
            .value_name("HOST:PORT")
            .env("REBALANCER_STATSD_ADDR")
            .global(true)
            .help("Hostname and port of the statsd server to send metrics to."),
        Arg::new("log_level")
            .long("log-level")
            .value_name("LEVEL")
            .env("REBALANCER_LOG_LEVEL")
            .global(true)
            .help("The log level of the rebalancer."),
        Arg::new("concurrency")
            .long("concurrency")
            .value_name("JOBS")
            .env("REBALANCER_CONCURRENCY")
            .global(true)
            .help("Number of jobs a worker process runs at the same time."),
    ]
}

pub fn make_app() -> Command {
    Command::new("rebalancer")
        .disable_help_subcommand(true)
        .subcommand_required(true)
        .arg_required_else_help(true)
        .propagate_version(true)
        .max_term_width(79)
        .version(VERSION)
        .about(ABOUT)
        .arg(
            Arg::new("config")
                .value_name("CONFIG")
                .long("config")
                .short('c')
                .global(true)
                .value_parser(ValueParser::path_buf())
                .env("REBALANCER_CONFIG_PATH")
                .help("The path to the config folder."),
        )
        .args(override_args())
        .subcommand(
            Command::new("run")
                .about("Run the scheduler and the workers")
                .after_help(
                    "This runs the scheduler and the configured number of workers in the \
                     foreground until the process is shut down.",
                ),
        )
        .subcommand(
            Command::new("worker")
                .about("Run workers executing queued jobs")
                .after_help(
                    "Any number of worker processes can share a job queue.  Workers do not \
                     enqueue the periodic jobs, so at least one scheduler must run.",
                ),
        )
        .subcommand(
            Command::new("schedule")
                .about("Run the scheduler enqueueing the periodic jobs")
                .after_help(
                    "Only one scheduler should run against a job queue, otherwise the \
                     periodic jobs run more often than configured.",
                )
                .arg(
                    Arg::new("once")
                        .long("once")
                        .action(ArgAction::SetTrue)
                        .help("Enqueue every periodic job once and exit"),
                ),
        )
        .subcommand(
            Command::new("config")
                .about("Manage the rebalancer config")
                .subcommand_required(true)
                .subcommand(
                    Command::new("show")
                        .about("Show the entire config out for debugging purposes")
                        .after_help(
                            "This dumps out the entire config including the values \
                             which are not in the config file but filled in from \
                             defaults and overrides.  The default output format is \
                             YAML but a debug format can also be specified.",
                        )
                        .arg(
                            Arg::new("format")
                                .short('f')
                                .long("format")
                                .value_parser(["debug", "yaml"])
                                .default_value("yaml")
                                .help("The output format"),
                        ),
                ),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app() {
        make_app().debug_assert();
    }

    #[test]
    fn test_global_overrides() {
        let matches = make_app()
            .try_get_matches_from(["rebalancer", "worker", "--concurrency", "8"])
            .unwrap();

        assert_eq!(
            matches.get_one::<String>("concurrency").map(String::as_str),
            Some("8")
        );
        assert_eq!(matches.subcommand_name(), Some("worker"));
    }
}
