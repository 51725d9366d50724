//! The rebalancer binary.
//!
//! The rebalancer periodically redistributes the sample rates of dynamic sampling. Within every
//! organization, low-volume projects get a higher share of the organization's sampling budget
//! than high-volume projects, and within every project, rare transactions get a higher share than
//! frequent ones. The overall number of sampled transactions stays the same.
//!
//! # Usage
//!
//! ```text
//! rebalancer run               # scheduler and workers in one process
//! rebalancer worker            # workers only
//! rebalancer schedule          # scheduler only
//! rebalancer schedule --once   # enqueue the periodic jobs once and exit
//! rebalancer config show       # print the effective configuration
//! ```
//!
//! The configuration is read from `config.yml` in the folder passed with `--config`, which
//! defaults to `.rebalancer`. Selected options can be overridden with command line arguments or
//! environment variables, see `rebalancer --help`.

mod cli;
mod cliapp;
mod setup;

use std::process;

#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

pub fn main() {
    let exit_code = match cli::execute() {
        Ok(()) => 0,
        Err(err) => {
            rebalancer_log::ensure_error(&err);
            1
        }
    };

    process::exit(exit_code);
}
