//! Tracing setup for the CLI.

use std::io::{self, IsTerminal};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;

/// Map repeated `-v` flags onto a default level.
fn default_level(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// Install the global subscriber. `COSH_LOG` takes a full filter directive
/// and overrides the flag-derived default.
pub fn init(verbosity: u8) {
    let filter = EnvFilter::builder()
        .with_default_directive(default_level(verbosity).into())
        .with_env_var("COSH_LOG")
        .from_env_lossy();

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal());

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .init();
}
