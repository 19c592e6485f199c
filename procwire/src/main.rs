//! Procwire - run a child process under supervision.
//!
//! A thin client over the `procwire` library: spawns the program with piped
//! output, forwards each chunk as it arrives, tears the child down on Ctrl-C
//! or timeout, and exits with the child's status.

mod cli;

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{execute, Cli};

/// Environment variable holding the log filter.
const LOG_ENV: &str = "PROCWIRE_LOG";

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();
    execute(cli).await
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
