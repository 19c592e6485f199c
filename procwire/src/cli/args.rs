//! CLI argument definitions.

use std::ffi::OsString;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::{Parser, Subcommand};
use procwire::{Signal, TeardownStep};

/// Procwire - run a child process under supervision
#[derive(Parser, Debug)]
#[command(name = "procwire")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a program, stream its output, and exit with its status
    Run {
        /// Teardown step on cancellation, e.g. SIGTERM:5000 (repeatable;
        /// SIGKILL always follows)
        #[arg(long = "teardown", value_name = "SIG:MILLIS", value_parser = parse_teardown_step)]
        teardown: Vec<TeardownStep>,

        /// Tear the child down after this many seconds
        #[arg(long, value_name = "SECS")]
        timeout: Option<f64>,

        /// Feed this file to the child's stdin instead of inheriting it
        #[arg(long, value_name = "FILE")]
        stdin: Option<PathBuf>,

        /// Working directory for the child
        #[arg(long, value_name = "DIR")]
        cwd: Option<PathBuf>,

        /// Set an environment variable (repeatable)
        #[arg(long = "env", value_name = "K=V", value_parser = parse_env_pair)]
        env: Vec<(String, String)>,

        /// Start from an empty environment
        #[arg(long)]
        clear_env: bool,

        /// Print a JSON summary to stderr when the child finishes
        #[arg(long)]
        json: bool,

        /// Program and its arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<OsString>,
    },
}

/// Parse `SIG:MILLIS`, where `SIG` is a name like `SIGTERM` or `TERM`.
pub fn parse_teardown_step(raw: &str) -> Result<TeardownStep, String> {
    let (name, millis) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected SIG:MILLIS, got '{raw}'"))?;

    let name = name.trim().to_ascii_uppercase();
    let name = if name.starts_with("SIG") {
        name
    } else {
        format!("SIG{name}")
    };
    let signal = Signal::from_str(&name).map_err(|_| format!("unknown signal '{name}'"))?;

    let millis: u64 = millis
        .trim()
        .parse()
        .map_err(|_| format!("invalid grace period '{millis}'"))?;

    Ok(TeardownStep::new(signal, Duration::from_millis(millis)))
}

/// Parse `KEY=VALUE`.
pub fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, _)) if key.is_empty() => Err(format!("empty variable name in '{raw}'")),
        Some((key, value)) => Ok((key.to_string(), value.to_string())),
        None => Err(format!("expected K=V, got '{raw}'")),
    }
}
