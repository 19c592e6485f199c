//! Procwire - spawn and supervise child processes on tokio.
//!
//! A child is described by a [`Configuration`], launched with [`spawn`]
//! and observed through an [`Execution`]:
//!
//! - a single process-wide [`ProcessMonitor`] reaps every child and routes
//!   each termination status to the one task waiting for it
//! - stdout/stderr are read lazily as [`OutputStream`]s of immutable
//!   [`Buffer`]s; stdin is fed through an [`InputWriter`]
//! - cancellation escalates through a configurable signal sequence ending
//!   in `SIGKILL`, then closes every descriptor the execution owns
//!
//! [`run`] wraps all of it for the common case of collecting output.
//!
//! Only one reaper may exist per process: do not combine this crate with
//! `std::process` or `tokio::process` waiting in the same program.

pub mod config;
pub mod error;
pub mod execution;
pub mod io;
pub mod monitor;
mod platform;
pub mod run;
pub mod spawn;
pub mod stdio;

pub use config::{Configuration, PlatformOptions, PreExecHook, TeardownStep};
pub use error::{Error, Result};
pub use execution::{Execution, ExecutionState};
pub use io::{Buffer, Input, InputWriter, OutputStream};
pub use monitor::{ProcessMonitor, TerminationStatus};
pub use run::{run, Output};
pub use spawn::spawn;
pub use stdio::Stdio;

// Signals are part of the teardown API.
pub use nix::sys::signal::Signal;
pub use nix::unistd::Pid;
