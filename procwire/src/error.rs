//! Error types for process spawning, I/O, and lifecycle operations.

use std::io;

use nix::errno::Errno;
use nix::unistd::Pid;
use thiserror::Error;

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the process lifecycle layer.
#[derive(Debug, Error)]
pub enum Error {
    /// The child could not be started. Every descriptor opened for the
    /// attempt has already been closed when this is returned.
    #[error("failed to spawn {program}: {errno}")]
    SpawnFailed {
        /// Program that was being started.
        program: String,
        /// Underlying OS error.
        errno: Errno,
    },

    /// Writing to the child's stdin failed.
    #[error("failed to write to child stdin: {0}")]
    WriteFailed(#[source] io::Error),

    /// Reading from a child output pipe failed.
    #[error("failed to read child output: {0}")]
    ReadFailed(#[source] io::Error),

    /// The operation is not valid for the current state of the handle.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// A teardown signal could not be delivered.
    #[error("failed to signal process {pid}: {errno}")]
    Signal {
        /// Target process.
        pid: Pid,
        /// Underlying OS error.
        errno: Errno,
    },

    /// The process monitor is unavailable or lost a notification channel.
    #[error("process monitor: {0}")]
    Monitor(String),
}

impl Error {
    pub(crate) fn spawn_failed(program: impl Into<String>, errno: Errno) -> Self {
        Self::SpawnFailed {
            program: program.into(),
            errno,
        }
    }

    /// The OS error code behind a failed spawn, if this is one.
    pub fn spawn_errno(&self) -> Option<Errno> {
        match self {
            Self::SpawnFailed { errno, .. } => Some(*errno),
            _ => None,
        }
    }
}

/// Maps an `io::Error` produced during spawn setup onto an errno.
pub(crate) fn errno_of(err: &io::Error) -> Errno {
    err.raw_os_error().map_or(Errno::EIO, Errno::from_raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_errno_accessor() {
        let err = Error::spawn_failed("/nope", Errno::ENOENT);
        assert_eq!(err.spawn_errno(), Some(Errno::ENOENT));
        assert!(err.to_string().contains("/nope"));

        let err = Error::InvalidState("stdin closed");
        assert_eq!(err.spawn_errno(), None);
    }

    #[test]
    fn test_errno_of_falls_back_to_eio() {
        let custom = io::Error::new(io::ErrorKind::Other, "no os code");
        assert_eq!(errno_of(&custom), Errno::EIO);

        let os = io::Error::from_raw_os_error(libc::EACCES);
        assert_eq!(errno_of(&os), Errno::EACCES);
    }
}
