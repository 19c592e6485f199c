//! Turning a [`Configuration`] into a running child.

use std::os::fd::{AsRawFd, OwnedFd};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use tracing::{debug, warn};

use crate::config::Configuration;
use crate::error::{errno_of, Error, Result};
use crate::execution::{Endpoints, Execution};
use crate::monitor::ProcessMonitor;
use crate::platform::{self, PreparedCommand};
use crate::stdio::{Direction, ParentEnd, StreamSetup, Stdio};

/// Spawn `config` with the given wiring for stdin, stdout and stderr.
///
/// Must be called from within a tokio runtime: piped ends are registered
/// with its reactor, and teardown of a dropped [`Execution`] runs on it.
///
/// On failure every descriptor opened for this attempt is closed before
/// [`Error::SpawnFailed`] is returned.
///
/// # Example
///
/// ```rust,no_run
/// use procwire::{spawn, Configuration, Stdio};
///
/// #[tokio::main]
/// async fn main() -> procwire::Result<()> {
///     let config = Configuration::new("/bin/echo").arg("hi");
///     let mut execution = spawn(&config, Stdio::Null, Stdio::Piped, Stdio::Inherit)?;
///     let stdout = execution.take_stdout().expect("stdout is piped");
///     let output = stdout.read_to_end().await?;
///     let status = execution.wait().await?;
///     assert_eq!(&output[..], b"hi\n");
///     assert!(status.success());
///     Ok(())
/// }
/// ```
pub fn spawn(config: &Configuration, stdin: Stdio, stdout: Stdio, stderr: Stdio) -> Result<Execution> {
    tokio::runtime::Handle::try_current()
        .map_err(|_| Error::InvalidState("spawn called outside a tokio runtime"))?;

    // The reaper has to be listening before the child can exit.
    let monitor = ProcessMonitor::global()?;
    let program = config.program_display();
    let fail = |errno: Errno| Error::spawn_failed(program.clone(), errno);

    let command = PreparedCommand::new(config).map_err(fail)?;
    let stdin = stdin.open(Direction::Read).map_err(|e| fail(errno_of(&e)))?;
    let stdout = stdout.open(Direction::Write).map_err(|e| fail(errno_of(&e)))?;
    let stderr = stderr.open(Direction::Write).map_err(|e| fail(errno_of(&e)))?;

    let child_fds = [&stdin, &stdout, &stderr].map(|setup| raw_child_fd(setup.child.as_ref()));

    let pid = match platform::spawn_child(&command, child_fds) {
        Ok(pid) => pid,
        Err(failure) => {
            if let Some(pid) = failure.pid {
                if failure.orphaned {
                    let _ = kill(pid, Signal::SIGKILL);
                }
                monitor.discard(pid);
            }
            warn!(program = %program, errno = %failure.errno, "spawn failed");
            // `command`, `stdin`, `stdout` and `stderr` drop here, closing
            // every descriptor opened for this attempt.
            return Err(fail(failure.errno));
        }
    };

    // The child holds its own copies now.
    let (stdin, stdout, stderr) = (parent_end(stdin), parent_end(stdout), parent_end(stderr));
    debug!(%pid, program = %program, "spawned child");

    let endpoints = Endpoints {
        stdin: stdin.and_then(ParentEnd::into_sender),
        stdout: stdout.and_then(ParentEnd::into_receiver),
        stderr: stderr.and_then(ParentEnd::into_receiver),
        chunk_size: config.chunk_size,
    };

    Ok(Execution::new(
        pid,
        program,
        monitor.clone(),
        config.platform.teardown_sequence(),
        endpoints,
    ))
}

fn raw_child_fd(fd: Option<&OwnedFd>) -> Option<std::os::fd::RawFd> {
    fd.map(AsRawFd::as_raw_fd)
}

fn parent_end(setup: StreamSetup) -> Option<ParentEnd> {
    drop(setup.child);
    setup.parent
}
