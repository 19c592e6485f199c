//! Run a child to completion and collect everything it wrote.

use std::io;

use bytes::Bytes;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::Configuration;
use crate::error::{Error, Result};
use crate::io::{Input, InputWriter};
use crate::monitor::TerminationStatus;
use crate::spawn::spawn;
use crate::stdio::Stdio;

/// Result of a completed [`run`].
#[derive(Debug, Clone, Serialize)]
pub struct Output {
    /// How the child terminated.
    pub status: TerminationStatus,

    /// Everything the child wrote to stdout.
    #[serde(skip)]
    pub stdout: Bytes,

    /// Everything the child wrote to stderr.
    #[serde(skip)]
    pub stderr: Bytes,

    /// Whether the configured timeout elapsed and the child was torn down.
    pub timed_out: bool,
}

impl Output {
    /// Whether the child exited with code 0 before any timeout.
    pub const fn success(&self) -> bool {
        self.status.success() && !self.timed_out
    }

    /// The exit code, if the child exited normally.
    pub const fn code(&self) -> Option<i32> {
        self.status.code()
    }

    /// Stdout decoded lossily as UTF-8.
    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Stderr decoded lossily as UTF-8.
    pub fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Spawn `config`, feed it `input`, and collect its output.
///
/// Stdout and stderr are drained concurrently with feeding so a child that
/// fills one pipe while the parent writes the other cannot deadlock. Without
/// `input`, the child's stdin is `/dev/null`.
///
/// When [`Configuration::timeout`] is set and elapses before the child
/// exits, the configured teardown runs and [`Output::timed_out`] is set.
///
/// # Example
///
/// ```rust,no_run
/// use procwire::{run, Configuration};
///
/// #[tokio::main]
/// async fn main() -> procwire::Result<()> {
///     let output = run(&Configuration::new("tr").args(["a-z", "A-Z"]), Some("hello".into())).await?;
///     assert_eq!(output.stdout_string(), "HELLO");
///     Ok(())
/// }
/// ```
pub async fn run(config: &Configuration, input: Option<Input>) -> Result<Output> {
    let stdin = if input.is_some() {
        Stdio::Piped
    } else {
        Stdio::Null
    };
    let mut execution = spawn(config, stdin, Stdio::Piped, Stdio::Piped)?;

    let feeder = match (execution.take_stdin(), input) {
        (Some(writer), Some(input)) => Some(tokio::spawn(feed(writer, input))),
        _ => None,
    };
    let stdout = execution.take_stdout().map(|out| tokio::spawn(out.read_to_end()));
    let stderr = execution.take_stderr().map(|err| tokio::spawn(err.read_to_end()));

    let (status, timed_out) = match config.timeout {
        None => (execution.wait().await?, false),
        Some(limit) => {
            let waited = tokio::time::timeout(limit, execution.wait()).await;
            match waited {
                Ok(status) => (status?, false),
                Err(_elapsed) => {
                    warn!(
                        program = %config.program_display(),
                        pid = %execution.pid(),
                        timeout = ?limit,
                        "child timed out, tearing down"
                    );
                    let steps = config.platform.teardown.clone();
                    (execution.teardown(&steps).await?, true)
                }
            }
        }
    };

    let stdout = collect(stdout).await?;
    let stderr = collect(stderr).await?;

    // Anything still holding stdin open is no longer our concern.
    execution.close_descriptors().await;
    if let Some(feeder) = feeder {
        feeder.await.map_err(join_failed(Error::WriteFailed))??;
    }

    debug!(%status, stdout = stdout.len(), stderr = stderr.len(), timed_out, "run finished");
    Ok(Output {
        status,
        stdout,
        stderr,
        timed_out,
    })
}

/// Feed stdin and close it. A child that stops reading early is not an error.
async fn feed(writer: InputWriter, input: Input) -> Result<()> {
    match writer.feed_and_close(input).await {
        Ok(_) => Ok(()),
        Err(Error::WriteFailed(e)) if e.kind() == io::ErrorKind::BrokenPipe => {
            debug!("child closed stdin before all input was written");
            Ok(())
        }
        Err(Error::InvalidState(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

async fn collect(task: Option<JoinHandle<Result<Bytes>>>) -> Result<Bytes> {
    match task {
        Some(task) => task.await.map_err(join_failed(Error::ReadFailed))?,
        None => Ok(Bytes::new()),
    }
}

fn join_failed(wrap: fn(io::Error) -> Error) -> impl Fn(tokio::task::JoinError) -> Error {
    move |e| wrap(io::Error::other(e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::TeardownStep;
    use nix::sys::signal::Signal;

    fn sh(script: &str) -> Configuration {
        Configuration::new("/bin/sh").args(["-c", script])
    }

    #[tokio::test]
    async fn test_run_echo() {
        let output = run(&Configuration::new("echo").arg("hello"), None).await.unwrap();
        assert!(output.success());
        assert_eq!(output.code(), Some(0));
        assert_eq!(output.stdout_string(), "hello\n");
        assert!(output.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_run_feeds_input() {
        let output = run(&Configuration::new("cat"), Some(Input::from("piped through")))
            .await
            .unwrap();
        assert_eq!(output.stdout_string(), "piped through");
    }

    #[tokio::test]
    async fn test_run_separates_stderr_and_code() {
        let output = run(&sh("echo out; echo err >&2; exit 3"), None).await.unwrap();
        assert!(!output.success());
        assert_eq!(output.code(), Some(3));
        assert_eq!(output.stdout_string(), "out\n");
        assert_eq!(output.stderr_string(), "err\n");
    }

    #[tokio::test]
    async fn test_run_large_output_on_both_pipes() {
        // Both pipes overflow their kernel buffers; only concurrent draining finishes.
        let script = "head -c 300000 /dev/zero; head -c 300000 /dev/zero >&2";
        let output = run(&sh(script), None).await.unwrap();
        assert_eq!(output.stdout.len(), 300_000);
        assert_eq!(output.stderr.len(), 300_000);
    }

    #[tokio::test]
    async fn test_run_child_ignoring_input() {
        let input = Input::from(vec![b'x'; 1 << 20]);
        let output = run(&sh("exit 0"), Some(input)).await.unwrap();
        assert!(output.success());
    }

    #[tokio::test]
    async fn test_run_timeout_tears_down() {
        let config = sh("exec sleep 30")
            .teardown(vec![TeardownStep::new(Signal::SIGTERM, Duration::from_secs(2))])
            .timeout(Duration::from_millis(200));
        let output = run(&config, None).await.unwrap();
        assert!(output.timed_out);
        assert!(!output.success());
        assert_eq!(output.status, TerminationStatus::Signaled(Signal::SIGTERM as i32));
    }

    #[tokio::test]
    async fn test_run_spawn_failure() {
        let err = run(&Configuration::new("/nonexistent/procwire-test"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SpawnFailed { .. }));
    }

    #[test]
    fn test_output_json_omits_streams() {
        let output = Output {
            status: TerminationStatus::Exited(0),
            stdout: Bytes::from_static(b"data"),
            stderr: Bytes::new(),
            timed_out: false,
        };
        let json = serde_json::to_string(&output).unwrap();
        assert_eq!(json, r#"{"status":{"exited":0},"timed_out":false}"#);
    }
}
