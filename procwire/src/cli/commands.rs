//! CLI command execution.

use std::ffi::OsString;
use std::fs::File;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use procwire::{
    spawn, Configuration, Execution, OutputStream, Stdio, TeardownStep, TerminationStatus,
};
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::args::{Cli, Commands};

/// Summary printed with `--json`.
#[derive(Debug, Serialize)]
struct RunSummary {
    program: String,
    pid: i32,
    status: TerminationStatus,
    cancelled: bool,
    stdout_bytes: u64,
    stderr_bytes: u64,
}

/// Everything `run` needs, gathered from the command line.
struct RunRequest {
    command: Vec<OsString>,
    teardown: Vec<TeardownStep>,
    timeout: Option<f64>,
    stdin: Option<PathBuf>,
    cwd: Option<PathBuf>,
    env: Vec<(String, String)>,
    clear_env: bool,
    json: bool,
}

/// Execute the parsed command line.
pub async fn execute(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Commands::Run {
            teardown,
            timeout,
            stdin,
            cwd,
            env,
            clear_env,
            json,
            command,
        } => {
            run_command(RunRequest {
                command,
                teardown,
                timeout,
                stdin,
                cwd,
                env,
                clear_env,
                json,
            })
            .await
        }
    }
}

async fn run_command(request: RunRequest) -> Result<ExitCode> {
    let config = build_configuration(&request)?;
    let timeout = request.timeout.map(parse_timeout).transpose()?;

    let stdin = match &request.stdin {
        Some(path) => Stdio::from(
            File::open(path).with_context(|| format!("Failed to open {}", path.display()))?,
        ),
        None => Stdio::Inherit,
    };

    let mut execution = spawn(&config, stdin, Stdio::Piped, Stdio::Piped)
        .with_context(|| format!("Failed to spawn {}", config.program_display()))?;
    debug!(pid = %execution.pid(), "spawned");

    let stdout = forward(execution.take_stdout(), tokio::io::stdout());
    let stderr = forward(execution.take_stderr(), tokio::io::stderr());

    let cancel = CancellationToken::new();
    let watcher = watch_for_cancellation(cancel.clone(), timeout);

    let status = execution
        .wait_or_teardown(&cancel)
        .await
        .context("Failed waiting for child")?;
    watcher.abort();

    let stdout_bytes = finish_forward(stdout).await?;
    let stderr_bytes = finish_forward(stderr).await?;
    execution.close_descriptors().await;

    if request.json {
        print_summary(&config, &execution, status, cancel.is_cancelled(), stdout_bytes, stderr_bytes)?;
    }

    Ok(exit_code(status))
}

fn build_configuration(request: &RunRequest) -> Result<Configuration> {
    let Some((program, args)) = request.command.split_first() else {
        bail!("No program given");
    };

    let mut config = Configuration::new(program.clone()).args(args.iter().cloned());
    if request.clear_env {
        config = config.env_clear();
    }
    config = config.envs(request.env.iter().cloned());
    if let Some(dir) = &request.cwd {
        config = config.working_dir(dir.clone());
    }
    if !request.teardown.is_empty() {
        config = config.teardown(request.teardown.clone());
    }
    Ok(config)
}

fn parse_timeout(secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs).with_context(|| format!("Invalid timeout: {secs}"))
}

/// Cancel on Ctrl-C or when `timeout` elapses.
fn watch_for_cancellation(cancel: CancellationToken, timeout: Option<Duration>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let deadline = async {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => debug!("interrupted"),
            () = deadline => debug!("timeout elapsed"),
        }
        cancel.cancel();
    })
}

/// Copy every chunk of `output` to `sink` as it arrives.
fn forward<W>(output: Option<OutputStream>, mut sink: W) -> Option<JoinHandle<Result<u64>>>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut output = output?;
    Some(tokio::spawn(async move {
        let mut total = 0_u64;
        while let Some(chunk) = output.next_chunk().await {
            let chunk = chunk.context("Failed to read child output")?;
            sink.write_all(&chunk).await.context("Failed to forward child output")?;
            sink.flush().await.context("Failed to forward child output")?;
            total += chunk.len() as u64;
        }
        Ok(total)
    }))
}

async fn finish_forward(task: Option<JoinHandle<Result<u64>>>) -> Result<u64> {
    match task {
        Some(task) => task.await.context("Output forwarder panicked")?,
        None => Ok(0),
    }
}

fn print_summary(
    config: &Configuration,
    execution: &Execution,
    status: TerminationStatus,
    cancelled: bool,
    stdout_bytes: u64,
    stderr_bytes: u64,
) -> Result<()> {
    let summary = RunSummary {
        program: config.program_display(),
        pid: execution.pid().as_raw(),
        status,
        cancelled,
        stdout_bytes,
        stderr_bytes,
    };
    let json = serde_json::to_string(&summary).context("Failed to encode summary")?;
    eprintln!("{json}");
    Ok(())
}

/// Shell convention: the exit code, or 128 plus the signal number.
fn exit_code(status: TerminationStatus) -> ExitCode {
    let code = match status {
        TerminationStatus::Exited(code) => code,
        TerminationStatus::Signaled(signal) => 128 + signal,
    };
    ExitCode::from(u8::try_from(code & 0xff).unwrap_or(u8::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use procwire::Signal;

    fn request(command: &[&str]) -> RunRequest {
        RunRequest {
            command: command.iter().map(OsString::from).collect(),
            teardown: Vec::new(),
            timeout: None,
            stdin: None,
            cwd: None,
            env: Vec::new(),
            clear_env: false,
            json: false,
        }
    }

    #[test]
    fn test_build_configuration() {
        let mut req = request(&["ls", "-la", "/tmp"]);
        req.env = vec![("A".into(), "1".into())];
        req.clear_env = true;
        req.teardown = vec![TeardownStep::new(Signal::SIGINT, Duration::from_millis(10))];

        let config = build_configuration(&req).unwrap();
        assert_eq!(config.program, OsString::from("ls"));
        assert_eq!(config.args.len(), 2);
        assert!(config.env_clear);
        assert_eq!(config.env.get(&OsString::from("A")), Some(&OsString::from("1")));
        assert_eq!(config.platform.teardown[0].signal, Signal::SIGINT);
    }

    #[test]
    fn test_build_configuration_keeps_default_teardown() {
        let config = build_configuration(&request(&["true"])).unwrap();
        assert_eq!(config.platform.teardown[0].signal, Signal::SIGTERM);
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(build_configuration(&request(&[])).is_err());
    }

    #[test]
    fn test_parse_timeout() {
        assert_eq!(parse_timeout(1.5).unwrap(), Duration::from_millis(1500));
        assert!(parse_timeout(-1.0).is_err());
    }

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(exit_code(TerminationStatus::Exited(0)), ExitCode::from(0));
        assert_eq!(exit_code(TerminationStatus::Exited(3)), ExitCode::from(3));
        assert_eq!(exit_code(TerminationStatus::Signaled(9)), ExitCode::from(137));
    }

    #[tokio::test]
    async fn test_run_command_exit_status() {
        let code = run_command(request(&["/bin/sh", "-c", "exit 4"])).await.unwrap();
        assert_eq!(code, ExitCode::from(4));
    }

    #[tokio::test]
    async fn test_run_command_timeout_tears_down() {
        let mut req = request(&["/bin/sh", "-c", "exec sleep 30"]);
        req.timeout = Some(0.2);
        let code = run_command(req).await.unwrap();
        assert_eq!(code, ExitCode::from(128 + Signal::SIGTERM as u8));
    }
}
