//! Live handle over a spawned child.
//!
//! An [`Execution`] joins the child's pid, its registration with the
//! [`ProcessMonitor`], and the parent ends of its pipes. It moves through
//!
//! ```text
//! Running ──(monitor resolves)──────────▶ Terminated
//!    └─────(cancellation / teardown)────▶ TornDown
//! ```
//!
//! Both end states are terminal and converge on every owned descriptor being
//! closed.

use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::net::unix::pipe;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::TeardownStep;
use crate::error::{Error, Result};
use crate::io::{InputWriter, OutputStream};
use crate::monitor::{ProcessMonitor, TerminationStatus};
use crate::stdio::PipeSlot;

/// Where an [`Execution`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    /// The child has not been observed to terminate.
    Running,
    /// The monitor delivered the child's status.
    Terminated(TerminationStatus),
    /// Teardown ran to completion. Holds the status it observed, if any.
    TornDown(Option<TerminationStatus>),
}

type Termination = oneshot::Receiver<TerminationStatus>;

/// Handle to a running child process.
#[derive(Debug)]
pub struct Execution {
    pid: Pid,
    program: String,
    monitor: ProcessMonitor,
    state: ExecutionState,
    termination: Option<Termination>,
    teardown_steps: Vec<TeardownStep>,
    stdin: Option<InputWriter>,
    stdout: Option<OutputStream>,
    stderr: Option<OutputStream>,
    stdin_slot: Option<Arc<PipeSlot<pipe::Sender>>>,
    output_slots: Vec<Arc<PipeSlot<pipe::Receiver>>>,
}

/// Parent-side pipe ends handed over by the spawner.
pub(crate) struct Endpoints {
    pub(crate) stdin: Option<pipe::Sender>,
    pub(crate) stdout: Option<pipe::Receiver>,
    pub(crate) stderr: Option<pipe::Receiver>,
    pub(crate) chunk_size: usize,
}

impl Execution {
    pub(crate) fn new(
        pid: Pid,
        program: String,
        monitor: ProcessMonitor,
        teardown_steps: Vec<TeardownStep>,
        endpoints: Endpoints,
    ) -> Self {
        let stdin_slot = endpoints.stdin.map(|end| PipeSlot::new(end, "stdin"));
        let stdout_slot = endpoints.stdout.map(|end| PipeSlot::new(end, "stdout"));
        let stderr_slot = endpoints.stderr.map(|end| PipeSlot::new(end, "stderr"));

        let stream = |slot: &Arc<PipeSlot<pipe::Receiver>>| {
            OutputStream::new(Arc::clone(slot), endpoints.chunk_size)
        };

        Self {
            pid,
            program,
            monitor,
            state: ExecutionState::Running,
            termination: None,
            teardown_steps,
            stdin: stdin_slot.as_ref().map(|slot| InputWriter::new(Arc::clone(slot))),
            stdout: stdout_slot.as_ref().map(stream),
            stderr: stderr_slot.as_ref().map(stream),
            stdin_slot,
            output_slots: stdout_slot.into_iter().chain(stderr_slot).collect(),
        }
    }

    /// The child's process id.
    pub const fn pid(&self) -> Pid {
        self.pid
    }

    /// Current lifecycle state.
    pub const fn state(&self) -> ExecutionState {
        self.state
    }

    /// Take the stdin writer, if stdin was piped.
    pub fn take_stdin(&mut self) -> Option<InputWriter> {
        self.stdin.take()
    }

    /// Take the stdout stream, if stdout was piped.
    pub fn take_stdout(&mut self) -> Option<OutputStream> {
        self.stdout.take()
    }

    /// Take the stderr stream, if stderr was piped.
    pub fn take_stderr(&mut self) -> Option<OutputStream> {
        self.stderr.take()
    }

    /// Wait for the child to terminate.
    ///
    /// Once resolved, every later call returns the same status. Fails with
    /// [`Error::InvalidState`] if teardown finished without observing one.
    /// Cancel-safe: dropping the future keeps the registration.
    pub async fn wait(&mut self) -> Result<TerminationStatus> {
        match self.state {
            ExecutionState::Terminated(status) | ExecutionState::TornDown(Some(status)) => {
                return Ok(status)
            }
            ExecutionState::TornDown(None) => {
                return Err(Error::InvalidState("execution already torn down"))
            }
            ExecutionState::Running => {}
        }

        let rx = self.registration();
        let status = rx.await.map_err(|_| self.lost_notifier())?;
        self.termination = None;
        self.state = ExecutionState::Terminated(status);
        debug!(pid = %self.pid, %status, "child terminated");
        Ok(status)
    }

    /// Return the status if the child has already terminated.
    pub fn try_status(&mut self) -> Result<Option<TerminationStatus>> {
        match self.state {
            ExecutionState::Terminated(status) | ExecutionState::TornDown(Some(status)) => {
                Ok(Some(status))
            }
            ExecutionState::TornDown(None) => Ok(None),
            ExecutionState::Running => match self.registration().try_recv() {
                Ok(status) => {
                    self.termination = None;
                    self.state = ExecutionState::Terminated(status);
                    Ok(Some(status))
                }
                Err(oneshot::error::TryRecvError::Empty) => Ok(None),
                Err(oneshot::error::TryRecvError::Closed) => Err(self.lost_notifier()),
            },
        }
    }

    /// Send `signal` to the child. A child that is already gone is not an
    /// error.
    ///
    /// Nothing is sent once the monitor holds the child's status: the pid
    /// may already belong to an unrelated process.
    pub fn signal(&mut self, signal: Signal) -> Result<()> {
        if self.try_status()?.is_some() || !matches!(self.state, ExecutionState::Running) {
            return Ok(());
        }
        send_signal(self.pid, signal)
    }

    /// Wait for termination, or run the configured teardown if `cancel`
    /// fires first.
    pub async fn wait_or_teardown(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<TerminationStatus> {
        tokio::select! {
            biased;
            status = self.wait() => status,
            () = cancel.cancelled() => {
                debug!(pid = %self.pid, "wait cancelled, tearing down");
                let steps = self.teardown_steps.clone();
                self.teardown(&steps).await
            }
        }
    }

    /// Escalate through `sequence`, then kill unconditionally.
    ///
    /// Each step sends its signal and waits up to its grace period for the
    /// child to terminate. Returns only once the child is confirmed dead, and
    /// closes every descriptor this execution still owns.
    pub async fn teardown(&mut self, sequence: &[TeardownStep]) -> Result<TerminationStatus> {
        let outcome = match self.state {
            ExecutionState::Terminated(status) | ExecutionState::TornDown(Some(status)) => {
                Ok(status)
            }
            ExecutionState::TornDown(None) => {
                Err(Error::InvalidState("execution already torn down"))
            }
            ExecutionState::Running => {
                let pid = self.pid;
                let rx = self.registration();
                escalate(pid, rx, sequence).await
            }
        };

        if matches!(self.state, ExecutionState::Running) {
            self.termination = None;
        }
        self.close_descriptors().await;
        self.state = ExecutionState::TornDown(outcome.as_ref().ok().copied());
        outcome
    }

    /// Close every descriptor still owned by this execution.
    pub async fn close_descriptors(&mut self) {
        if let Some(slot) = &self.stdin_slot {
            slot.close().await;
        }
        for slot in &self.output_slots {
            slot.close().await;
        }
    }

    fn registration(&mut self) -> &mut Termination {
        let (monitor, pid) = (&self.monitor, self.pid);
        self.termination.get_or_insert_with(|| monitor.claim(pid))
    }

    fn lost_notifier(&self) -> Error {
        Error::Monitor(format!(
            "termination notifier for {} ({}) dropped",
            self.pid, self.program
        ))
    }
}

impl Drop for Execution {
    fn drop(&mut self) {
        if let Some(slot) = &self.stdin_slot {
            slot.close_now();
        }
        for slot in &self.output_slots {
            slot.close_now();
        }

        if !matches!(self.state, ExecutionState::Running) {
            return;
        }
        let pid = self.pid;
        let rx = self.termination.take().unwrap_or_else(|| self.monitor.claim(pid));
        let steps = std::mem::take(&mut self.teardown_steps);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(%pid, "execution dropped while running, scheduling teardown");
                handle.spawn(async move {
                    let mut rx = rx;
                    if let Err(e) = escalate(pid, &mut rx, &steps).await {
                        warn!(%pid, error = %e, "teardown of dropped execution failed");
                    }
                });
            }
            Err(_) => {
                // No runtime to drive the sequence: kill outright. The monitor
                // discards the status once the child is reaped.
                let mut rx = rx;
                if matches!(rx.try_recv(), Err(oneshot::error::TryRecvError::Empty)) {
                    debug!(%pid, "execution dropped outside a runtime, killing");
                    let _ = send_signal(pid, Signal::SIGKILL);
                }
            }
        }
    }
}

/// Run each step, then the implicit kill, until the child is observed dead.
async fn escalate(
    pid: Pid,
    rx: &mut Termination,
    sequence: &[TeardownStep],
) -> Result<TerminationStatus> {
    for step in TeardownStep::sequence(sequence) {
        // Never signal a pid whose status is already in hand.
        match rx.try_recv() {
            Ok(status) => return Ok(status),
            Err(oneshot::error::TryRecvError::Closed) => {
                return Err(Error::Monitor(format!("termination notifier for {pid} dropped")));
            }
            Err(oneshot::error::TryRecvError::Empty) => {}
        }

        debug!(%pid, signal = %step.signal, grace = ?step.grace, "teardown step");
        send_signal(pid, step.signal)?;

        if let Some(status) = wait_grace(rx, step.grace).await? {
            debug!(%pid, %status, "child terminated during teardown");
            return Ok(status);
        }
    }

    unreachable!("teardown ended without the unbounded kill step resolving")
}

async fn wait_grace(rx: &mut Termination, grace: Duration) -> Result<Option<TerminationStatus>> {
    let lost = |_| Error::Monitor("termination notifier dropped during teardown".into());
    if grace == Duration::MAX {
        return rx.await.map(Some).map_err(lost);
    }
    match tokio::time::timeout(grace, &mut *rx).await {
        Ok(received) => received.map(Some).map_err(lost),
        Err(_elapsed) => Ok(None),
    }
}

fn send_signal(pid: Pid, signal: Signal) -> Result<()> {
    match kill(pid, signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(Error::Signal { pid, errno }),
    }
}
