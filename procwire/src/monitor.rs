//! Process-wide termination monitor.
//!
//! One reaper per process listens for SIGCHLD and drains every exited child
//! with `waitpid(-1, WNOHANG)`. Each collected status is matched against a
//! table of pending waiters keyed by pid:
//!
//! - a waiter already registered for the pid is resolved and removed;
//! - otherwise the status is parked until someone claims it.
//!
//! The table holds at most one entry per pid, and every access goes through a
//! single mutex. Delivery happens through a `oneshot` channel, so a status can
//! only ever be handed out once.
//!
//! The reaper collects *any* exited child, so it must be the only code in the
//! process reaping children. Mixing it with `std::process::Child::wait` or
//! `tokio::process` in the same process will steal statuses.
//!
//! A broken table invariant observed by the reaper aborts the process: a
//! reaper that died quietly would leave every present and future waiter
//! hanging.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{mpsc, Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread;

use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use serde::Serialize;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::oneshot;
use tracing::{debug, error, trace, warn};

use crate::error::{Error, Result};

/// How a process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminationStatus {
    /// Exited normally with this code.
    Exited(i32),
    /// Killed by this signal number.
    Signaled(i32),
}

impl TerminationStatus {
    /// Whether the process exited with code 0.
    pub const fn success(self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// The exit code, if the process exited normally.
    pub const fn code(self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(code),
            Self::Signaled(_) => None,
        }
    }

    /// The terminating signal, if any.
    pub const fn signal(self) -> Option<i32> {
        match self {
            Self::Exited(_) => None,
            Self::Signaled(sig) => Some(sig),
        }
    }

    fn from_wait_status(status: WaitStatus) -> Option<(Pid, Self)> {
        match status {
            WaitStatus::Exited(pid, code) => Some((pid, Self::Exited(code))),
            WaitStatus::Signaled(pid, sig, _) => Some((pid, Self::Signaled(sig as i32))),
            WaitStatus::StillAlive => None,
            // Stop/continue/ptrace reports are never requested.
            other => unreachable!("unrecognized wait status from reaper: {other:?}"),
        }
    }
}

impl fmt::Display for TerminationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exit code: {code}"),
            Self::Signaled(sig) => write!(f, "signal: {sig}"),
        }
    }
}

enum Entry {
    Waiting(oneshot::Sender<TerminationStatus>),
    Collected(TerminationStatus),
}

#[derive(Default)]
struct PendingWaiters {
    entries: HashMap<Pid, Entry>,
}

impl PendingWaiters {
    fn resolve(&mut self, pid: Pid, status: TerminationStatus) {
        match self.entries.remove(&pid) {
            Some(Entry::Waiting(tx)) => {
                // A dropped receiver means the handle was abandoned.
                let _ = tx.send(status);
            }
            Some(Entry::Collected(previous)) => {
                panic!("pid {pid} reaped twice (previous status {previous})");
            }
            None => {
                self.entries.insert(pid, Entry::Collected(status));
            }
        }
    }

    fn claim(&mut self, pid: Pid) -> oneshot::Receiver<TerminationStatus> {
        let (tx, rx) = oneshot::channel();
        match self.entries.remove(&pid) {
            Some(Entry::Collected(status)) => {
                let _ = tx.send(status);
            }
            Some(Entry::Waiting(_)) => {
                panic!("duplicate waiter registered for pid {pid}");
            }
            None => {
                self.entries.insert(pid, Entry::Waiting(tx));
            }
        }
        rx
    }
}

/// Handle to a termination monitor. Cheap to clone.
#[derive(Clone)]
pub struct ProcessMonitor {
    table: Arc<Mutex<PendingWaiters>>,
}

impl fmt::Debug for ProcessMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessMonitor")
            .field("pending", &self.pending())
            .finish()
    }
}

static GLOBAL: OnceLock<std::result::Result<ProcessMonitor, String>> = OnceLock::new();

impl ProcessMonitor {
    /// The process-wide monitor, installing the SIGCHLD reaper on first use.
    ///
    /// Installation happens exactly once. It blocks until the signal
    /// listener is registered, so any child forked after this returns is
    /// guaranteed to be observed.
    pub fn global() -> Result<&'static Self> {
        GLOBAL
            .get_or_init(Self::install)
            .as_ref()
            .map_err(|e| Error::Monitor(e.clone()))
    }

    /// A monitor with its own table and no reaper attached. Statuses are fed
    /// in through [`ProcessMonitor::resolve`].
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self::with_empty_table()
    }

    fn with_empty_table() -> Self {
        Self {
            table: Arc::new(Mutex::new(PendingWaiters::default())),
        }
    }

    fn install() -> std::result::Result<Self, String> {
        let monitor = Self::with_empty_table();
        let reaper = monitor.clone();
        let (ready_tx, ready_rx) = mpsc::sync_channel::<std::result::Result<(), String>>(1);

        thread::Builder::new()
            .name("procwire-reaper".into())
            .spawn(move || reaper.run_reaper(&ready_tx))
            .map_err(|e| format!("failed to start reaper thread: {e}"))?;

        ready_rx
            .recv()
            .map_err(|_| "reaper thread exited during startup".to_string())??;
        debug!("SIGCHLD reaper installed");
        Ok(monitor)
    }

    fn run_reaper(&self, ready: &mpsc::SyncSender<std::result::Result<(), String>>) {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                let _ = ready.send(Err(format!("failed to build reaper runtime: {e}")));
                return;
            }
        };

        runtime.block_on(async {
            let mut sigchld = match signal(SignalKind::child()) {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready.send(Err(format!("failed to listen for SIGCHLD: {e}")));
                    return;
                }
            };
            let _ = ready.send(Ok(()));

            // Children may have exited before the listener existed.
            self.reap_or_abort();
            while sigchld.recv().await.is_some() {
                self.reap_or_abort();
            }
        });
    }

    /// Run a drain pass; a violated table invariant is fatal to the process.
    fn reap_or_abort(&self) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| self.reap_exited())) {
            let reason = payload
                .downcast_ref::<String>()
                .map(String::as_str)
                .or_else(|| payload.downcast_ref::<&str>().copied())
                .unwrap_or("unknown panic");
            error!(reason, "process monitor invariant violated, aborting");
            std::process::abort();
        }
    }

    /// Collect every exited child and resolve its waiter.
    ///
    /// Signals of the same kind coalesce, so one notification may stand for
    /// several deaths; the loop runs until the kernel reports nothing left.
    /// A `waitpid` failure other than "no children" ends this pass early.
    /// Children not yet collected are picked up on the next notification.
    fn reap_exited(&self) {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(status) => match TerminationStatus::from_wait_status(status) {
                    Some((pid, status)) => {
                        trace!(%pid, %status, "reaped child");
                        self.resolve(pid, status);
                    }
                    None => break,
                },
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => break,
                Err(errno) => {
                    warn!(%errno, "waitpid failed, abandoning drain pass");
                    break;
                }
            }
        }
    }

    /// Record a collected status for `pid`.
    ///
    /// Resolves a registered waiter, or parks the status for a later claim.
    ///
    /// # Panics
    ///
    /// Panics if a status for `pid` is already parked: a pid cannot
    /// terminate twice without being claimed in between.
    pub(crate) fn resolve(&self, pid: Pid, status: TerminationStatus) {
        self.lock().resolve(pid, status);
    }

    /// Claim the termination status of `pid`.
    ///
    /// The returned receiver is already completed if the status was parked;
    /// otherwise it completes when the reaper collects the child.
    ///
    /// # Panics
    ///
    /// Panics if another waiter is already registered for `pid`.
    pub(crate) fn claim(&self, pid: Pid) -> oneshot::Receiver<TerminationStatus> {
        self.lock().claim(pid)
    }

    /// Wait for `pid` to terminate.
    ///
    /// # Panics
    ///
    /// Panics if another waiter is already registered for `pid`, such as the
    /// [`crate::Execution`] that owns it.
    pub async fn wait_for_termination(&self, pid: Pid) -> Result<TerminationStatus> {
        self.claim(pid)
            .await
            .map_err(|_| Error::Monitor(format!("termination notifier for {pid} dropped")))
    }

    /// Drop interest in `pid`: a parked status is discarded, and a status
    /// arriving later is dropped on delivery.
    pub(crate) fn discard(&self, pid: Pid) {
        drop(self.claim(pid));
    }

    /// Number of pids with a registered waiter or a parked status.
    pub fn pending(&self) -> usize {
        self.lock().entries.len()
    }

    fn lock(&self) -> MutexGuard<'_, PendingWaiters> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pid(raw: i32) -> Pid {
        Pid::from_raw(raw)
    }

    #[tokio::test]
    async fn test_wait_before_exit() {
        let monitor = ProcessMonitor::detached();
        let waiter = {
            let monitor = monitor.clone();
            tokio::spawn(async move { monitor.wait_for_termination(pid(100)).await })
        };

        // Let the waiter register before the status arrives.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(monitor.pending(), 1);
        monitor.resolve(pid(100), TerminationStatus::Exited(3));

        let status = waiter.await.unwrap().unwrap();
        assert_eq!(status, TerminationStatus::Exited(3));
        assert_eq!(monitor.pending(), 0);
    }

    #[tokio::test]
    async fn test_wait_after_exit() {
        let monitor = ProcessMonitor::detached();
        monitor.resolve(pid(101), TerminationStatus::Exited(3));
        assert_eq!(monitor.pending(), 1);

        let status = monitor.wait_for_termination(pid(101)).await.unwrap();
        assert_eq!(status, TerminationStatus::Exited(3));
        assert_eq!(monitor.pending(), 0);
    }

    #[tokio::test]
    async fn test_many_pids_resolved_independently() {
        let monitor = ProcessMonitor::detached();
        let mut waiters = Vec::new();
        for raw in 200..264 {
            if raw % 2 == 0 {
                monitor.resolve(pid(raw), TerminationStatus::Exited(raw));
            }
            waiters.push((raw, monitor.claim(pid(raw))));
        }
        for raw in (201..264).step_by(2) {
            monitor.resolve(pid(raw), TerminationStatus::Signaled(9));
        }

        for (raw, rx) in waiters {
            let expected = if raw % 2 == 0 {
                TerminationStatus::Exited(raw)
            } else {
                TerminationStatus::Signaled(9)
            };
            assert_eq!(rx.await.unwrap(), expected);
        }
        assert_eq!(monitor.pending(), 0);
    }

    #[test]
    fn test_discard_removes_parked_status() {
        let monitor = ProcessMonitor::detached();
        monitor.resolve(pid(300), TerminationStatus::Exited(127));
        monitor.discard(pid(300));
        assert_eq!(monitor.pending(), 0);
    }

    #[test]
    fn test_discard_before_exit_drops_late_status() {
        let monitor = ProcessMonitor::detached();
        monitor.discard(pid(301));
        assert_eq!(monitor.pending(), 1);
        monitor.resolve(pid(301), TerminationStatus::Exited(0));
        assert_eq!(monitor.pending(), 0);
    }

    #[test]
    #[should_panic(expected = "duplicate waiter")]
    fn test_duplicate_waiter_panics() {
        let monitor = ProcessMonitor::detached();
        let _first = monitor.claim(pid(400));
        let _second = monitor.claim(pid(400));
    }

    const CORRUPT_TABLE_ENV: &str = "PROCWIRE_CORRUPT_REAPER_TABLE";

    /// Run in a child test process by the test below: plants a status for a
    /// live child so the reaper later sees the pid terminate twice.
    #[tokio::test]
    #[ignore = "only meaningful when launched by test_reaper_invariant_violation_aborts"]
    async fn corrupted_reaper_table() {
        if std::env::var_os(CORRUPT_TABLE_ENV).is_none() {
            return;
        }
        let monitor = ProcessMonitor::global().unwrap();
        let config = crate::Configuration::new("sleep").arg("30");
        let execution =
            crate::spawn(&config, crate::Stdio::Null, crate::Stdio::Null, crate::Stdio::Null)
                .unwrap();
        monitor.resolve(execution.pid(), TerminationStatus::Exited(0));
        nix::sys::signal::kill(execution.pid(), nix::sys::signal::Signal::SIGKILL).unwrap();

        // The reaper should take the whole process down before this ends.
        tokio::time::sleep(Duration::from_secs(10)).await;
    }

    #[tokio::test]
    async fn test_reaper_invariant_violation_aborts() {
        let exe = std::env::current_exe().unwrap();
        let config = crate::Configuration::new(exe)
            .args([
                "monitor::tests::corrupted_reaper_table",
                "--exact",
                "--ignored",
                "--test-threads=1",
            ])
            .env(CORRUPT_TABLE_ENV, "1");
        let mut child =
            crate::spawn(&config, crate::Stdio::Null, crate::Stdio::Null, crate::Stdio::Null)
                .unwrap();

        let status = tokio::time::timeout(Duration::from_secs(20), child.wait())
            .await
            .expect("child test process did not abort")
            .unwrap();
        assert_eq!(
            status,
            TerminationStatus::Signaled(nix::sys::signal::Signal::SIGABRT as i32)
        );
    }

    #[test]
    fn test_status_accessors() {
        assert!(TerminationStatus::Exited(0).success());
        assert!(!TerminationStatus::Exited(1).success());
        assert_eq!(TerminationStatus::Exited(1).code(), Some(1));
        assert_eq!(TerminationStatus::Signaled(15).code(), None);
        assert_eq!(TerminationStatus::Signaled(15).signal(), Some(15));
        assert_eq!(TerminationStatus::Signaled(9).to_string(), "signal: 9");
        assert_eq!(
            serde_json::to_string(&TerminationStatus::Exited(2)).unwrap(),
            r#"{"exited":2}"#
        );
    }
}
