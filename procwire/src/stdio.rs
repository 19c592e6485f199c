//! Descriptor plumbing between the parent and a child's standard streams.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;

use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::unistd::pipe2;
use tokio::net::unix::pipe;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::trace;

const DEV_NULL: &str = "/dev/null";

/// How one of the child's standard streams is wired.
#[derive(Debug, Default)]
pub enum Stdio {
    /// Share the parent's descriptor.
    #[default]
    Inherit,
    /// Connect to `/dev/null`.
    Null,
    /// Create a pipe; the parent keeps the other end.
    Piped,
    /// Hand this descriptor to the child. It is marked close-on-exec, so the
    /// child only keeps the copy installed on its standard stream, and it is
    /// closed in the parent after the fork.
    Fd(OwnedFd),
}

impl From<OwnedFd> for Stdio {
    fn from(fd: OwnedFd) -> Self {
        Self::Fd(fd)
    }
}

impl From<File> for Stdio {
    fn from(file: File) -> Self {
        Self::Fd(file.into())
    }
}

/// Which way data flows through a standard stream, from the child's view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    /// The child reads (stdin).
    Read,
    /// The child writes (stdout, stderr).
    Write,
}

/// Parent end produced for a piped stream.
pub(crate) enum ParentEnd {
    Sender(pipe::Sender),
    Receiver(pipe::Receiver),
}

impl ParentEnd {
    pub(crate) fn into_sender(self) -> Option<pipe::Sender> {
        match self {
            Self::Sender(sender) => Some(sender),
            Self::Receiver(_) => None,
        }
    }

    pub(crate) fn into_receiver(self) -> Option<pipe::Receiver> {
        match self {
            Self::Receiver(receiver) => Some(receiver),
            Self::Sender(_) => None,
        }
    }
}

/// The child's side of one standard stream plus the parent end, if piped.
pub(crate) struct StreamSetup {
    /// Descriptor to `dup2` onto the child's stream; `None` inherits.
    pub(crate) child: Option<OwnedFd>,
    pub(crate) parent: Option<ParentEnd>,
}

impl Stdio {
    /// Open the descriptors this wiring needs. Everything returned is close-on-exec,
    /// so nothing leaks into the child beyond the explicit `dup2`.
    pub(crate) fn open(self, direction: Direction) -> io::Result<StreamSetup> {
        match self {
            Self::Inherit => Ok(StreamSetup {
                child: None,
                parent: None,
            }),
            Self::Null => {
                let file = match direction {
                    Direction::Read => OpenOptions::new().read(true).open(DEV_NULL)?,
                    Direction::Write => OpenOptions::new().write(true).open(DEV_NULL)?,
                };
                Ok(StreamSetup {
                    child: Some(file.into()),
                    parent: None,
                })
            }
            Self::Fd(fd) => {
                set_cloexec(&fd)?;
                Ok(StreamSetup {
                    child: Some(fd),
                    parent: None,
                })
            }
            Self::Piped => {
                let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC)?;
                let setup = match direction {
                    Direction::Read => StreamSetup {
                        child: Some(read_end),
                        parent: Some(ParentEnd::Sender(pipe::Sender::from_owned_fd(write_end)?)),
                    },
                    Direction::Write => StreamSetup {
                        child: Some(write_end),
                        parent: Some(ParentEnd::Receiver(pipe::Receiver::from_owned_fd(
                            read_end,
                        )?)),
                    },
                };
                Ok(setup)
            }
        }
    }
}

fn set_cloexec(fd: &OwnedFd) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    let flags = FdFlag::from_bits_truncate(fcntl(raw, FcntlArg::F_GETFD)?);
    fcntl(raw, FcntlArg::F_SETFD(flags | FdFlag::FD_CLOEXEC))?;
    Ok(())
}

/// A parent-side pipe end shared between its stream/writer and the owning
/// execution. Whoever closes first drops the descriptor; closing wakes any
/// in-flight read or write.
#[derive(Debug)]
pub(crate) struct PipeSlot<P> {
    end: Mutex<Option<P>>,
    closed: CancellationToken,
    name: &'static str,
}

impl<P> PipeSlot<P> {
    pub(crate) fn new(end: P, name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            end: Mutex::new(Some(end)),
            closed: CancellationToken::new(),
            name,
        })
    }

    /// Lock the end for one I/O call, or `None` once closed.
    pub(crate) async fn acquire(&self) -> Option<tokio::sync::MutexGuard<'_, Option<P>>> {
        tokio::select! {
            biased;
            () = self.closed.cancelled() => None,
            guard = self.end.lock() => guard.is_some().then_some(guard),
        }
    }

    /// Token cancelled when the slot is closed.
    pub(crate) const fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    /// Close from async context. Returns whether this call dropped the end.
    pub(crate) async fn close(&self) -> bool {
        self.closed.cancel();
        let dropped = self.end.lock().await.take().is_some();
        if dropped {
            trace!(stream = self.name, "closed pipe end");
        }
        dropped
    }

    /// Close from a guard that is already held.
    pub(crate) fn close_held(&self, guard: &mut Option<P>) -> bool {
        self.closed.cancel();
        let dropped = guard.take().is_some();
        if dropped {
            trace!(stream = self.name, "closed pipe end");
        }
        dropped
    }

    /// Best-effort close from synchronous context.
    ///
    /// If an I/O call currently holds the end, cancellation makes it drop
    /// the end as soon as it observes the token.
    pub(crate) fn close_now(&self) {
        self.closed.cancel();
        if let Ok(mut guard) = self.end.try_lock() {
            if guard.take().is_some() {
                trace!(stream = self.name, "closed pipe end");
            }
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inherit_opens_nothing() {
        let setup = Stdio::Inherit.open(Direction::Write).unwrap();
        assert!(setup.child.is_none());
        assert!(setup.parent.is_none());
    }

    #[tokio::test]
    async fn test_null_opens_child_side_only() {
        let setup = Stdio::Null.open(Direction::Read).unwrap();
        assert!(setup.child.is_some());
        assert!(setup.parent.is_none());
    }

    #[test]
    fn test_passed_fd_becomes_close_on_exec() {
        let file = tempfile::tempfile().unwrap();
        fcntl(file.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::empty())).unwrap();

        let setup = Stdio::from(file).open(Direction::Write).unwrap();
        let child = setup.child.unwrap();
        let flags = FdFlag::from_bits_truncate(fcntl(child.as_raw_fd(), FcntlArg::F_GETFD).unwrap());
        assert!(flags.contains(FdFlag::FD_CLOEXEC));
    }

    #[tokio::test]
    async fn test_piped_directions() {
        let setup = Stdio::Piped.open(Direction::Read).unwrap();
        assert!(matches!(setup.parent, Some(ParentEnd::Sender(_))));
        let setup = Stdio::Piped.open(Direction::Write).unwrap();
        assert!(matches!(setup.parent, Some(ParentEnd::Receiver(_))));
    }

    #[tokio::test]
    async fn test_slot_closes_exactly_once() {
        let slot = PipeSlot::new(7_u8, "test");
        assert!(!slot.is_closed());
        assert!(slot.close().await);
        assert!(!slot.close().await);
        assert!(slot.is_closed());
        assert!(slot.acquire().await.is_none());
    }

    #[tokio::test]
    async fn test_close_now_with_free_lock() {
        let slot = PipeSlot::new(String::from("end"), "test");
        slot.close_now();
        assert!(slot.is_closed());
        assert!(slot.end.lock().await.is_none());
    }
}
