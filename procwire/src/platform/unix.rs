//! fork/exec spawn path.
//!
//! The child reports a failed setup step or exec by writing its errno to a
//! close-on-exec pipe and exiting with 127. A clean exec closes the pipe, so
//! the parent reads end-of-file and knows the new program is running.

// fork, dup2, credential changes and execve have no safe wrappers that are
// usable between fork and exec.
#![allow(unsafe_code)]

use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::unistd::{fork, pipe2, ForkResult, Pid};

use super::{ChildFailure, ChildStdio, PreparedCommand};

const EXEC_FAILED_EXIT: libc::c_int = 127;

/// Fork and exec `cmd` with `stdio` installed as descriptors 0, 1 and 2.
///
/// Returns the child's pid once exec has succeeded.
pub(crate) fn spawn_child(cmd: &PreparedCommand, stdio: ChildStdio) -> Result<Pid, ChildFailure> {
    let (report_read, report_write) = pipe2(OFlag::O_CLOEXEC)?;
    // Allocate before forking; the child may only touch prepared memory.
    let (argv, envp) = cmd.pointers();

    // SAFETY: the child branch only performs async-signal-safe calls on
    // memory prepared above, then execs or exits.
    match unsafe { fork() }? {
        ForkResult::Child => {
            let errno = unsafe { exec_child(cmd, stdio, &argv, &envp) };
            unsafe { report_and_exit(report_write.as_raw_fd(), errno) }
        }
        ForkResult::Parent { child } => {
            drop(report_write);
            match read_report(report_read) {
                Ok(None) => Ok(child),
                Ok(Some(errno)) => Err(ChildFailure {
                    errno,
                    pid: Some(child),
                    orphaned: false,
                }),
                Err(e) => Err(ChildFailure {
                    errno: crate::error::errno_of(&e),
                    pid: Some(child),
                    orphaned: true,
                }),
            }
        }
    }
}

/// Set up the forked child and exec. Only returns on failure.
///
/// # Safety
///
/// Must only be called in a freshly forked child. `argv` and `envp` must be
/// null-terminated arrays borrowing from `cmd`.
unsafe fn exec_child(
    cmd: &PreparedCommand,
    stdio: ChildStdio,
    argv: &[*const libc::c_char],
    envp: &[*const libc::c_char],
) -> Errno {
    macro_rules! check {
        ($call:expr) => {
            if $call == -1 {
                return Errno::last();
            }
        };
    }

    for (target, fd) in (0..).zip(stdio) {
        let Some(fd) = fd else { continue };
        if fd == target {
            // dup2 onto itself keeps close-on-exec set; clear it directly.
            let flags = libc::fcntl(fd, libc::F_GETFD);
            check!(flags);
            check!(libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC));
        } else {
            check!(libc::dup2(fd, target));
        }
    }

    // Undo signal state inherited from the runtime: Rust ignores SIGPIPE,
    // and ignored dispositions survive exec.
    let mut empty: libc::sigset_t = std::mem::zeroed();
    libc::sigemptyset(&mut empty);
    let rc = libc::pthread_sigmask(libc::SIG_SETMASK, &empty, std::ptr::null_mut());
    if rc != 0 {
        return Errno::from_raw(rc);
    }
    if libc::signal(libc::SIGPIPE, libc::SIG_DFL) == libc::SIG_ERR {
        return Errno::last();
    }

    if cmd.create_session {
        check!(libc::setsid());
    } else if let Some(pgid) = cmd.process_group {
        check!(libc::setpgid(0, pgid));
    }

    // Groups and gid must change while we still have the privilege to.
    if let Some(groups) = &cmd.groups {
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        let count = groups.len() as _;
        check!(libc::setgroups(count, groups.as_ptr()));
    }
    if let Some(gid) = cmd.gid {
        check!(libc::setgid(gid));
    }
    if let Some(uid) = cmd.uid {
        check!(libc::setuid(uid));
    }

    if let Some(cwd) = &cmd.cwd {
        check!(libc::chdir(cwd.as_ptr()));
    }

    if let Some(hook) = &cmd.pre_exec {
        if let Err(e) = hook() {
            return e.raw_os_error().map_or(Errno::EINVAL, Errno::from_raw);
        }
    }

    libc::execve(cmd.program.as_ptr(), argv.as_ptr(), envp.as_ptr());
    Errno::last()
}

/// Write `errno` to the report pipe and exit without running destructors.
///
/// # Safety
///
/// Must only be called in the forked child.
unsafe fn report_and_exit(fd: RawFd, errno: Errno) -> ! {
    let bytes = (errno as i32).to_be_bytes();
    let mut written = 0;
    while written < bytes.len() {
        let n = libc::write(fd, bytes.as_ptr().add(written).cast(), bytes.len() - written);
        if n > 0 {
            #[allow(clippy::cast_sign_loss)]
            let n = n as usize;
            written += n;
        } else if n == -1 && Errno::last() == Errno::EINTR {
            continue;
        } else {
            break;
        }
    }
    libc::_exit(EXEC_FAILED_EXIT)
}

/// Read the child's exec report: `None` on a clean exec, the errno otherwise.
fn read_report(fd: OwnedFd) -> io::Result<Option<Errno>> {
    let mut file = File::from(fd);
    let mut buf = [0_u8; 4];
    let mut filled = 0;
    loop {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => {
                filled += n;
                if filled == buf.len() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    match filled {
        0 => Ok(None),
        4 => Ok(Some(Errno::from_raw(i32::from_be_bytes(buf)))),
        _ => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "truncated exec report from child",
        )),
    }
}
