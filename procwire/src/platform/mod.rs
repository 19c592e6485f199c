//! Native spawn primitives.
//!
//! Everything the child needs is converted to C representations here, in the
//! parent, before forking: after `fork` the child may not allocate. The
//! buffers live in a [`PreparedCommand`] and are released when it drops, on
//! success and failure alike.

use std::collections::BTreeMap;
use std::ffi::{CString, OsStr, OsString};
use std::os::fd::RawFd;
use std::os::raw::c_char;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::unistd::Pid;

use crate::config::{Configuration, PreExecHook};

#[cfg(unix)]
mod unix;

#[cfg(unix)]
pub(crate) use unix::spawn_child;

#[cfg(not(unix))]
compile_error!("procwire only supports unix targets");

const FALLBACK_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Descriptors to install as the child's stdin, stdout and stderr.
/// `None` leaves the inherited descriptor in place.
pub(crate) type ChildStdio = [Option<RawFd>; 3];

/// A spawn attempt that failed after or before the fork.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChildFailure {
    pub(crate) errno: Errno,
    /// Set when a child was forked; its status still needs to be discarded.
    pub(crate) pid: Option<Pid>,
    /// Set when the child's fate is unknown and it must be killed.
    pub(crate) orphaned: bool,
}

impl From<Errno> for ChildFailure {
    fn from(errno: Errno) -> Self {
        Self {
            errno,
            pid: None,
            orphaned: false,
        }
    }
}

/// Argument, environment and credential buffers for one spawn attempt.
pub(crate) struct PreparedCommand {
    pub(crate) program: CString,
    pub(crate) argv: Vec<CString>,
    pub(crate) envp: Vec<CString>,
    pub(crate) cwd: Option<CString>,
    pub(crate) uid: Option<libc::uid_t>,
    pub(crate) gid: Option<libc::gid_t>,
    pub(crate) groups: Option<Vec<libc::gid_t>>,
    pub(crate) process_group: Option<libc::pid_t>,
    pub(crate) create_session: bool,
    pub(crate) pre_exec: Option<PreExecHook>,
}

impl PreparedCommand {
    /// Build every native buffer for `config`.
    ///
    /// Fails with `EINVAL` when a string contains an interior NUL.
    pub(crate) fn new(config: &Configuration) -> Result<Self, Errno> {
        let env = build_env(config);
        let program = resolve_program(&config.program, env.get(OsStr::new("PATH")));

        let mut argv = Vec::with_capacity(config.args.len() + 1);
        argv.push(cstring(config.program.as_bytes())?);
        for arg in &config.args {
            argv.push(cstring(arg.as_bytes())?);
        }

        let envp = env
            .iter()
            .map(|(key, value)| {
                let mut pair = Vec::with_capacity(key.len() + value.len() + 1);
                pair.extend_from_slice(key.as_bytes());
                pair.push(b'=');
                pair.extend_from_slice(value.as_bytes());
                cstring(&pair)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let cwd = config
            .working_dir
            .as_deref()
            .map(|dir| cstring(dir.as_os_str().as_bytes()))
            .transpose()?;

        let platform = &config.platform;
        Ok(Self {
            program: cstring(program.as_os_str().as_bytes())?,
            argv,
            envp,
            cwd,
            uid: platform.uid,
            gid: platform.gid,
            groups: platform.groups.clone(),
            process_group: platform.process_group,
            create_session: platform.create_session,
            pre_exec: platform.pre_exec.clone(),
        })
    }

    /// Null-terminated pointer arrays over `argv` and `envp`. They borrow
    /// from `self` and must not outlive it.
    pub(crate) fn pointers(&self) -> (Vec<*const c_char>, Vec<*const c_char>) {
        let terminated = |strings: &[CString]| {
            strings
                .iter()
                .map(|s| s.as_ptr())
                .chain(std::iter::once(std::ptr::null()))
                .collect::<Vec<_>>()
        };
        (terminated(&self.argv), terminated(&self.envp))
    }
}

fn cstring(bytes: &[u8]) -> Result<CString, Errno> {
    CString::new(bytes).map_err(|_| Errno::EINVAL)
}

fn build_env(config: &Configuration) -> BTreeMap<OsString, OsString> {
    let mut env: BTreeMap<OsString, OsString> = if config.env_clear {
        BTreeMap::new()
    } else {
        std::env::vars_os().collect()
    };
    for key in &config.env_remove {
        env.remove(key);
    }
    for (key, value) in &config.env {
        env.insert(key.clone(), value.clone());
    }
    env
}

/// Find `program` on the search path unless it already names a path.
///
/// An unresolvable name is returned unchanged so exec reports `ENOENT`.
fn resolve_program(program: &OsStr, child_path: Option<&OsString>) -> PathBuf {
    if program.as_bytes().contains(&b'/') {
        return PathBuf::from(program);
    }

    let search = child_path
        .cloned()
        .or_else(|| std::env::var_os("PATH"))
        .unwrap_or_else(|| OsString::from(FALLBACK_PATH));

    std::env::split_paths(&search)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
        .unwrap_or_else(|| PathBuf::from(program))
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolves_bare_name_on_path() {
        let resolved = resolve_program(OsStr::new("sh"), Some(&OsString::from("/nonexistent:/bin")));
        assert_eq!(resolved, PathBuf::from("/bin/sh"));
    }

    #[test]
    fn test_keeps_explicit_path() {
        let resolved = resolve_program(OsStr::new("./run.sh"), None);
        assert_eq!(resolved, PathBuf::from("./run.sh"));
    }

    #[test]
    fn test_unresolved_name_passes_through() {
        let resolved = resolve_program(
            OsStr::new("definitely_not_a_command_4821"),
            Some(&OsString::from("/bin")),
        );
        assert_eq!(resolved, PathBuf::from("definitely_not_a_command_4821"));
    }

    #[test]
    fn test_env_merge_order() {
        let config = Configuration::new("env")
            .env_clear()
            .env("A", "1")
            .env("B", "2")
            .env_remove("B");
        let prepared = PreparedCommand::new(&config).unwrap();
        let vars: Vec<_> = prepared.envp.iter().map(|s| s.to_str().unwrap()).collect();
        // Overrides are applied after removals.
        assert_eq!(vars, vec!["A=1", "B=2"]);
    }

    #[test]
    fn test_interior_nul_is_rejected() {
        let config = Configuration::new("echo").arg("bad\0arg");
        assert_eq!(PreparedCommand::new(&config).err(), Some(Errno::EINVAL));
    }

    #[test]
    fn test_pointer_arrays_are_null_terminated() {
        let config = Configuration::new("/bin/echo").arg("hi").env_clear();
        let prepared = PreparedCommand::new(&config).unwrap();
        let (argv, envp) = prepared.pointers();
        assert_eq!(argv.len(), 3);
        assert!(argv[2].is_null());
        assert_eq!(envp.len(), 1);
        assert!(envp[0].is_null());
    }
}
