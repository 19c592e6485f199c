//! Immutable description of what to run and how.
//!
//! A [`Configuration`] is assembled with a consuming builder and handed to
//! [`crate::spawn`] by reference; nothing in it changes after that point.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;

/// Default number of bytes requested per output read.
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Default grace period given to SIGTERM before escalating.
pub const DEFAULT_TERM_GRACE: Duration = Duration::from_secs(5);

/// Hook run in the child after fork and before exec.
pub type PreExecHook = Arc<dyn Fn() -> io::Result<()> + Send + Sync>;

/// One step of a teardown sequence: send `signal`, then wait up to `grace`
/// for the process to terminate before moving on.
///
/// A grace of [`Duration::MAX`] waits indefinitely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeardownStep {
    /// Signal to deliver.
    pub signal: Signal,
    /// How long to wait for termination after delivering it.
    pub grace: Duration,
}

impl TeardownStep {
    /// Create a step.
    pub const fn new(signal: Signal, grace: Duration) -> Self {
        Self { signal, grace }
    }

    /// The unconditional kill that ends every sequence.
    pub const fn kill() -> Self {
        Self::new(Signal::SIGKILL, Duration::MAX)
    }

    /// `steps` in their given order, followed by the implicit kill unless
    /// they already end with it.
    pub fn sequence(steps: &[Self]) -> Vec<Self> {
        let mut sequence = steps.to_vec();
        if sequence.last() != Some(&Self::kill()) {
            sequence.push(Self::kill());
        }
        sequence
    }
}

/// Credential and session options applied between fork and exec.
#[derive(Clone, Default)]
pub struct PlatformOptions {
    /// User id to switch to.
    pub uid: Option<u32>,
    /// Group id to switch to.
    pub gid: Option<u32>,
    /// Supplementary groups to install.
    pub groups: Option<Vec<u32>>,
    /// Process group to join (0 creates a new group led by the child).
    /// Ignored when `create_session` is set, since a session leader already
    /// leads its own group.
    pub process_group: Option<i32>,
    /// Start the child in a new session.
    pub create_session: bool,
    /// Ordered teardown steps. SIGKILL always follows implicitly.
    pub teardown: Vec<TeardownStep>,
    pub(crate) pre_exec: Option<PreExecHook>,
}

impl fmt::Debug for PlatformOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlatformOptions")
            .field("uid", &self.uid)
            .field("gid", &self.gid)
            .field("groups", &self.groups)
            .field("process_group", &self.process_group)
            .field("create_session", &self.create_session)
            .field("teardown", &self.teardown)
            .field("pre_exec", &self.pre_exec.as_ref().map(|_| "<hook>"))
            .finish()
    }
}

impl PlatformOptions {
    /// The configured steps followed by the implicit kill.
    pub fn teardown_sequence(&self) -> Vec<TeardownStep> {
        TeardownStep::sequence(&self.teardown)
    }

    /// Whether a pre-exec hook is installed.
    pub const fn has_pre_exec(&self) -> bool {
        self.pre_exec.is_some()
    }
}

/// What to run and how to run it.
#[derive(Debug, Clone)]
pub struct Configuration {
    /// The program to execute. Looked up on `PATH` unless it contains `/`.
    pub program: OsString,

    /// Arguments passed after the program name.
    pub args: Vec<OsString>,

    /// Environment variables to set (merged with the parent environment).
    pub env: HashMap<OsString, OsString>,

    /// Environment variables to remove.
    pub env_remove: Vec<OsString>,

    /// Whether to start from an empty environment.
    pub env_clear: bool,

    /// Working directory for the child.
    pub working_dir: Option<PathBuf>,

    /// Credential, session and teardown options.
    pub platform: PlatformOptions,

    /// Upper bound on the whole run when driven through [`crate::run`].
    pub timeout: Option<Duration>,

    /// Maximum bytes per output buffer.
    pub chunk_size: usize,
}

impl Configuration {
    /// Create a configuration for the given program.
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            env_remove: Vec::new(),
            env_clear: false,
            working_dir: None,
            platform: PlatformOptions {
                teardown: vec![TeardownStep::new(Signal::SIGTERM, DEFAULT_TERM_GRACE)],
                ..PlatformOptions::default()
            },
            timeout: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Add an argument.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable.
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set multiple environment variables.
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<OsString>,
        V: Into<OsString>,
    {
        for (k, v) in vars {
            self.env.insert(k.into(), v.into());
        }
        self
    }

    /// Remove an environment variable.
    pub fn env_remove(mut self, key: impl Into<OsString>) -> Self {
        self.env_remove.push(key.into());
        self
    }

    /// Clear the environment before setting variables.
    pub fn env_clear(mut self) -> Self {
        self.env_clear = true;
        self
    }

    /// Set the working directory.
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Run the child as this user id.
    pub fn uid(mut self, uid: u32) -> Self {
        self.platform.uid = Some(uid);
        self
    }

    /// Run the child with this group id.
    pub fn gid(mut self, gid: u32) -> Self {
        self.platform.gid = Some(gid);
        self
    }

    /// Replace the child's supplementary groups.
    pub fn groups(mut self, groups: impl Into<Vec<u32>>) -> Self {
        self.platform.groups = Some(groups.into());
        self
    }

    /// Move the child into process group `pgid` (0 for a fresh group).
    pub fn process_group(mut self, pgid: i32) -> Self {
        self.platform.process_group = Some(pgid);
        self
    }

    /// Start the child in a new session.
    pub fn create_session(mut self) -> Self {
        self.platform.create_session = true;
        self
    }

    /// Replace the teardown sequence. SIGKILL is always appended implicitly.
    pub fn teardown(mut self, steps: impl Into<Vec<TeardownStep>>) -> Self {
        self.platform.teardown = steps.into();
        self
    }

    /// Bound the total run time used by [`crate::run`].
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Set the maximum size of each output buffer.
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    /// Install a hook that runs in the child after fork and before exec.
    ///
    /// # Safety
    ///
    /// The hook runs in a freshly forked copy of a possibly multi-threaded
    /// process. It must only perform async-signal-safe operations: no
    /// allocation, no locks, no logging.
    #[allow(unsafe_code)]
    pub unsafe fn pre_exec<F>(mut self, hook: F) -> Self
    where
        F: Fn() -> io::Result<()> + Send + Sync + 'static,
    {
        self.platform.pre_exec = Some(Arc::new(hook));
        self
    }

    /// Program name as a lossy string, for messages.
    pub fn program_display(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_collects_fields() {
        let config = Configuration::new("/bin/echo")
            .arg("a")
            .args(["b", "c"])
            .env("K", "V")
            .env_remove("HOME")
            .working_dir("/tmp")
            .uid(1000)
            .gid(1000)
            .groups(vec![1, 2])
            .process_group(0)
            .chunk_size(0);

        assert_eq!(config.args, vec!["a", "b", "c"]);
        assert_eq!(config.env.get(&OsString::from("K")), Some(&OsString::from("V")));
        assert_eq!(config.env_remove, vec![OsString::from("HOME")]);
        assert_eq!(config.working_dir, Some(PathBuf::from("/tmp")));
        assert_eq!(config.platform.uid, Some(1000));
        assert_eq!(config.platform.groups, Some(vec![1, 2]));
        assert_eq!(config.platform.process_group, Some(0));
        assert_eq!(config.chunk_size, 1);
        assert!(!config.platform.has_pre_exec());
    }

    #[test]
    fn test_default_teardown_ends_in_kill() {
        let config = Configuration::new("sleep");
        let steps = config.platform.teardown_sequence();
        assert_eq!(
            steps,
            vec![
                TeardownStep::new(Signal::SIGTERM, DEFAULT_TERM_GRACE),
                TeardownStep::kill(),
            ]
        );
    }

    #[test]
    fn test_empty_teardown_still_kills() {
        let config = Configuration::new("sleep").teardown(Vec::new());
        assert_eq!(config.platform.teardown_sequence(), vec![TeardownStep::kill()]);
    }

    #[test]
    fn test_sequence_keeps_configured_order() {
        let usr1 = TeardownStep::new(Signal::SIGUSR1, Duration::from_secs(1));
        let term = TeardownStep::new(Signal::SIGTERM, Duration::from_secs(2));

        // An early kill stays where it was put; the tail still gets one.
        assert_eq!(
            TeardownStep::sequence(&[TeardownStep::kill(), usr1]),
            vec![TeardownStep::kill(), usr1, TeardownStep::kill()]
        );
        // A sequence already ending in the kill is left alone.
        assert_eq!(
            TeardownStep::sequence(&[term, TeardownStep::kill()]),
            vec![term, TeardownStep::kill()]
        );
    }

    #[test]
    #[allow(unsafe_code)]
    fn test_pre_exec_is_hidden_in_debug() {
        // SAFETY: the hook does nothing.
        let config = unsafe { Configuration::new("true").pre_exec(|| Ok(())) };
        assert!(config.platform.has_pre_exec());
        assert!(format!("{config:?}").contains("<hook>"));
    }
}
