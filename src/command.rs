//! The command/result object model.
//!
//! A [`Command`] describes one guest execution; an [`ExecResult`] is what
//! comes back. These are plain value objects layered over the IPC client;
//! no protocol behavior lives here.

use std::collections::BTreeMap;
use std::io::Read;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A single guest execution request.
///
/// Built with chained setters:
///
/// ```no_run
/// use isolate::Command;
/// use std::time::Duration;
///
/// let cmd = Command::new("/bin/ls")
///     .arg("-la")
///     .working_dir("/tmp")
///     .env("LANG", "C")
///     .timeout(Duration::from_secs(5));
/// ```
pub struct Command {
    pub(crate) path: String,
    pub(crate) args: Vec<String>,
    pub(crate) env: BTreeMap<String, String>,
    pub(crate) working_dir: String,
    pub(crate) user: String,
    pub(crate) timeout: Option<Duration>,
    pub(crate) stdin: Option<Box<dyn Read + Send>>,
}

impl Command {
    /// Create a command for the given executable path.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: String::new(),
            user: String::new(),
            timeout: None,
            stdin: None,
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set one environment variable for the child.
    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    /// Set several environment variables for the child.
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in vars {
            self.env.insert(k.into(), v.into());
        }
        self
    }

    /// Set the working directory (absolute, or relative to the agent's
    /// containment root).
    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = dir.into();
        self
    }

    /// Set the advisory user identity (carried, not enforced).
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Set the execution deadline.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Supply the child's stdin. The reader is pumped to the agent on a
    /// detached thread; without one, the child's stdin is closed at start.
    pub fn stdin(mut self, reader: impl Read + Send + 'static) -> Self {
        self.stdin = Some(Box::new(reader));
        self
    }

    /// The executable path.
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("path", &self.path)
            .field("args", &self.args)
            .field("env", &self.env)
            .field("working_dir", &self.working_dir)
            .field("user", &self.user)
            .field("timeout", &self.timeout)
            .field("stdin", &self.stdin.is_some())
            .finish()
    }
}

/// The captured outcome of a guest execution.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// Child exit code; `128 + signal` for signal deaths, `-1` when an
    /// error was surfaced as a result.
    pub exit_code: i32,
    /// Buffered stdout, truncated at the agent's `max_result_buffer`.
    pub stdout: Vec<u8>,
    /// Buffered stderr, truncated at the agent's `max_result_buffer`.
    pub stderr: Vec<u8>,
    /// Wall-clock duration of the child.
    pub duration: Duration,
    /// When the child started.
    pub started_at: SystemTime,
    /// When the child finished.
    pub finished_at: SystemTime,
}

impl ExecResult {
    /// True when the child exited with code 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout as text, with invalid UTF-8 replaced.
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Stderr as text, with invalid UTF-8 replaced.
    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub(crate) fn from_wire(
        exit_code: i32,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
        duration_ms: u64,
        started_at_ms: u64,
        finished_at_ms: u64,
    ) -> Self {
        Self {
            exit_code,
            stdout,
            stderr,
            duration: Duration::from_millis(duration_ms),
            started_at: UNIX_EPOCH + Duration::from_millis(started_at_ms),
            finished_at: UNIX_EPOCH + Duration::from_millis(finished_at_ms),
        }
    }

    /// A result standing in for a failed exchange: exit code -1 with the
    /// failure message on stderr.
    pub(crate) fn from_error_message(message: &str) -> Self {
        Self {
            exit_code: isolate_protocol::EXEC_ERROR_EXIT_CODE,
            stdout: Vec::new(),
            stderr: message.as_bytes().to_vec(),
            duration: Duration::ZERO,
            started_at: SystemTime::now(),
            finished_at: SystemTime::now(),
        }
    }
}
