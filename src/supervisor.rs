//! Local agent daemon lifecycle.
//!
//! The supervisor owns at most one `agentd` process: it probes for a daemon
//! already serving the socket, spawns one when none answers, waits for it
//! to come up, and reaps the whole process group on stop. Used by
//! [`AgentSession::auto`](crate::AgentSession::auto) when no explicit
//! endpoint was given.

use crate::client::IpcClient;
use crate::error::{Error, Result};
use crate::process;
use isolate_protocol::transport::{Endpoint, UnixEndpoint};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// How long the supervisor waits for a freshly spawned daemon to answer.
const READY_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll cadence while waiting for daemon readiness.
const READY_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Grace period between SIGTERM and SIGKILL on stop.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Dial timeout for liveness probes; probes must fail fast.
const PROBE_DIAL_TIMEOUT: Duration = Duration::from_secs(1);

/// Where to look for the daemon executable, tried in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonSource {
    /// `agentd` on `$PATH`.
    PathLookup,
    /// `cargo run -p isolate-agent` from a source checkout.
    CargoWorkspace,
    /// `agentd` next to the current executable.
    SiblingBinary,
}

/// Supervisor tunables.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Unix socket the daemon serves on.
    pub socket_path: PathBuf,
    /// Containment root handed to the daemon via `--root`.
    pub root_dir: Option<PathBuf>,
    /// Daemon discovery order.
    pub discovery: Vec<DaemonSource>,
    /// Readiness budget for a fresh spawn.
    pub ready_timeout: Duration,
    /// SIGTERM-to-SIGKILL grace on stop.
    pub stop_grace: Duration,
}

impl SupervisorConfig {
    /// Config with the default discovery order and timing.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            root_dir: None,
            discovery: vec![
                DaemonSource::PathLookup,
                DaemonSource::CargoWorkspace,
                DaemonSource::SiblingBinary,
            ],
            ready_timeout: READY_TIMEOUT,
            stop_grace: STOP_GRACE,
        }
    }

    /// Set the containment root.
    pub fn with_root_dir(mut self, root_dir: impl Into<PathBuf>) -> Self {
        self.root_dir = Some(root_dir.into());
        self
    }

    /// Override the discovery order.
    pub fn with_discovery(mut self, discovery: Vec<DaemonSource>) -> Self {
        self.discovery = discovery;
        self
    }
}

struct SupervisorInner {
    child: Option<Child>,
    running: bool,
}

/// Manages the lifecycle of a local agent daemon.
///
/// `start` is idempotent: a running daemon (ours or an adopted one) is
/// reused, and at most one child process is ever managed.
pub struct AgentSupervisor {
    config: SupervisorConfig,
    inner: Mutex<SupervisorInner>,
}

impl AgentSupervisor {
    /// Create a supervisor from explicit configuration.
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(SupervisorInner {
                child: None,
                running: false,
            }),
        }
    }

    /// Create a supervisor on the default per-user socket.
    pub fn with_defaults(root_dir: Option<PathBuf>) -> Result<Self> {
        let mut config = SupervisorConfig::new(Self::default_socket_path()?);
        config.root_dir = root_dir;
        Ok(Self::new(config))
    }

    /// The default per-user socket path: `~/.container/agent.sock`.
    pub fn default_socket_path() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| Error::unavailable("home directory not resolvable"))?;
        Ok(home.join(".container").join("agent.sock"))
    }

    /// The socket path this supervisor manages.
    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    /// Whether a daemon is currently considered running.
    pub fn is_running(&self) -> bool {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).running
    }

    /// Ensure a daemon is serving the socket, spawning one if needed.
    pub fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        if inner.running {
            let child_alive = inner
                .child
                .as_mut()
                .map_or(true, |child| matches!(child.try_wait(), Ok(None)));
            if child_alive && self.probe() {
                return Ok(());
            }
            inner.running = false;
            inner.child = None;
        }

        // adopt a daemon someone else left running on the socket
        if self.probe() {
            info!(socket = %self.config.socket_path.display(), "reusing running agent daemon");
            inner.running = true;
            return Ok(());
        }

        let _ = std::fs::remove_file(&self.config.socket_path);
        if let Some(parent) = self.config.socket_path.parent() {
            create_socket_dir(parent)
                .map_err(|e| Error::child_spawn("create socket directory", e))?;
        }

        let argv = self.locate_daemon()?;
        debug!(command = ?argv, "launching agent daemon");

        let mut command = Command::new(&argv[0]);
        command.args(&argv[1..]);
        command.arg("--unix").arg(&self.config.socket_path);
        if let Some(root) = &self.config.root_dir {
            command.arg("--root").arg(root);
            if !is_effective_root() {
                // unprivileged daemons cannot chroot; insecure-for-scripts
                // mode beats aborting at startup
                command.arg("--no-chroot");
            }
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own process group so stop reaps build wrappers and the daemon
            // alike.
            // SAFETY: setpgid is async-signal-safe and runs before exec.
            unsafe {
                command.pre_exec(|| {
                    libc::setpgid(0, 0);
                    Ok(())
                });
            }
        }

        let child = command
            .spawn()
            .map_err(|e| Error::child_spawn(format!("spawn agent daemon {:?}", argv[0]), e))?;
        info!(
            pid = child.id(),
            socket = %self.config.socket_path.display(),
            "agent daemon started"
        );
        inner.child = Some(child);

        match self.wait_for_ready(&mut inner) {
            Ok(()) => {
                inner.running = true;
                Ok(())
            }
            Err(e) => {
                if let Some(mut child) = inner.child.take() {
                    process::stop_group(&mut child, Duration::from_millis(500));
                }
                let _ = std::fs::remove_file(&self.config.socket_path);
                Err(e)
            }
        }
    }

    /// Stop the managed daemon, if we spawned one, and remove the socket.
    pub fn stop(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(mut child) = inner.child.take() {
            info!(pid = child.id(), "stopping agent daemon");
            process::stop_group(&mut child, self.config.stop_grace);
            let _ = std::fs::remove_file(&self.config.socket_path);
        }
        inner.running = false;
        Ok(())
    }

    /// A client dialing the supervised socket.
    pub fn client(&self) -> IpcClient {
        IpcClient::unix(&self.config.socket_path)
    }

    fn probe(&self) -> bool {
        if !self.config.socket_path.exists() {
            return false;
        }
        let endpoint = Endpoint::Unix(
            UnixEndpoint::new(&self.config.socket_path).with_dial_timeout(PROBE_DIAL_TIMEOUT),
        );
        IpcClient::new(endpoint).ping(None).is_ok()
    }

    fn wait_for_ready(&self, inner: &mut SupervisorInner) -> Result<()> {
        let deadline = Instant::now() + self.config.ready_timeout;
        while Instant::now() < deadline {
            if let Some(child) = inner.child.as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    return Err(Error::child_spawn(
                        "spawn agent daemon",
                        format!("daemon exited during startup: {}", status),
                    ));
                }
            }
            if self.config.socket_path.exists() && self.probe() {
                debug!("agent daemon answered ping");
                return Ok(());
            }
            std::thread::sleep(READY_POLL_INTERVAL);
        }
        Err(Error::deadline(format!(
            "agent socket not ready after {:?}",
            self.config.ready_timeout
        )))
    }

    fn locate_daemon(&self) -> Result<Vec<String>> {
        for source in &self.config.discovery {
            match source {
                DaemonSource::PathLookup => {
                    if let Some(path) = find_in_path("agentd") {
                        return Ok(vec![path.to_string_lossy().into_owned()]);
                    }
                }
                DaemonSource::CargoWorkspace => {
                    if Path::new("crates/isolate-agent/src/main.rs").exists() {
                        return Ok(vec![
                            "cargo".into(),
                            "run".into(),
                            "--quiet".into(),
                            "-p".into(),
                            "isolate-agent".into(),
                            "--".into(),
                        ]);
                    }
                }
                DaemonSource::SiblingBinary => {
                    if let Ok(exe) = std::env::current_exe() {
                        if let Some(dir) = exe.parent() {
                            let candidate = dir.join("agentd");
                            if candidate.is_file() {
                                return Ok(vec![candidate.to_string_lossy().into_owned()]);
                            }
                        }
                    }
                }
            }
        }
        Err(Error::unavailable(
            "agentd not found on PATH, in the workspace, or next to the current executable",
        ))
    }
}

impl Drop for AgentSupervisor {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(mut child) = inner.child.take() {
            process::stop_group(&mut child, self.config.stop_grace);
            let _ = std::fs::remove_file(&self.config.socket_path);
        }
    }
}

#[cfg(unix)]
fn is_effective_root() -> bool {
    // SAFETY: geteuid is always safe to call.
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn is_effective_root() -> bool {
    false
}

#[cfg(unix)]
fn create_socket_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(dir)
}

#[cfg(not(unix))]
fn create_socket_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)
}

/// Look for an executable on `$PATH`.
fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        if dir.as_os_str().is_empty() {
            continue;
        }
        let candidate = dir.join(name);
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }
    None
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
