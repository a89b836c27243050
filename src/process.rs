//! Process-group management for the supervised agent daemon.
//!
//! The supervisor places the daemon in its own process group so stopping it
//! reaps the whole subtree, including anything a build-from-source launcher
//! spawned underneath itself.

use std::process::Child;
use std::time::{Duration, Instant};

/// Poll interval while waiting for a signalled process to exit.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Check if a process is alive.
#[cfg(unix)]
pub(crate) fn is_alive(pid: i32) -> bool {
    // SAFETY: kill with signal 0 only performs the existence check.
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Send SIGTERM to a process group. Returns false if the group is gone.
#[cfg(unix)]
pub(crate) fn terminate_group(pid: i32) -> bool {
    // SAFETY: kill(2) with a negative pid signals the whole group.
    unsafe { libc::kill(-pid, libc::SIGTERM) == 0 }
}

/// Send SIGKILL to a process group.
#[cfg(unix)]
pub(crate) fn kill_group(pid: i32) {
    // SAFETY: kill(2) with a negative pid signals the whole group.
    unsafe {
        libc::kill(-pid, libc::SIGKILL);
    }
}

/// Gracefully stop a child that leads its own process group.
///
/// SIGTERM to the group, wait up to `grace`, then SIGKILL and reap.
#[cfg(unix)]
pub(crate) fn stop_group(child: &mut Child, grace: Duration) {
    let pid = child.id() as i32;

    if !is_alive(pid) {
        let _ = child.try_wait();
        return;
    }

    if !terminate_group(pid) {
        // group already gone; reap the zombie if there is one
        let _ = child.try_wait();
        return;
    }

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        match child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) => std::thread::sleep(STOP_POLL_INTERVAL),
            Err(_) => return,
        }
    }

    tracing::debug!(pid, "stop grace period expired, sending SIGKILL");
    kill_group(pid);
    let _ = child.wait();
}

/// Without process groups, fall back to killing the child alone.
#[cfg(not(unix))]
pub(crate) fn stop_group(child: &mut Child, _grace: Duration) {
    let _ = child.kill();
    let _ = child.wait();
}
