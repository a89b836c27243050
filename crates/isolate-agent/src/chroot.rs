//! Chroot isolation for child processes.
//!
//! Chroot is a containment aid, not a full sandbox: no seccomp, no
//! namespaces. It rewrites the child's filesystem root to the containment
//! root and drops the effective identity back to the invoking user before
//! exec.

use crate::error::AgentError;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Prepares child processes for chroot jailing with dropped uid/gid.
#[derive(Debug)]
pub struct ChrootExecutor {
    root: PathBuf,
}

/// Rewrite `working_dir` to a path relative to the jail root.
///
/// Falls back to `/` when the directory is unset or not a descendant of the
/// root.
pub fn jail_working_dir(root: &Path, working_dir: &str) -> PathBuf {
    if working_dir.is_empty() {
        return PathBuf::from("/");
    }
    match Path::new(working_dir).strip_prefix(root) {
        Ok(rel) if rel.as_os_str().is_empty() => PathBuf::from("/"),
        Ok(rel) => Path::new("/").join(rel),
        Err(_) => PathBuf::from("/"),
    }
}

#[cfg(unix)]
impl ChrootExecutor {
    /// Create an executor jailing children under `root_dir`.
    ///
    /// The directory must exist; the chroot itself happens per-child in
    /// [`prepare`](Self::prepare).
    pub fn new(root_dir: &Path) -> Result<Self, AgentError> {
        if root_dir.as_os_str().is_empty() {
            return Err(AgentError::chroot("root directory is required"));
        }
        if !root_dir.is_absolute() {
            return Err(AgentError::chroot(format!(
                "root directory must be absolute: {}",
                root_dir.display()
            )));
        }
        if !root_dir.is_dir() {
            return Err(AgentError::chroot(format!(
                "root directory does not exist: {}",
                root_dir.display()
            )));
        }
        Ok(Self {
            root: root_dir.to_path_buf(),
        })
    }

    /// The jail root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether entering the jail needs privileges we do not have.
    ///
    /// chroot(2) requires root (or CAP_SYS_CHROOT); the server fails fast
    /// when chroot was requested but this returns true.
    pub fn requires_root(&self) -> bool {
        // SAFETY: geteuid is always safe to call.
        unsafe { libc::geteuid() != 0 }
    }

    /// Install the jail on a command: chroot, chdir into the rewritten
    /// working directory, then drop uid/gid to the invoking user.
    ///
    /// Everything happens in one `pre_exec` closure so the ordering is
    /// fixed: the identity drop must come after chroot(2), which still
    /// needs privileges.
    pub fn prepare(&self, cmd: &mut Command, working_dir: &str) -> Result<(), AgentError> {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;
        use std::os::unix::process::CommandExt;

        let root = CString::new(self.root.as_os_str().as_bytes())
            .map_err(|_| AgentError::chroot("root path contains a nul byte"))?;
        let jail_cwd = jail_working_dir(&self.root, working_dir);
        let cwd = CString::new(jail_cwd.as_os_str().as_bytes())
            .map_err(|_| AgentError::chroot("working directory contains a nul byte"))?;

        // SAFETY: getuid/getgid are always safe to call.
        let uid = unsafe { libc::getuid() };
        let gid = unsafe { libc::getgid() };

        // SAFETY: the closure runs in the forked child before exec and only
        // calls async-signal-safe libc functions on pre-built CStrings.
        unsafe {
            cmd.pre_exec(move || {
                if libc::chroot(root.as_ptr()) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::chdir(cwd.as_ptr()) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::setgid(gid) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::setuid(uid) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        Ok(())
    }
}

#[cfg(not(unix))]
impl ChrootExecutor {
    /// Chroot is unavailable on this platform.
    pub fn new(_root_dir: &Path) -> Result<Self, AgentError> {
        Err(AgentError::isolation_unavailable(
            "chroot is not supported on this platform",
        ))
    }

    /// The jail root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Always true without a chroot primitive.
    pub fn requires_root(&self) -> bool {
        true
    }

    /// Chroot is unavailable on this platform.
    pub fn prepare(&self, _cmd: &mut Command, _working_dir: &str) -> Result<(), AgentError> {
        Err(AgentError::isolation_unavailable(
            "chroot is not supported on this platform",
        ))
    }
}
