//! Request validation against the containment root.
//!
//! When the server runs with a `root_dir` but without chroot, this module is
//! the only containment layer: it rejects requests whose working directory,
//! executable, or path-like arguments resolve outside the root, and it
//! enforces the shell policy (no `-c`, script files only).
//!
//! This is a lexical check. Symlinks are not resolved and script contents
//! are not inspected, so it is not TOCTOU-safe; chroot is the stronger
//! mechanism when available.

use crate::error::AgentError;
use isolate_protocol::ExecRequest;
use std::path::{Component, Path, PathBuf};

/// Shells barred from inline command execution under containment.
const SHELLS: &[&str] = &[
    "sh",
    "bash",
    "zsh",
    "ksh",
    "fish",
    "cmd",
    "cmd.exe",
    "powershell",
    "powershell.exe",
    "pwsh",
    "pwsh.exe",
];

/// Argument suffixes accepted as shell script files.
const SCRIPT_SUFFIXES: &[&str] = &[".sh", ".bash", ".ps1", ".bat", ".cmd"];

/// Script interpreters refused without chroot unless explicitly allowed.
/// `python` matches by prefix (python2, python3, python3.12, ...).
const INTERPRETERS: &[&str] = &[
    "node",
    "nodejs",
    "ruby",
    "irb",
    "php",
    "perl",
    "lua",
    "java",
    "javac",
    "go",
    "gofmt",
    "bash",
    "sh",
    "zsh",
    "fish",
    "ksh",
    "cmd.exe",
    "powershell.exe",
    "pwsh.exe",
];

/// Lexically normalize a path: drop `.`, resolve `..` against preceding
/// components, never touch the filesystem (symlinks are not followed).
pub fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::Prefix(p) => out.push(p.as_os_str()),
            Component::RootDir => out.push(comp.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                // at the root: `/..` stays `/`
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                // relative path climbing above its start keeps the `..`
                _ => out.push(".."),
            },
            Component::Normal(c) => out.push(c),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Whether `path`'s base name is one of the barred shells.
pub fn is_shell(path: &str) -> bool {
    let base = base_name(path);
    SHELLS.contains(&base)
}

/// Whether `path`'s base name is a script interpreter.
pub fn is_interpreter(path: &str) -> bool {
    let base = base_name(path);
    base.starts_with("python") || INTERPRETERS.contains(&base)
}

/// Validate an exec request against the containment root.
///
/// On success, returns the effective working directory: the request's when
/// set, otherwise the root itself.
pub fn validate_request(root: &Path, req: &ExecRequest) -> Result<PathBuf, AgentError> {
    let root = clean_path(root);

    if is_shell(&req.path) {
        let mut has_script = false;
        for arg in &req.args {
            if arg == "-c" {
                return Err(AgentError::security(
                    "shell commands with -c are not allowed when root containment is enabled",
                ));
            }
            if !arg.starts_with('-') && has_script_suffix(arg) {
                has_script = true;
            }
        }
        if !has_script {
            return Err(AgentError::security(
                "shell invocations without a script file are not allowed when root containment is enabled",
            ));
        }
    }

    let working_dir = if req.working_dir.is_empty() {
        root.clone()
    } else {
        let resolved = resolve_against(&root, Path::new(&req.working_dir));
        if !resolved.starts_with(&root) {
            return Err(AgentError::security(format!(
                "working directory {:?} is outside root {} (resolves to {})",
                req.working_dir,
                root.display(),
                resolved.display()
            )));
        }
        resolved
    };

    let exe = Path::new(&req.path);
    if exe.is_relative() && has_separator(&req.path) {
        let resolved = clean_path(&working_dir.join(exe));
        if !resolved.starts_with(&root) {
            return Err(AgentError::security(format!(
                "command path {:?} escapes root {} (resolves to {})",
                req.path,
                root.display(),
                resolved.display()
            )));
        }
    }

    for (i, arg) in req.args.iter().enumerate() {
        if has_separator(arg) && !arg.starts_with('-') {
            let resolved = resolve_against(&working_dir, Path::new(arg));
            if !resolved.starts_with(&root) {
                return Err(AgentError::security(format!(
                    "argument {} path {:?} escapes root {} (resolves to {})",
                    i,
                    arg,
                    root.display(),
                    resolved.display()
                )));
            }
        }
    }

    Ok(working_dir)
}

/// Resolve absolute paths in place, relative paths against `base`, then
/// lexically normalize.
fn resolve_against(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        clean_path(path)
    } else {
        clean_path(&base.join(path))
    }
}

fn has_separator(s: &str) -> bool {
    s.contains('/') || s.contains('\\')
}

fn has_script_suffix(arg: &str) -> bool {
    SCRIPT_SUFFIXES.iter().any(|suffix| arg.ends_with(suffix))
}

fn base_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(path: &str, args: &[&str], working_dir: &str) -> ExecRequest {
        ExecRequest {
            path: path.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            working_dir: working_dir.into(),
            ..Default::default()
        }
    }

    const ROOT: &str = "/tmp/jail";

    // -------------------------------------------------------------------------
    // clean_path
    // -------------------------------------------------------------------------

    #[test]
    fn test_clean_absolute() {
        assert_eq!(clean_path(Path::new("/a/b/../c")), PathBuf::from("/a/c"));
        assert_eq!(clean_path(Path::new("/a/./b//c")), PathBuf::from("/a/b/c"));
        assert_eq!(clean_path(Path::new("/../a")), PathBuf::from("/a"));
        assert_eq!(clean_path(Path::new("/")), PathBuf::from("/"));
    }

    #[test]
    fn test_clean_relative() {
        assert_eq!(clean_path(Path::new("a/b/..")), PathBuf::from("a"));
        assert_eq!(clean_path(Path::new("../a")), PathBuf::from("../a"));
        assert_eq!(clean_path(Path::new("a/..")), PathBuf::from("."));
        assert_eq!(clean_path(Path::new("../../x")), PathBuf::from("../../x"));
    }

    // -------------------------------------------------------------------------
    // shell / interpreter matching
    // -------------------------------------------------------------------------

    #[test]
    fn test_shell_detection() {
        assert!(is_shell("/bin/sh"));
        assert!(is_shell("bash"));
        assert!(is_shell("/usr/bin/zsh"));
        assert!(is_shell("powershell.exe"));
        assert!(!is_shell("/bin/cat"));
        assert!(!is_shell("shred"));
    }

    #[test]
    fn test_interpreter_detection() {
        assert!(is_interpreter("/usr/bin/python3"));
        assert!(is_interpreter("python3.12"));
        assert!(is_interpreter("node"));
        assert!(is_interpreter("/usr/bin/perl"));
        assert!(is_interpreter("sh"));
        assert!(!is_interpreter("cat"));
        assert!(!is_interpreter("nodeenv-helper"));
    }

    // -------------------------------------------------------------------------
    // shell policy
    // -------------------------------------------------------------------------

    #[test]
    fn test_shell_dash_c_rejected() {
        let err = validate_request(Path::new(ROOT), &req("/bin/sh", &["-c", "id"], ROOT))
            .unwrap_err();
        assert!(err.to_string().contains("-c"));
    }

    #[test]
    fn test_shell_without_script_rejected() {
        let err =
            validate_request(Path::new(ROOT), &req("/bin/bash", &["-x"], ROOT)).unwrap_err();
        assert!(err.to_string().contains("script"));
    }

    #[test]
    fn test_shell_with_script_accepted() {
        let result = validate_request(Path::new(ROOT), &req("/bin/sh", &["run.sh"], ROOT));
        assert!(result.is_ok());
    }

    #[test]
    fn test_shell_flag_script_suffix_does_not_count() {
        // a flag ending in .sh must not satisfy the script requirement
        let err = validate_request(Path::new(ROOT), &req("/bin/sh", &["--profile.sh"], ROOT))
            .unwrap_err();
        assert!(err.to_string().contains("script"));
    }

    // -------------------------------------------------------------------------
    // working directory
    // -------------------------------------------------------------------------

    #[test]
    fn test_empty_working_dir_defaults_to_root() {
        let dir = validate_request(Path::new(ROOT), &req("/bin/cat", &[], "")).unwrap();
        assert_eq!(dir, PathBuf::from(ROOT));
    }

    #[test]
    fn test_working_dir_inside_root_accepted() {
        let dir =
            validate_request(Path::new(ROOT), &req("/bin/cat", &[], "/tmp/jail/sub")).unwrap();
        assert_eq!(dir, PathBuf::from("/tmp/jail/sub"));
    }

    #[test]
    fn test_working_dir_outside_root_rejected() {
        let err = validate_request(Path::new(ROOT), &req("/bin/cat", &[], "/etc")).unwrap_err();
        assert!(err.to_string().contains("working directory"));
    }

    #[test]
    fn test_working_dir_escape_via_dotdot_rejected() {
        let err = validate_request(Path::new(ROOT), &req("/bin/cat", &[], "/tmp/jail/../x"))
            .unwrap_err();
        assert!(err.to_string().contains("working directory"));
    }

    #[test]
    fn test_relative_working_dir_resolved_against_root() {
        let dir = validate_request(Path::new(ROOT), &req("/bin/cat", &[], "sub/dir")).unwrap();
        assert_eq!(dir, PathBuf::from("/tmp/jail/sub/dir"));
    }

    // -------------------------------------------------------------------------
    // executable path
    // -------------------------------------------------------------------------

    #[test]
    fn test_absolute_executable_not_contained() {
        // absolute executables outside the root are allowed (the agent's own
        // binaries live there); containment applies to their path arguments
        assert!(validate_request(Path::new(ROOT), &req("/bin/cat", &[], ROOT)).is_ok());
    }

    #[test]
    fn test_relative_executable_with_separator_contained() {
        assert!(validate_request(Path::new(ROOT), &req("bin/tool", &[], ROOT)).is_ok());
    }

    #[test]
    fn test_relative_executable_escaping_rejected() {
        let err =
            validate_request(Path::new(ROOT), &req("../tool", &[], ROOT)).unwrap_err();
        assert!(err.to_string().contains("command path"));
    }

    #[test]
    fn test_bare_executable_name_allowed() {
        // no separator: resolved via PATH, not a containment concern
        assert!(validate_request(Path::new(ROOT), &req("cat", &[], ROOT)).is_ok());
    }

    // -------------------------------------------------------------------------
    // argument paths
    // -------------------------------------------------------------------------

    #[test]
    fn test_argument_escape_via_dotdot_rejected() {
        let err = validate_request(
            Path::new(ROOT),
            &req("/bin/cat", &["../etc/passwd"], ROOT),
        )
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("argument 0"), "message was: {}", msg);
        assert!(msg.contains("/tmp/etc/passwd"), "message was: {}", msg);
    }

    #[test]
    fn test_absolute_argument_outside_root_rejected() {
        let err = validate_request(Path::new(ROOT), &req("/bin/cat", &["/etc/passwd"], ROOT))
            .unwrap_err();
        assert!(err.to_string().contains("argument 0"));
    }

    #[test]
    fn test_argument_inside_root_accepted() {
        assert!(validate_request(
            Path::new(ROOT),
            &req("/bin/cat", &["sub/file.txt", "/tmp/jail/other.txt"], ROOT),
        )
        .is_ok());
    }

    #[test]
    fn test_bare_argument_not_checked() {
        // no separator: plain token, not a path
        assert!(validate_request(Path::new(ROOT), &req("/bin/cat", &["file.txt"], ROOT)).is_ok());
    }

    #[test]
    fn test_flag_argument_not_checked() {
        assert!(validate_request(
            Path::new(ROOT),
            &req("/bin/grep", &["--file=/etc/x", "pattern"], ROOT),
        )
        .is_ok());
    }

    #[test]
    fn test_offending_index_reported() {
        let err = validate_request(
            Path::new(ROOT),
            &req("/bin/cat", &["ok.txt", "also/ok.txt", "/etc/shadow"], ROOT),
        )
        .unwrap_err();
        assert!(err.to_string().contains("argument 2"));
    }

    #[test]
    fn test_sibling_prefix_does_not_count_as_contained() {
        let err = validate_request(
            Path::new(ROOT),
            &req("/bin/cat", &["/tmp/jailbreak/file"], ROOT),
        )
        .unwrap_err();
        assert!(err.to_string().contains("argument 0"));
    }
}
