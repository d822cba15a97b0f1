//! Sandbox guard for filesystem and shell access.
//!
//! Every path a tool touches goes through [`SandboxGuard::validate_path`], and
//! every shell command goes through [`SandboxGuard::validate_shell_command`].
//! This is a policy layer in front of normal process execution, not OS-level
//! containment.

pub mod policy;

pub use policy::{split_env_assignments, CommandPolicy};

use std::io;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

use crate::tools::ToolErrorKind;

/// Errors raised when a path or command is rejected by the sandbox.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SandboxError {
    #[error("path is required")]
    EmptyPath,

    #[error("Access denied: path '{path}' (resolved: {resolved}) is outside sandbox root {root}")]
    AccessDenied {
        path: String,
        resolved: String,
        root: String,
    },

    #[error("File not found: {path} (resolved: {resolved})")]
    NotFound { path: String, resolved: String },

    #[error("command blocked by sandbox policy (matched dangerous pattern: {pattern})")]
    DangerousCommand { pattern: String },

    #[error("shell chaining operators (;, &&, ||, backticks, $(), newlines, ../) are not allowed in sandbox; run one command per call")]
    ChainingOperator,

    #[error("'cd' is not allowed in sandbox; use the workdir parameter instead")]
    ChangeDirectory,

    #[error("command is empty")]
    EmptyCommand,

    #[error("command contains only variable assignments, no actual command")]
    AssignmentsOnly,

    #[error("command paths ('{0}') are not allowed in sandbox; use the bare command name instead (e.g. 'ls' not '/bin/ls')")]
    QualifiedCommandPath(String),

    #[error("command '{0}' is not in the sandbox allowlist; allowed: python, python3, node, ls, cat, grep, rg, git, npm, make, echo, etc.")]
    NotAllowlisted(String),

    #[error("inline code execution (e.g. -c / -e flags) is not allowed; write a script file and run it instead")]
    InlineCode,

    #[error("pipe operator (|) is not allowed; run commands separately instead")]
    PipeOperator,

    #[error("failed to parse command (unbalanced quotes?)")]
    Unparseable,
}

impl SandboxError {
    pub fn kind(&self) -> ToolErrorKind {
        match self {
            Self::EmptyPath => ToolErrorKind::MissingParameter,
            Self::AccessDenied { .. } => ToolErrorKind::AccessDenied,
            Self::NotFound { .. } => ToolErrorKind::PathNotFound,
            _ => ToolErrorKind::CommandRejected,
        }
    }
}

/// Path and command guard bound to an optional sandbox root.
///
/// When no root is configured, paths are only resolved (no containment) and
/// only the dangerous-pattern and token-level checks apply to commands.
#[derive(Debug, Clone)]
pub struct SandboxGuard {
    root: Option<PathBuf>,
    workdir: PathBuf,
    policy: CommandPolicy,
}

impl SandboxGuard {
    /// Create a guard confined to `root`. Relative paths resolve against the root.
    pub fn new(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = std::fs::canonicalize(root.as_ref())?;
        Ok(Self {
            workdir: root.clone(),
            root: Some(root),
            policy: CommandPolicy::default(),
        })
    }

    /// Create a guard with sandboxing disabled. Relative paths resolve against `workdir`.
    pub fn unrestricted(workdir: impl AsRef<Path>) -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        let workdir = resolve_real_path(&absolutize(workdir.as_ref(), &cwd));
        Self {
            root: None,
            workdir,
            policy: CommandPolicy::default(),
        }
    }

    /// Replace the command policy.
    pub fn with_policy(mut self, policy: CommandPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Change the directory relative paths are resolved against.
    pub fn with_workdir(mut self, workdir: impl AsRef<Path>) -> Self {
        self.workdir = resolve_real_path(&absolutize(workdir.as_ref(), &self.workdir));
        self
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn is_sandboxed(&self) -> bool {
        self.root.is_some()
    }

    pub fn policy(&self) -> &CommandPolicy {
        &self.policy
    }

    /// Resolve `path` to an absolute, symlink-resolved path and check containment.
    ///
    /// The root itself and any descendant are allowed. With `must_exist`,
    /// a missing target fails with [`SandboxError::NotFound`].
    pub fn validate_path(&self, path: &str, must_exist: bool) -> Result<PathBuf, SandboxError> {
        if path.trim().is_empty() {
            return Err(SandboxError::EmptyPath);
        }
        let resolved = self.resolve(path);

        if let Some(root) = &self.root {
            if !is_within(&resolved, root) {
                tracing::warn!(path, resolved = %resolved.display(), "sandbox denied path");
                return Err(SandboxError::AccessDenied {
                    path: path.to_string(),
                    resolved: resolved.display().to_string(),
                    root: root.display().to_string(),
                });
            }
        }

        if must_exist && !resolved.exists() {
            return Err(SandboxError::NotFound {
                path: path.to_string(),
                resolved: resolved.display().to_string(),
            });
        }
        Ok(resolved)
    }

    /// Resolve a path without the containment check.
    pub fn resolve(&self, path: &str) -> PathBuf {
        let expanded = expand_home(path.trim());
        resolve_real_path(&absolutize(&expanded, &self.workdir))
    }

    /// Whether `path` (already resolved) lies inside the sandbox.
    pub fn contains(&self, path: &Path) -> bool {
        match &self.root {
            Some(root) => is_within(path, root),
            None => true,
        }
    }

    /// Run the ordered command checks. First match wins.
    pub fn validate_shell_command(&self, command: &str) -> Result<(), SandboxError> {
        self.policy.check(command, self.is_sandboxed())
    }
}

fn is_within(path: &Path, root: &Path) -> bool {
    path == root || path.starts_with(root)
}

fn expand_home(path: &str) -> PathBuf {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            let rest = path.trim_start_matches('~').trim_start_matches('/');
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Resolve symlinks for the existing prefix of `path` and normalise `.`/`..`
/// for the rest, mirroring `realpath` on paths that may not exist yet.
fn resolve_real_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => {
                out.push(part);
                if let Ok(real) = std::fs::canonicalize(&out) {
                    out = real;
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn guard() -> (TempDir, SandboxGuard) {
        let dir = TempDir::new().unwrap();
        let guard = SandboxGuard::new(dir.path()).unwrap();
        (dir, guard)
    }

    #[test]
    fn test_root_and_descendants_allowed() {
        let (dir, guard) = guard();
        std::fs::write(dir.path().join("a.txt"), "x").unwrap();

        let root = guard.validate_path(".", true).unwrap();
        assert_eq!(root, guard.root().unwrap());
        assert!(guard.validate_path("a.txt", true).is_ok());
        assert!(guard.validate_path("new/dir/file.txt", false).is_ok());
    }

    #[test]
    fn test_outside_root_denied() {
        let (_dir, guard) = guard();
        let err = guard.validate_path("../escape.txt", false).unwrap_err();
        assert!(matches!(err, SandboxError::AccessDenied { .. }));
        assert!(matches!(
            guard.validate_path("/etc/passwd", false),
            Err(SandboxError::AccessDenied { .. })
        ));
    }

    #[test]
    fn test_sibling_prefix_is_not_descendant() {
        let parent = TempDir::new().unwrap();
        let root = parent.path().join("proj");
        let sibling = parent.path().join("proj-other");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::create_dir_all(&sibling).unwrap();
        let guard = SandboxGuard::new(&root).unwrap();

        let target = sibling.join("f.txt");
        assert!(guard
            .validate_path(target.to_str().unwrap(), false)
            .is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_denied() {
        let (dir, guard) = guard();
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret.txt"), "s").unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();

        let err = guard.validate_path("link/secret.txt", true).unwrap_err();
        assert!(matches!(err, SandboxError::AccessDenied { .. }));
    }

    #[test]
    fn test_must_exist() {
        let (_dir, guard) = guard();
        let err = guard.validate_path("missing.txt", true).unwrap_err();
        assert!(matches!(err, SandboxError::NotFound { .. }));
        assert!(err.to_string().starts_with("File not found"));
    }

    #[test]
    fn test_empty_path_rejected() {
        let (_dir, guard) = guard();
        assert_eq!(guard.validate_path("  ", false), Err(SandboxError::EmptyPath));
    }

    #[test]
    fn test_unrestricted_allows_anything() {
        let dir = TempDir::new().unwrap();
        let guard = SandboxGuard::unrestricted(dir.path());
        assert!(!guard.is_sandboxed());
        assert!(guard.validate_path("/tmp", false).is_ok());
    }
}
