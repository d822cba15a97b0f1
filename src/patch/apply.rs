//! Applying parsed patches to the filesystem.
//!
//! # Matching
//!
//! Each hunk's `before` lines are located as a contiguous block, first
//! byte-exact and then with whitespace-stripped comparison. A fuzzy match
//! shifts the indentation of the `after` lines by the difference between the
//! file's and the patch's first-line indentation.
//!
//! # Repeat detection
//!
//! Every per-file block is hashed. A block whose hash equals the last one
//! committed for the same resolved path is rejected without touching the
//! file. Hashes are committed per file as soon as that file changes, so a
//! later failure in the same patch does not forget earlier successes.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use super::parser::{parse_patch, FileOperation, Hunk, OperationKind};
use super::PatchError;
use crate::session::{ContentHash, MutationOp, NoopTool, SessionState};

/// Result of a fully applied patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchSummary {
    pub files: Vec<PathBuf>,
    pub additions: usize,
    pub removals: usize,
}

impl fmt::Display for PatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ok: {} file(s) changed, +{} -{}",
            self.files.len(),
            self.additions,
            self.removals
        )
    }
}

/// A failed patch, with the files that were already changed before the failure.
#[derive(Debug)]
pub struct PatchFailure {
    pub error: PatchError,
    pub applied: Vec<PathBuf>,
}

impl From<PatchError> for PatchFailure {
    fn from(error: PatchError) -> Self {
        Self {
            error,
            applied: Vec::new(),
        }
    }
}

impl fmt::Display for PatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;
        if !self.applied.is_empty() {
            let applied: Vec<String> = self
                .applied
                .iter()
                .map(|p| p.display().to_string())
                .collect();
            write!(f, " (already applied: {})", applied.join(", "))?;
        }
        Ok(())
    }
}

/// Parse and apply `text` against the session's sandbox.
pub fn apply_patch(session: &mut SessionState, text: &str) -> Result<PatchSummary, PatchFailure> {
    if text.trim().is_empty() {
        return Err(PatchError::Empty.into());
    }
    let document = parse_patch(text)?;

    // Hash every block against the path it resolves to.
    let hashed: Vec<(PathBuf, ContentHash)> = document
        .operations
        .iter()
        .map(|op| {
            let resolved = session
                .sandbox()
                .validate_path(&op.path, false)
                .unwrap_or_else(|_| session.sandbox().resolve(&op.path));
            (resolved, ContentHash::from_content(&op.block))
        })
        .collect();

    for (path, hash) in &hashed {
        if session.patch_hash(path) == Some(hash) {
            tracing::info!(path = %path.display(), hash = hash.short(), "repeated patch block");
            return Err(PatchError::Repeated { path: path.clone() }.into());
        }
    }

    for op in &document.operations {
        if let OperationKind::Update { .. } = op.kind {
            let path = session
                .sandbox()
                .validate_path(&op.path, true)
                .map_err(PatchError::from)?;
            if !session.files.contains(&path) {
                return Err(PatchError::MustRead {
                    raw: op.path.clone(),
                }
                .into());
            }
        }
    }

    let mut summary = PatchSummary {
        files: Vec::new(),
        additions: 0,
        removals: 0,
    };

    for (op, (_, hash)) in document.operations.iter().zip(hashed) {
        let result = match &op.kind {
            OperationKind::Update { hunks, move_to } => {
                apply_update(session, op, hunks, move_to.as_deref(), hash)
            }
            OperationKind::Add { lines } => apply_add(session, op, lines, hash),
            OperationKind::Delete => apply_delete(session, op, hash),
        };
        match result {
            Ok((path, removals)) => {
                summary.additions += op.additions();
                summary.removals += op.removals() + removals;
                summary.files.push(path);
            }
            Err(error) => {
                return Err(PatchFailure {
                    error,
                    applied: summary.files,
                })
            }
        }
    }

    tracing::info!(
        files = summary.files.len(),
        additions = summary.additions,
        removals = summary.removals,
        "patch applied"
    );
    Ok(summary)
}

/// Returns the final path and any removals not visible in the hunks.
fn apply_update(
    session: &mut SessionState,
    op: &FileOperation,
    hunks: &[Hunk],
    move_to: Option<&str>,
    hash: ContentHash,
) -> Result<(PathBuf, usize), PatchError> {
    let path = session.sandbox().validate_path(&op.path, true)?;
    let target = match move_to {
        Some(raw) => session.sandbox().validate_path(raw, false)?,
        None => path.clone(),
    };

    let original = fs::read_to_string(&path).map_err(|e| PatchError::io(&path, e))?;
    let updated = apply_hunks(&original, hunks, &path)?;

    if updated == original && target == path {
        let count = session.bump_noop(&path, NoopTool::ApplyPatch);
        session
            .mutations
            .record(MutationOp::PatchUpdate, &path, Some(&original), Some(&updated));
        let hint = if count >= 2 {
            " STOP using apply_patch for this file; switch to edit or write.".to_string()
        } else {
            String::new()
        };
        return Err(PatchError::NoOp { path, count, hint });
    }

    write_file(&target, &updated)?;
    let op_kind = if target != path {
        fs::remove_file(&path).map_err(|e| PatchError::io(&path, e))?;
        session.transfer_path(&path, &target);
        MutationOp::PatchMove
    } else {
        MutationOp::PatchUpdate
    };

    session.files.track(&target, updated.as_str());
    session.clear_noop(&target, NoopTool::ApplyPatch);
    session.commit_patch_hash(&target, hash);
    session
        .mutations
        .record(op_kind, &target, Some(&original), Some(&updated));
    Ok((target, 0))
}

fn apply_add(
    session: &mut SessionState,
    op: &FileOperation,
    lines: &[String],
    hash: ContentHash,
) -> Result<(PathBuf, usize), PatchError> {
    let path = session.sandbox().validate_path(&op.path, false)?;
    if path.exists() {
        return Err(PatchError::FileExists { path });
    }

    let mut content = lines.join("\n");
    if !lines.is_empty() {
        content.push('\n');
    }
    write_file(&path, &content)?;

    session.files.track(&path, content.as_str());
    session.commit_patch_hash(&path, hash);
    session
        .mutations
        .record(MutationOp::PatchAdd, &path, None, Some(&content));
    Ok((path, 0))
}

fn apply_delete(
    session: &mut SessionState,
    op: &FileOperation,
    hash: ContentHash,
) -> Result<(PathBuf, usize), PatchError> {
    let path = session.sandbox().validate_path(&op.path, true)?;
    let previous = fs::read_to_string(&path).ok();
    let removed = previous.as_deref().map_or(0, |c| c.lines().count());

    fs::remove_file(&path).map_err(|e| PatchError::io(&path, e))?;

    session.files.remove(&path);
    session.commit_patch_hash(&path, hash);
    session
        .mutations
        .record(MutationOp::PatchDelete, &path, previous.as_deref(), None);
    Ok((path, removed))
}

fn write_file(path: &Path, content: &str) -> Result<(), PatchError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| PatchError::io(parent, e))?;
        }
    }
    fs::write(path, content).map_err(|e| PatchError::io(path, e))
}

/// Apply `hunks` to `content`, preserving line endings and the trailing newline.
pub fn apply_hunks(content: &str, hunks: &[Hunk], path: &Path) -> Result<String, PatchError> {
    let had_trailing_newline = content.ends_with('\n') || content.ends_with('\r');
    let crlf = content.matches("\r\n").count();
    let lf = content.matches('\n').count() - crlf;
    let newline = if crlf > lf { "\r\n" } else { "\n" };

    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();

    for hunk in hunks {
        let (start, fuzzy) = find_context(&lines, &hunk.before, path)?;
        let mut after = hunk.after.clone();
        if fuzzy {
            let delta = indent_of(&lines[start]) as isize - indent_of(&hunk.before[0]) as isize;
            tracing::info!(
                path = %path.display(),
                line = start + 1,
                indent_delta = delta,
                "patch context matched ignoring whitespace"
            );
            if delta != 0 {
                after = adjust_indent(after, delta);
            }
        }
        lines.splice(start..start + hunk.before.len(), after);
    }

    let mut updated = lines.join(newline);
    if had_trailing_newline {
        updated.push_str(newline);
    }
    Ok(updated)
}

/// Locate `needle` in `haystack`; returns the start index and whether the
/// match needed whitespace normalisation.
fn find_context(
    haystack: &[String],
    needle: &[String],
    path: &Path,
) -> Result<(usize, bool), PatchError> {
    if needle.is_empty() {
        return Err(PatchError::NoContext);
    }
    if needle.len() > haystack.len() {
        return Err(PatchError::ContextNotFound {
            path: path.to_path_buf(),
        });
    }

    let exact: Vec<usize> = haystack
        .windows(needle.len())
        .enumerate()
        .filter(|(_, window)| *window == needle)
        .map(|(idx, _)| idx)
        .collect();
    match exact.len() {
        1 => return Ok((exact[0], false)),
        0 => {}
        matches => {
            return Err(PatchError::ContextNotUnique {
                path: path.to_path_buf(),
                matches,
            })
        }
    }

    let normalized: Vec<&str> = needle.iter().map(|l| l.trim()).collect();
    let fuzzy: Vec<usize> = haystack
        .windows(needle.len())
        .enumerate()
        .filter(|(_, window)| window.iter().map(|l| l.trim()).eq(normalized.iter().copied()))
        .map(|(idx, _)| idx)
        .collect();
    match fuzzy.len() {
        1 => Ok((fuzzy[0], true)),
        0 => Err(PatchError::ContextNotFound {
            path: path.to_path_buf(),
        }),
        matches => Err(PatchError::ContextNotUnique {
            path: path.to_path_buf(),
            matches,
        }),
    }
}

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start_matches(' ').len()
}

fn adjust_indent(lines: Vec<String>, delta: isize) -> Vec<String> {
    lines
        .into_iter()
        .map(|line| {
            if delta > 0 {
                format!("{}{}", " ".repeat(delta as usize), line)
            } else {
                let remove = (-delta as usize).min(indent_of(&line));
                line[remove..].to_string()
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxGuard;
    use tempfile::TempDir;

    fn setup() -> (TempDir, SessionState) {
        let dir = TempDir::new().unwrap();
        let guard = SandboxGuard::new(dir.path()).unwrap();
        (dir, SessionState::new(guard))
    }

    fn read_into_session(session: &mut SessionState, path: &Path) {
        let content = fs::read_to_string(path).unwrap();
        let resolved = session.sandbox().resolve(path.to_str().unwrap());
        session.record_read(&resolved, &content);
    }

    fn hunk(before: &[&str], after: &[&str]) -> Hunk {
        Hunk {
            before: before.iter().map(|s| s.to_string()).collect(),
            after: after.iter().map(|s| s.to_string()).collect(),
            added: 0,
            removed: 0,
        }
    }

    #[test]
    fn test_apply_hunks_exact() {
        let out = apply_hunks(
            "a\nb\nc\n",
            &[hunk(&["b"], &["B"])],
            Path::new("f"),
        )
        .unwrap();
        assert_eq!(out, "a\nB\nc\n");
    }

    #[test]
    fn test_apply_hunks_preserves_crlf_and_missing_newline() {
        let out = apply_hunks("a\r\nb\r\nc", &[hunk(&["b"], &["x", "y"])], Path::new("f")).unwrap();
        assert_eq!(out, "a\r\nx\r\ny\r\nc");
    }

    #[test]
    fn test_apply_hunks_not_unique() {
        let err = apply_hunks("x\nx\n", &[hunk(&["x"], &["y"])], Path::new("f")).unwrap_err();
        assert!(matches!(err, PatchError::ContextNotUnique { matches: 2, .. }));
        assert!(err.to_string().contains("patch context not unique"));
    }

    #[test]
    fn test_apply_hunks_not_found() {
        let err = apply_hunks("a\n", &[hunk(&["zzz"], &["y"])], Path::new("f")).unwrap_err();
        assert!(err.to_string().contains("patch context not found"));
    }

    #[test]
    fn test_fuzzy_match_adjusts_indent() {
        let content = "fn main() {\n        let x = 1;\n}\n";
        let out = apply_hunks(
            content,
            &[hunk(&["    let x = 1;"], &["    let x = 2;", "    let y = 3;"])],
            Path::new("f"),
        )
        .unwrap();
        assert_eq!(out, "fn main() {\n        let x = 2;\n        let y = 3;\n}\n");
    }

    #[test]
    fn test_fuzzy_match_negative_delta() {
        let content = "if x:\n  pass\n";
        let out = apply_hunks(content, &[hunk(&["    pass"], &["    return 1"])], Path::new("f"))
            .unwrap();
        assert_eq!(out, "if x:\n  return 1\n");
    }

    #[test]
    fn test_update_requires_read() {
        let (dir, mut session) = setup();
        fs::write(dir.path().join("a.txt"), "one\n").unwrap();
        let patch = "*** Begin Patch\n*** Update File: a.txt\n@@\n-one\n+two\n*** End Patch";

        let failure = apply_patch(&mut session, patch).unwrap_err();
        assert!(matches!(failure.error, PatchError::MustRead { .. }));
        assert_eq!(fs::read_to_string(dir.path().join("a.txt")).unwrap(), "one\n");
    }

    #[test]
    fn test_scenario_update() {
        let (dir, mut session) = setup();
        let file = dir.path().join("a.txt");
        fs::write(&file, "line1\nline2\nline3\n").unwrap();
        read_into_session(&mut session, &file);

        let patch = "*** Begin Patch\n*** Update File: a.txt\n@@\n line1\n-line2\n+line2_modified\n line3\n*** End Patch";
        let summary = apply_patch(&mut session, patch).unwrap();

        assert!(summary.to_string().starts_with("ok: 1 file(s) changed"));
        assert_eq!(summary.to_string(), "ok: 1 file(s) changed, +1 -1");
        assert_eq!(
            fs::read_to_string(&file).unwrap(),
            "line1\nline2_modified\nline3\n"
        );
    }

    #[test]
    fn test_repeated_patch_rejected() {
        let (dir, mut session) = setup();
        let file = dir.path().join("a.txt");
        fs::write(&file, "a\nb\n").unwrap();
        read_into_session(&mut session, &file);

        let patch = "*** Begin Patch\n*** Update File: a.txt\n@@\n a\n+inserted\n b\n*** End Patch";
        apply_patch(&mut session, patch).unwrap();
        let after_first = fs::read_to_string(&file).unwrap();

        let failure = apply_patch(&mut session, patch).unwrap_err();
        assert!(matches!(failure.error, PatchError::Repeated { .. }));
        assert_eq!(fs::read_to_string(&file).unwrap(), after_first);

        // A fresh read clears the recorded hash.
        read_into_session(&mut session, &file);
        let failure = apply_patch(&mut session, patch).unwrap_err();
        assert!(!matches!(failure.error, PatchError::Repeated { .. }));
    }

    #[test]
    fn test_noop_patch_escalates() {
        let (dir, mut session) = setup();
        let file = dir.path().join("a.txt");
        fs::write(&file, "same\n").unwrap();
        read_into_session(&mut session, &file);

        let patch = "*** Begin Patch\n*** Update File: a.txt\n@@\n-same\n+same\n*** End Patch";
        let first = apply_patch(&mut session, patch).unwrap_err();
        assert!(matches!(first.error, PatchError::NoOp { count: 1, .. }));
        assert!(!first.to_string().contains("STOP"));

        let second = apply_patch(&mut session, patch).unwrap_err();
        assert!(matches!(second.error, PatchError::NoOp { count: 2, .. }));
        assert!(second.to_string().contains("STOP using apply_patch"));
    }

    #[test]
    fn test_add_move_delete() {
        let (dir, mut session) = setup();
        let old = dir.path().join("old.txt");
        fs::write(&old, "keep\n").unwrap();
        fs::write(dir.path().join("gone.txt"), "x\ny\n").unwrap();
        read_into_session(&mut session, &old);

        let patch = "*** Begin Patch\n\
*** Add File: nested/new.txt\n\
+hello\n\
+world\n\
*** Update File: old.txt\n\
*** Move to: moved.txt\n\
@@\n\
-keep\n\
+kept\n\
*** Delete File: gone.txt\n\
*** End Patch";
        let summary = apply_patch(&mut session, patch).unwrap();

        assert_eq!(summary.files.len(), 3);
        assert_eq!(summary.additions, 3);
        assert_eq!(summary.removals, 3);
        assert_eq!(
            fs::read_to_string(dir.path().join("nested/new.txt")).unwrap(),
            "hello\nworld\n"
        );
        assert!(!old.exists());
        assert_eq!(fs::read_to_string(dir.path().join("moved.txt")).unwrap(), "kept\n");
        assert!(!dir.path().join("gone.txt").exists());

        let moved = session.sandbox().resolve("moved.txt");
        assert!(session.files.contains(&moved));
        assert!(session.patch_hash(&moved).is_some());
        assert_eq!(session.mutations.len(), 3);
    }

    #[test]
    fn test_half_success_keeps_first_hash() {
        let (dir, mut session) = setup();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        fs::write(&a, "a1\n").unwrap();
        fs::write(&b, "b1\n").unwrap();
        read_into_session(&mut session, &a);
        read_into_session(&mut session, &b);

        let patch = "*** Begin Patch\n\
*** Update File: a.txt\n\
@@\n\
-a1\n\
+a2\n\
*** Update File: b.txt\n\
@@\n\
-missing\n\
+b2\n\
*** End Patch";
        let failure = apply_patch(&mut session, patch).unwrap_err();
        assert!(matches!(failure.error, PatchError::ContextNotFound { .. }));
        assert_eq!(failure.applied.len(), 1);
        assert!(failure.to_string().contains("already applied"));
        assert_eq!(fs::read_to_string(&a).unwrap(), "a2\n");

        let a_resolved = session.sandbox().resolve("a.txt");
        let b_resolved = session.sandbox().resolve("b.txt");
        assert!(session.patch_hash(&a_resolved).is_some());
        assert!(session.patch_hash(&b_resolved).is_none());
    }

    #[test]
    fn test_add_existing_file_fails() {
        let (dir, mut session) = setup();
        fs::write(dir.path().join("a.txt"), "x\n").unwrap();
        let patch = "*** Begin Patch\n*** Add File: a.txt\n+y\n*** End Patch";
        let failure = apply_patch(&mut session, patch).unwrap_err();
        assert!(matches!(failure.error, PatchError::FileExists { .. }));
    }

    #[test]
    fn test_outside_sandbox_rejected() {
        let (_dir, mut session) = setup();
        let patch = "*** Begin Patch\n*** Add File: ../escape.txt\n+y\n*** End Patch";
        let failure = apply_patch(&mut session, patch).unwrap_err();
        assert!(matches!(
            failure.error,
            PatchError::Sandbox(crate::sandbox::SandboxError::AccessDenied { .. })
        ));
    }
}
