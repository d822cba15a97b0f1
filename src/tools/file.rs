//! File tools: `read`, `batch_read`, `write` and `edit`.
//!
//! All paths go through the session's sandbox guard. Every successful read
//! or write refreshes the file version cache, which `edit` and
//! `apply_patch` require before they touch a file.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use similar::{ChangeTag, TextDiff};

use super::search::walk_files;
use super::{
    bool_arg, int_arg, required_str, ToolContext, ToolError, ToolErrorKind, ToolOutput,
};
use crate::sandbox::SandboxError;
use crate::session::{MutationOp, NoopTool, SessionState};

/// Maximum number of files per `batch_read` call.
pub const MAX_BATCH_READ: usize = 10;

const NO_CHANGES_SENTINEL: &str = "(no changes since last read)";

/// Read a file with line numbers.
pub fn read(args: &Map<String, Value>, ctx: &mut ToolContext<'_>) -> Result<ToolOutput, ToolError> {
    let raw = required_str(args, "path")?;
    let (path, corrected) = resolve_existing(ctx.session, raw)?;

    let meta = fs::metadata(&path)?;
    if meta.is_dir() {
        return Err(ToolError::new(
            ToolErrorKind::IsADirectory,
            format!("{raw} is a directory (use ls to list it)"),
        ));
    }
    if meta.len() > ctx.limits.max_read_bytes {
        return Err(ToolError::new(
            ToolErrorKind::FileTooLarge,
            format!(
                "file too large ({} bytes, max {})",
                meta.len(),
                ctx.limits.max_read_bytes
            ),
        ));
    }
    let content = String::from_utf8_lossy(&fs::read(&path)?).into_owned();

    let line_start = int_arg(args, "line_start");
    let line_end = int_arg(args, "line_end");
    let offset = int_arg(args, "offset");
    let limit = int_arg(args, "limit");

    let mut body = if bool_arg(args, "diff") {
        if line_start.is_some() || line_end.is_some() || offset.is_some() || limit.is_some() {
            return Err(ToolError::new(
                ToolErrorKind::InvalidValue,
                "diff cannot be combined with line_start, line_end, offset or limit",
            ));
        }
        diff_against_cache(ctx.session, &path, raw, &content)
    } else {
        let (offset, limit) = line_window(line_start, line_end, offset, limit, ctx.limits.read_limit)?;
        render_lines(&content, offset, limit, ctx.limits.max_line_chars)
    };

    ctx.session.record_read(&path, &content);
    tracing::debug!(path = %path.display(), bytes = content.len(), "file read");

    if let Some(actual) = corrected {
        body = format!("(auto-corrected path: {raw} -> {actual})\n{body}");
    }
    Ok(ToolOutput::ok(body))
}

/// Read several files in one call.
pub fn batch_read(
    args: &Map<String, Value>,
    ctx: &mut ToolContext<'_>,
) -> Result<ToolOutput, ToolError> {
    let paths: Vec<&str> = args
        .get("paths")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    if paths.is_empty() {
        return Err(ToolError::new(
            ToolErrorKind::MissingParameter,
            "paths must contain at least one file path",
        ));
    }
    if paths.len() > MAX_BATCH_READ {
        return Err(ToolError::new(
            ToolErrorKind::InvalidValue,
            format!("too many paths ({}, max {MAX_BATCH_READ})", paths.len()),
        ));
    }

    let mut out = String::new();
    for raw in paths {
        let mut single = Map::new();
        single.insert("path".into(), Value::String(raw.to_string()));
        let section = match read(&single, ctx) {
            Ok(output) => output.content,
            Err(e) => e.into_output().content,
        };
        out.push_str(&format!("\n=== FILE: {raw} ===\n{section}\n"));
    }
    Ok(ToolOutput::ok(out))
}

/// Create or overwrite a file.
pub fn write(
    args: &Map<String, Value>,
    ctx: &mut ToolContext<'_>,
) -> Result<ToolOutput, ToolError> {
    let raw = required_str(args, "path")?;
    let content = required_str(args, "content")?;
    let path = ctx.session.sandbox().validate_path(raw, false)?;

    if path.is_dir() {
        return Err(ToolError::new(
            ToolErrorKind::IsADirectory,
            format!("{raw} is a directory"),
        ));
    }
    // Existing bytes need not be UTF-8; the file is overwritten either way.
    let existing = if path.exists() {
        Some(fs::read(&path)?)
    } else {
        None
    };

    if existing.as_deref() == Some(content.as_bytes()) {
        let session = &mut *ctx.session;
        let count = session.bump_noop(&path, NoopTool::Write);
        session.files.track(&path, content);
        session
            .mutations
            .record(MutationOp::Write, &path, Some(content), Some(content));
        tracing::info!(path = %path.display(), count, "write made no changes");
        return match count {
            1 => Ok(ToolOutput::noop(format!(
                "ok: no changes (file already has identical content) for {raw}. If the file is already correct you may stop."
            ))),
            2 => Err(ToolError::new(
                ToolErrorKind::WriteNoop,
                format!(
                    "write made no changes for {raw} (file already has identical content). You have written identical content multiple times. Read the file and write DIFFERENT content.\nACTION: read the file, then write content that actually differs, or stop if the file is already correct."
                ),
            )),
            _ => Err(ToolError::new(
                ToolErrorKind::WriteRepeatedNoop,
                format!(
                    "repeated no-op write for {raw} ({count} identical writes). The file already has this content. Do not write it again: make a different change, or call finish if the task is done."
                ),
            )),
        };
    }

    if let Some(parent) = path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(&path, content)?;

    let session = &mut *ctx.session;
    session.clear_noop(&path, NoopTool::Write);
    session.clear_patch_hash(&path);
    session.files.track(&path, content);
    let previous = existing.map(|bytes| String::from_utf8(bytes).ok());
    session.mutations.record(
        MutationOp::Write,
        &path,
        previous.as_ref().and_then(|text| text.as_deref()),
        Some(content),
    );

    let message = match &previous {
        None => format!("ok: created {raw}, +{} lines", content.lines().count()),
        Some(Some(before)) => {
            let (added, removed) = line_delta(before, content);
            format!("ok: updated {raw}, +{added} -{removed} lines")
        }
        Some(None) => format!(
            "ok: overwrote {raw} (previous content was not UTF-8 text), +{} lines",
            content.lines().count()
        ),
    };
    tracing::info!(path = %path.display(), bytes = content.len(), "file written");
    Ok(ToolOutput::changed(message))
}

/// Replace an exact substring in a previously read file.
pub fn edit(
    args: &Map<String, Value>,
    ctx: &mut ToolContext<'_>,
) -> Result<ToolOutput, ToolError> {
    let raw = required_str(args, "path")?;
    let old = required_str(args, "old")?;
    let new = required_str(args, "new")?;
    let replace_all = bool_arg(args, "all");

    if old == new {
        return Err(ToolError::new(
            ToolErrorKind::OldEqualsNew,
            "no changes (old_string equals new_string)",
        ));
    }
    if old.is_empty() {
        return Err(ToolError::new(
            ToolErrorKind::InvalidValue,
            "old_string must not be empty",
        ));
    }

    let path = ctx.session.sandbox().validate_path(raw, true)?;
    if !ctx.session.files.contains(&path) {
        return Err(ToolError::new(
            ToolErrorKind::MustReadFirst,
            format!("must read {raw} before editing (use read tool first)"),
        ));
    }

    let Ok(content) = String::from_utf8(fs::read(&path)?) else {
        return Err(ToolError::new(
            ToolErrorKind::Io,
            format!("{raw} is not valid UTF-8 text and cannot be edited (use write to replace it)"),
        ));
    };
    let count = content.matches(old).count();
    if count == 0 {
        return Err(ToolError::new(
            ToolErrorKind::OldNotFound,
            "old_string not found in file. Make sure it matches exactly, including whitespace",
        ));
    }
    if count > 1 && !replace_all {
        return Err(ToolError::new(
            ToolErrorKind::OldNotUnique,
            format!("old_string appears {count} times, must be unique (use all=true to replace all)"),
        ));
    }

    let (updated, replaced) = if replace_all {
        (content.replace(old, new), count)
    } else {
        (content.replacen(old, new, 1), 1)
    };
    fs::write(&path, &updated)?;

    let session = &mut *ctx.session;
    session.clear_patch_hash(&path);
    session.files.track(&path, updated.as_str());
    session
        .mutations
        .record(MutationOp::Edit, &path, Some(&content), Some(&updated));
    tracing::info!(path = %path.display(), replaced, "file edited");

    Ok(ToolOutput::changed(format!("ok: {replaced} replacement(s)")))
}

/// Validate an existing path, falling back to a unique same-named file
/// inside the sandbox when the given one does not exist.
fn resolve_existing(
    session: &SessionState,
    raw: &str,
) -> Result<(PathBuf, Option<String>), ToolError> {
    let sandbox = session.sandbox();
    match sandbox.validate_path(raw, true) {
        Ok(path) => Ok((path, None)),
        Err(err @ SandboxError::NotFound { .. }) => {
            let Some(root) = sandbox.root() else {
                return Err(err.into());
            };
            let Some(name) = Path::new(raw).file_name() else {
                return Err(err.into());
            };
            let mut candidates = walk_files(root).filter(|e| e.file_name() == name);
            match (candidates.next(), candidates.next()) {
                (Some(only), None) => {
                    let path = only.into_path();
                    let shown = path
                        .strip_prefix(root)
                        .unwrap_or(&path)
                        .display()
                        .to_string();
                    tracing::info!(requested = raw, resolved = %shown, "auto-corrected read path");
                    Ok((path, Some(shown)))
                }
                _ => Err(err.into()),
            }
        }
        Err(err) => Err(err.into()),
    }
}

/// Translate the range arguments into a zero-based (offset, limit) window.
fn line_window(
    line_start: Option<i64>,
    line_end: Option<i64>,
    offset: Option<i64>,
    limit: Option<i64>,
    default_limit: usize,
) -> Result<(usize, usize), ToolError> {
    let invalid = |msg: &str| ToolError::new(ToolErrorKind::InvalidValue, msg);

    if line_start.is_some() || line_end.is_some() {
        let start = line_start.unwrap_or(1);
        if start < 1 {
            return Err(invalid("line_start must be >= 1"));
        }
        return match line_end {
            Some(end) if end < start => Err(invalid("line_end must be >= line_start")),
            Some(end) => Ok(((start - 1) as usize, (end - start + 1) as usize)),
            None => Ok(((start - 1) as usize, usize::MAX)),
        };
    }

    let offset = offset.unwrap_or(0);
    if offset < 0 {
        return Err(invalid("offset must be >= 0"));
    }
    let limit = match limit {
        Some(l) if l < 1 => return Err(invalid("limit must be >= 1")),
        Some(l) => l as usize,
        None => default_limit,
    };
    Ok((offset as usize, limit))
}

fn render_lines(content: &str, offset: usize, limit: usize, max_chars: usize) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let total = lines.len();
    if total == 0 {
        return "(empty file)".to_string();
    }
    if offset >= total {
        return format!(
            "File already fully read ({total} lines). No more content. Proceed with your implementation."
        );
    }

    let end = offset.saturating_add(limit).min(total);
    let mut out: Vec<String> = lines[offset..end]
        .iter()
        .enumerate()
        .map(|(i, line)| format!("{:4}| {}", offset + i + 1, clip_line(line, max_chars)))
        .collect();
    if end < total {
        out.push(format!(
            "(... {} more lines, use offset={end} to continue)",
            total - end
        ));
    }
    out.join("\n")
}

fn clip_line(line: &str, max_chars: usize) -> String {
    match line.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &line[..cut]),
        None => line.to_string(),
    }
}

fn diff_against_cache(session: &SessionState, path: &Path, raw: &str, content: &str) -> String {
    match session.files.peek(path) {
        Some(previous) if previous != content => TextDiff::from_lines(previous, content)
            .unified_diff()
            .context_radius(3)
            .header(&format!("a/{raw}"), &format!("b/{raw}"))
            .to_string(),
        _ => NO_CHANGES_SENTINEL.to_string(),
    }
}

/// Count added and removed lines between two versions.
fn line_delta(before: &str, after: &str) -> (usize, usize) {
    let diff = TextDiff::from_lines(before, after);
    diff.iter_all_changes()
        .fold((0, 0), |(added, removed), change| match change.tag() {
            ChangeTag::Insert => (added + 1, removed),
            ChangeTag::Delete => (added, removed + 1),
            ChangeTag::Equal => (added, removed),
        })
}
