//! Search tools: `glob`, `grep`, `search` and `ls`.
//!
//! Directory walks skip VCS and dependency directories and are bounded both
//! in results and in how much they scan.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use glob::{MatchOptions, Pattern};
use regex::Regex;
use serde_json::{Map, Value};
use walkdir::{DirEntry, WalkDir};

use super::{bool_arg, int_arg, required_str, str_arg, ToolContext, ToolError, ToolErrorKind, ToolOutput};
use crate::sandbox::SandboxError;
use crate::session::SessionState;

/// Directories never descended into.
pub const IGNORED_DIRS: &[&str] = &[".git", "node_modules", "__pycache__", ".venv"];

/// Files larger than this are not searched.
const MAX_SEARCH_FILE_BYTES: u64 = 2 * 1024 * 1024;
/// Stop scanning after this many files.
const MAX_SCANNED_FILES: usize = 2000;
/// Stop scanning after this many bytes.
const MAX_SCANNED_BYTES: u64 = 50 * 1024 * 1024;
/// Above this many glob hits, skip the mtime sort.
const MTIME_SORT_LIMIT: usize = 200;

const GLOB_TRUNCATED: &str = "\n\n(results are truncated; refine path or pattern)";
const SEARCH_TRUNCATED: &str = "\n\n(results are truncated; refine path or include pattern)";

/// All regular files under `root`, skipping [`IGNORED_DIRS`].
pub fn walk_files(root: &Path) -> impl Iterator<Item = DirEntry> {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            !(e.file_type().is_dir()
                && e.depth() > 0
                && IGNORED_DIRS.iter().any(|d| e.file_name() == *d))
        })
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
}

/// Find files by glob pattern.
pub fn glob(args: &Map<String, Value>, ctx: &mut ToolContext<'_>) -> Result<ToolOutput, ToolError> {
    let pat = required_str(args, "pat")?;
    let raw_dir = str_arg(args, "path").unwrap_or(".");
    let dir = existing_dir(ctx.session, raw_dir, "path does not exist")?;

    let pattern = Pattern::new(pat).map_err(|e| {
        ToolError::new(ToolErrorKind::InvalidValue, format!("invalid glob pattern: {e}"))
    })?;
    let options = MatchOptions {
        require_literal_separator: true,
        ..MatchOptions::new()
    };
    let match_full_path = pat.contains('/');

    let mut hits: Vec<(PathBuf, SystemTime)> = walk_files(&dir)
        .filter(|e| {
            if match_full_path {
                e.path()
                    .strip_prefix(&dir)
                    .is_ok_and(|rel| pattern.matches_path_with(rel, options))
            } else {
                e.file_name()
                    .to_str()
                    .is_some_and(|name| pattern.matches_with(name, options))
            }
        })
        .map(|e| {
            let mtime = e
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (e.into_path(), mtime)
        })
        .collect();

    if hits.is_empty() {
        return Ok(ToolOutput::ok("no files found"));
    }
    if hits.len() <= MTIME_SORT_LIMIT {
        hits.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    } else {
        hits.sort_by(|a, b| a.0.cmp(&b.0));
    }

    let max = ctx.limits.max_results;
    let truncated = hits.len() > max;
    let workdir = ctx.session.sandbox().workdir();
    let shown: Vec<String> = hits
        .iter()
        .take(max)
        .map(|(p, _)| display_path(p, workdir))
        .collect();
    tracing::debug!(pattern = pat, hits = hits.len(), "glob finished");

    let mut text = shown.join("\n");
    if truncated {
        text.push_str(GLOB_TRUNCATED);
    }
    Ok(ToolOutput::ok(text))
}

/// Search file contents (`pat`, capped at the configured result limit).
pub fn grep(args: &Map<String, Value>, ctx: &mut ToolContext<'_>) -> Result<ToolOutput, ToolError> {
    let pat = required_str(args, "pat")?;
    let max = ctx.limits.max_results;
    content_search(args, ctx, pat, max)
}

/// Search file contents (`pattern`, with a caller-chosen result cap).
pub fn search(
    args: &Map<String, Value>,
    ctx: &mut ToolContext<'_>,
) -> Result<ToolOutput, ToolError> {
    let pattern = required_str(args, "pattern")?;
    let limit = ctx.limits.max_results;
    let max = int_arg(args, "max_results")
        .map(|n| (n.max(1) as usize).min(limit))
        .unwrap_or(limit);
    content_search(args, ctx, pattern, max)
}

/// List a directory.
pub fn ls(args: &Map<String, Value>, ctx: &mut ToolContext<'_>) -> Result<ToolOutput, ToolError> {
    let raw = str_arg(args, "path").unwrap_or(".");
    let dir = existing_dir(ctx.session, raw, "directory not found")?;

    let mut entries: Vec<String> = fs::read_dir(&dir)?
        .filter_map(Result::ok)
        .map(|e| {
            let name = e.file_name().to_string_lossy().into_owned();
            if e.file_type().is_ok_and(|t| t.is_dir()) {
                format!("{name}/")
            } else {
                name
            }
        })
        .collect();
    if entries.is_empty() {
        return Ok(ToolOutput::ok("(empty directory)"));
    }
    entries.sort();
    Ok(ToolOutput::ok(entries.join("\n")))
}

fn content_search(
    args: &Map<String, Value>,
    ctx: &mut ToolContext<'_>,
    pattern: &str,
    max: usize,
) -> Result<ToolOutput, ToolError> {
    let raw_path = str_arg(args, "path").unwrap_or(".");
    let root = match ctx.session.sandbox().validate_path(raw_path, true) {
        Ok(p) => p,
        Err(SandboxError::NotFound { .. }) => {
            return Err(ToolError::new(
                ToolErrorKind::PathNotFound,
                format!("path does not exist: {raw_path}"),
            ))
        }
        Err(e) => return Err(e.into()),
    };

    let source = if bool_arg(args, "literal_text") {
        regex::escape(pattern)
    } else {
        pattern.to_string()
    };
    let re = Regex::new(&source)
        .map_err(|e| ToolError::new(ToolErrorKind::InvalidRegex, format!("invalid regex: {e}")))?;
    let include = match str_arg(args, "include") {
        Some(glob) => Some(Pattern::new(glob).map_err(|e| {
            ToolError::new(ToolErrorKind::InvalidValue, format!("invalid include pattern: {e}"))
        })?),
        None => None,
    };

    let files: Box<dyn Iterator<Item = PathBuf>> = if root.is_file() {
        Box::new(std::iter::once(root.clone()))
    } else {
        Box::new(walk_files(&root).map(DirEntry::into_path))
    };

    let workdir = ctx.session.sandbox().workdir().to_path_buf();
    let mut hits = Vec::new();
    let mut scanned_files = 0usize;
    let mut scanned_bytes = 0u64;
    let mut truncated = false;

    'files: for path in files {
        if let Some(include) = &include {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            if !include.matches(name) {
                continue;
            }
        }
        let Ok(meta) = fs::metadata(&path) else {
            continue;
        };
        if meta.len() > MAX_SEARCH_FILE_BYTES {
            continue;
        }
        if scanned_files >= MAX_SCANNED_FILES || scanned_bytes >= MAX_SCANNED_BYTES {
            truncated = true;
            break;
        }
        scanned_files += 1;
        scanned_bytes += meta.len();

        let Ok(bytes) = fs::read(&path) else {
            continue;
        };
        if bytes.iter().take(8192).any(|&b| b == 0) {
            continue;
        }
        let text = String::from_utf8_lossy(&bytes);
        let shown = display_path(&path, &workdir);
        for (idx, line) in text.lines().enumerate() {
            if re.is_match(line) {
                if hits.len() >= max {
                    truncated = true;
                    break 'files;
                }
                hits.push(format!("{shown}:{}:{line}", idx + 1));
            }
        }
    }

    tracing::debug!(
        pattern,
        hits = hits.len(),
        scanned_files,
        truncated,
        "content search finished"
    );
    if hits.is_empty() {
        return Ok(ToolOutput::ok("no matches found"));
    }
    let mut text = hits.join("\n");
    if truncated {
        text.push_str(SEARCH_TRUNCATED);
    }
    Ok(ToolOutput::ok(text))
}

fn existing_dir(session: &SessionState, raw: &str, missing: &str) -> Result<PathBuf, ToolError> {
    let dir = match session.sandbox().validate_path(raw, true) {
        Ok(p) => p,
        Err(SandboxError::NotFound { .. }) => {
            return Err(ToolError::new(
                ToolErrorKind::PathNotFound,
                format!("{missing}: {raw}"),
            ))
        }
        Err(e) => return Err(e.into()),
    };
    if !dir.is_dir() {
        return Err(ToolError::new(
            ToolErrorKind::InvalidValue,
            format!("not a directory: {raw}"),
        ));
    }
    Ok(dir)
}

fn display_path(path: &Path, base: &Path) -> String {
    path.strip_prefix(base)
        .unwrap_or(path)
        .display()
        .to_string()
}
