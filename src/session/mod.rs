//! Per-session state shared by all tool handlers.
//!
//! A [`SessionState`] owns everything that must survive between tool calls of
//! one agent session: the sandbox guard, the file version cache, the last
//! applied patch hash per file, no-op counters and the mutation log. It is
//! passed by `&mut` into every handler; sharing one state between concurrent
//! runs is not supported.

mod file_cache;
mod mutation_log;

pub use file_cache::{CacheStats, ContentHash, FileVersionCache, DEFAULT_FILE_CACHE_CAPACITY};
pub use mutation_log::{MutationEvent, MutationLog, MutationOp, MUTATION_LOG_CAPACITY};

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::sandbox::SandboxGuard;

/// Tools that keep a per-file no-op counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoopTool {
    Write,
    ApplyPatch,
}

/// Outcome reported through the `finish` tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishStatus {
    Done,
    Blocked,
    Incomplete,
}

impl FinishStatus {
    /// Normalise free-form status text; anything unrecognised counts as done.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim().to_lowercase();
        match raw.as_str() {
            "" | "done" | "complete" | "completed" | "finished" | "success" | "ok" => Self::Done,
            "blocked" | "block" => Self::Blocked,
            "incomplete" | "partial" | "not_done" | "needs_work" => Self::Incomplete,
            _ if ["done", "complete", "finish", "success"]
                .iter()
                .any(|t| raw.contains(t)) =>
            {
                Self::Done
            }
            _ if raw.contains("block") => Self::Blocked,
            _ if ["incomplete", "partial", "todo", "remaining", "not done"]
                .iter()
                .any(|t| raw.contains(t)) =>
            {
                Self::Incomplete
            }
            _ => Self::Done,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Blocked => "blocked",
            Self::Incomplete => "incomplete",
        }
    }
}

/// Signal left by the `finish` tool for the turn loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishSignal {
    pub status: FinishStatus,
    pub summary: String,
}

/// Mutable state for one agent session.
#[derive(Debug, Clone)]
pub struct SessionState {
    sandbox: SandboxGuard,
    /// Last known content per canonical path.
    pub files: FileVersionCache,
    /// Audit trail of file mutations.
    pub mutations: MutationLog,
    patch_hashes: HashMap<PathBuf, ContentHash>,
    noop_counts: HashMap<(PathBuf, NoopTool), u32>,
    finish: Option<FinishSignal>,
}

impl SessionState {
    pub fn new(sandbox: SandboxGuard) -> Self {
        Self {
            sandbox,
            files: FileVersionCache::default(),
            mutations: MutationLog::new(),
            patch_hashes: HashMap::new(),
            noop_counts: HashMap::new(),
            finish: None,
        }
    }

    pub fn sandbox(&self) -> &SandboxGuard {
        &self.sandbox
    }

    /// Replace the sandbox guard. Cached state is kept.
    pub fn set_sandbox(&mut self, sandbox: SandboxGuard) {
        self.sandbox = sandbox;
    }

    /// Clear every cache and counter. The sandbox guard is kept.
    pub fn reset(&mut self) {
        self.files.clear();
        self.mutations.clear();
        self.patch_hashes.clear();
        self.noop_counts.clear();
        self.finish = None;
        tracing::debug!("session state reset");
    }

    /// Record a successful read: refresh the cache and forget patch/no-op history.
    pub fn record_read(&mut self, path: &Path, content: &str) {
        self.files.track(path, content);
        self.patch_hashes.remove(path);
        self.noop_counts.retain(|(p, _), _| p != path);
    }

    pub fn patch_hash(&self, path: &Path) -> Option<&ContentHash> {
        self.patch_hashes.get(path)
    }

    /// Remember the block hash of a content-changing patch.
    pub fn commit_patch_hash(&mut self, path: &Path, hash: ContentHash) {
        self.patch_hashes.insert(path.to_path_buf(), hash);
    }

    pub fn clear_patch_hash(&mut self, path: &Path) {
        self.patch_hashes.remove(path);
    }

    /// Carry the patch hash and cache entry of `from` over to `to`.
    pub fn transfer_path(&mut self, from: &Path, to: &Path) {
        if let Some(hash) = self.patch_hashes.remove(from) {
            self.patch_hashes.insert(to.to_path_buf(), hash);
        }
        self.files.rename(from, to);
        self.noop_counts.retain(|(p, _), _| p != from);
    }

    /// Increment and return the no-op counter for (`path`, `tool`).
    pub fn bump_noop(&mut self, path: &Path, tool: NoopTool) -> u32 {
        let count = self
            .noop_counts
            .entry((path.to_path_buf(), tool))
            .or_insert(0);
        *count += 1;
        *count
    }

    pub fn clear_noop(&mut self, path: &Path, tool: NoopTool) {
        self.noop_counts.remove(&(path.to_path_buf(), tool));
    }

    pub fn noop_count(&self, path: &Path, tool: NoopTool) -> u32 {
        self.noop_counts
            .get(&(path.to_path_buf(), tool))
            .copied()
            .unwrap_or(0)
    }

    pub fn set_finish(&mut self, signal: FinishSignal) {
        self.finish = Some(signal);
    }

    pub fn take_finish(&mut self) -> Option<FinishSignal> {
        self.finish.take()
    }
}
