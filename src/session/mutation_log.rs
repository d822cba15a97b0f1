//! Audit trail of file mutations, bounded to the most recent events.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ContentHash;

/// Number of events kept per session.
pub const MUTATION_LOG_CAPACITY: usize = 12;

/// Kind of file mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationOp {
    Write,
    Edit,
    PatchUpdate,
    PatchAdd,
    PatchDelete,
    PatchMove,
}

impl MutationOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Write => "write",
            Self::Edit => "edit",
            Self::PatchUpdate => "patch_update",
            Self::PatchAdd => "patch_add",
            Self::PatchDelete => "patch_delete",
            Self::PatchMove => "patch_move",
        }
    }
}

/// One recorded mutation attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationEvent {
    pub id: Uuid,
    pub op: MutationOp,
    pub path: PathBuf,
    /// Whether file content actually changed.
    pub changed: bool,
    pub before_hash: Option<ContentHash>,
    pub after_hash: Option<ContentHash>,
    /// Consecutive no-op attempts on this path, including this one.
    pub noop_streak: u32,
    /// Consecutive content-changing attempts on this path, including this one.
    pub change_streak: u32,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Streaks {
    noop: u32,
    change: u32,
}

/// Ring buffer of the last [`MUTATION_LOG_CAPACITY`] mutation events.
#[derive(Debug, Clone, Default)]
pub struct MutationLog {
    events: VecDeque<MutationEvent>,
    streaks: HashMap<PathBuf, Streaks>,
}

impl MutationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a mutation of `path` from `before` to `after` content.
    pub fn record(
        &mut self,
        op: MutationOp,
        path: &Path,
        before: Option<&str>,
        after: Option<&str>,
    ) -> &MutationEvent {
        let before_hash = before.map(ContentHash::from_content);
        let after_hash = after.map(ContentHash::from_content);
        let changed = before_hash != after_hash;

        let streaks = self.streaks.entry(path.to_path_buf()).or_default();
        if changed {
            streaks.change += 1;
            streaks.noop = 0;
        } else {
            streaks.noop += 1;
            streaks.change = 0;
        }
        let streaks = *streaks;

        if self.events.len() >= MUTATION_LOG_CAPACITY {
            if let Some(evicted) = self.events.pop_front() {
                self.forget_if_unseen(&evicted.path, path);
            }
        }
        self.events.push_back(MutationEvent {
            id: Uuid::new_v4(),
            op,
            path: path.to_path_buf(),
            changed,
            before_hash,
            after_hash,
            noop_streak: streaks.noop,
            change_streak: streaks.change,
            recorded_at: Utc::now(),
        });
        tracing::debug!(
            op = op.as_str(),
            path = %path.display(),
            changed,
            noop_streak = streaks.noop,
            "recorded mutation"
        );
        &self.events[self.events.len() - 1]
    }

    /// Events from oldest to newest.
    pub fn events(&self) -> impl Iterator<Item = &MutationEvent> {
        self.events.iter()
    }

    pub fn last(&self) -> Option<&MutationEvent> {
        self.events.back()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Drop the streak of a path that no longer has events in the ring.
    fn forget_if_unseen(&mut self, evicted: &Path, current: &Path) {
        if evicted != current && !self.events.iter().any(|e| e.path == evicted) {
            self.streaks.remove(evicted);
        }
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.streaks.clear();
    }
}
