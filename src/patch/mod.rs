//! Multi-file patch engine.
//!
//! Parses the `*** Begin Patch` grammar ([`parser`]) and applies it against
//! the filesystem ([`apply`]) with fuzzy context matching, line-ending
//! preservation and per-file repeat detection.

pub mod apply;
pub mod parser;

pub use apply::{apply_hunks, apply_patch, PatchFailure, PatchSummary};
pub use parser::{parse_patch, FileOperation, Hunk, OperationKind, PatchDocument};

use std::path::PathBuf;

use thiserror::Error;

use crate::sandbox::SandboxError;
use crate::tools::ToolErrorKind;

/// Errors raised while parsing or applying a patch.
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("invalid patch format (missing Begin Patch)")]
    MissingBegin,

    #[error("invalid patch format (missing End Patch)")]
    MissingEnd,

    #[error("no file operations found in patch")]
    NoOperations,

    #[error("no changes found in patch for {path}")]
    EmptyUpdate { path: String },

    #[error("unexpected patch line: {0}")]
    UnexpectedLine(String),

    #[error("invalid add line: {0}")]
    InvalidAddLine(String),

    #[error("patch hunk has no context lines; include at least one ' ' or '-' line for context")]
    NoContext,

    #[error("patch context not found in {path}")]
    ContextNotFound { path: PathBuf },

    #[error("patch context not unique in {path} ({matches} matches)")]
    ContextNotUnique { path: PathBuf, matches: usize },

    #[error("must read {raw} before patching (use read tool first)")]
    MustRead { raw: String },

    #[error("repeated patch detected for {path}; do not repeat the same patch. Re-read the file and use a different patch with correct context, or switch to edit/write.")]
    Repeated { path: PathBuf },

    #[error("patch produced no changes for {path} (no-op). The file content is identical before and after.{hint}\nACTION: read the file, then create a patch that actually modifies content, or use edit/write.")]
    NoOp { path: PathBuf, count: u32, hint: String },

    #[error("file already exists: {path}")]
    FileExists { path: PathBuf },

    #[error("patch is required")]
    Empty,

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PatchError {
    /// Typed failure category used by the feedback rules.
    pub fn kind(&self) -> ToolErrorKind {
        match self {
            Self::MissingBegin | Self::MissingEnd | Self::NoOperations | Self::EmptyUpdate { .. } => {
                ToolErrorKind::InvalidPatchFormat
            }
            Self::NoContext => ToolErrorKind::InvalidPatchFormat,
            Self::UnexpectedLine(_) => ToolErrorKind::UnexpectedPatchLine,
            Self::InvalidAddLine(_) => ToolErrorKind::InvalidAddLine,
            Self::ContextNotFound { .. } => ToolErrorKind::ContextNotFound,
            Self::ContextNotUnique { .. } => ToolErrorKind::ContextNotUnique,
            Self::MustRead { .. } => ToolErrorKind::MustReadFirst,
            Self::Repeated { .. } => ToolErrorKind::RepeatedPatch,
            Self::NoOp { .. } => ToolErrorKind::PatchNoop,
            Self::FileExists { .. } => ToolErrorKind::FileExists,
            Self::Empty => ToolErrorKind::MissingParameter,
            Self::Sandbox(e) => e.kind(),
            Self::Io { .. } => ToolErrorKind::Io,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
