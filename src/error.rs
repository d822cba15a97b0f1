//! Crate-level error types.
//!
//! Subsystem errors live next to their code (`SandboxError`, `PatchError`,
//! `ToolError`, `AgentError`). This module holds the errors shared across
//! subsystem boundaries:
//! - Model backend interactions
//! - Configuration and tool definition loading

use thiserror::Error;

/// Errors returned by a model backend.
///
/// A backend error is fatal to the current agent run; the turn loop does not
/// retry it.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("rate limited: retry after {retry_after_secs:?} seconds")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("context length exceeded: {0}")]
    ContextLengthExceeded(String),

    #[error("failed to parse backend response: {0}")]
    InvalidResponse(String),

    #[error("backend timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("alias '{alias}' for tool '{tool}' conflicts with tool '{existing}'")]
    AliasConflict {
        alias: String,
        tool: String,
        existing: String,
    },

    #[error("tool '{tool}' has no handler named '{handler}'")]
    UnknownHandler { tool: String, handler: String },

    #[error("duplicate tool definition: {0}")]
    DuplicateTool(String),

    #[error("invalid environment variable {name}: {reason}")]
    InvalidEnv { name: String, reason: String },

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
