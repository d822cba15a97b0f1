//! Run-level errors of the turn loop.
//!
//! Tool failures never appear here; they are returned to the model as
//! `error:` results. An [`AgentError`] ends the run.

use thiserror::Error;

use crate::error::BackendError;

/// Terminal failures of one agent run.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The backend request failed. Never retried by the loop.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("forced tool choice mismatch")]
    ForcedToolChoiceMismatch,

    #[error("minimum tool calls not met")]
    MinToolCallsNotMet,

    #[error("code change required")]
    CodeChangeRequired,

    #[error("analysis-only output after retries exhausted")]
    AnalysisOnlyExhausted,

    #[error("empty response after retries exhausted")]
    EmptyResponseExhausted,

    #[error("max turns reached")]
    MaxTurns,

    #[error("hard turn limit reached")]
    HardTurnLimit,
}

impl AgentError {
    /// Whether the run ended because a retry budget ran out.
    pub fn is_budget_exhausted(&self) -> bool {
        !matches!(self, Self::Backend(_))
    }
}
