//! Bounded retry counters for one run.

use std::collections::HashMap;

use super::feedback::FeedbackReason;

/// Retry state of one agent run. Fresh per run.
#[derive(Debug, Clone, Default)]
pub struct RetryBudget {
    limit: usize,
    format_retries: usize,
    code_change_retries: usize,
    auto_tool_calls: usize,
    feedback_attempts: HashMap<FeedbackReason, u32>,
}

impl RetryBudget {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Consume one format retry. Returns the attempt number, or `None` when
    /// the budget is spent.
    pub fn take_format_retry(&mut self) -> Option<usize> {
        if self.format_retries >= self.limit {
            return None;
        }
        self.format_retries += 1;
        Some(self.format_retries)
    }

    /// Consume one code-change retry.
    pub fn take_code_change_retry(&mut self) -> Option<usize> {
        if self.code_change_retries >= self.limit {
            return None;
        }
        self.code_change_retries += 1;
        Some(self.code_change_retries)
    }

    /// At most one forced tool call is injected per run.
    pub fn take_auto_tool_call(&mut self) -> Option<usize> {
        if self.auto_tool_calls >= 1 {
            return None;
        }
        self.auto_tool_calls += 1;
        Some(self.auto_tool_calls)
    }

    /// Count one more feedback message for `reason`; returns the attempt.
    pub fn record_feedback(&mut self, reason: FeedbackReason) -> u32 {
        let count = self.feedback_attempts.entry(reason).or_insert(0);
        *count += 1;
        *count
    }

    pub fn feedback_attempts(&self, reason: FeedbackReason) -> u32 {
        self.feedback_attempts.get(&reason).copied().unwrap_or(0)
    }

    pub fn format_retries(&self) -> usize {
        self.format_retries
    }

    pub fn code_change_retries(&self) -> usize {
        self.code_change_retries
    }
}
