//! Per-run counters, returned with every [`RunOutcome`](super::RunOutcome).

use std::collections::BTreeMap;

use serde::Serialize;

use crate::llm::Usage;

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunMetrics {
    pub tool_calls_total: usize,
    pub tool_errors_total: usize,
    pub tool_call_counts: BTreeMap<String, usize>,
    pub tool_error_counts: BTreeMap<String, usize>,
    pub feedback_counts: BTreeMap<String, u32>,
    pub format_retries: usize,
    pub analysis_retries: usize,
    pub trimmed_messages: usize,
    pub usage: Usage,
    #[serde(skip)]
    patch_failures: BTreeMap<String, u32>,
}

impl RunMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_call(&mut self, tool: &str, is_error: bool) {
        self.tool_calls_total += 1;
        *self.tool_call_counts.entry(tool.to_string()).or_insert(0) += 1;
        if is_error {
            self.tool_errors_total += 1;
            *self.tool_error_counts.entry(tool.to_string()).or_insert(0) += 1;
        }
    }

    pub fn record_feedback(&mut self, reason: &str, attempt: u32) {
        self.feedback_counts.insert(reason.to_string(), attempt);
    }

    /// Count a failed patch on `path`; returns the consecutive failures.
    pub fn record_patch_failure(&mut self, path: &str) -> u32 {
        let count = self.patch_failures.entry(path.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn clear_patch_failures(&mut self, path: &str) {
        self.patch_failures.remove(path);
    }

    pub fn patch_failures(&self, path: &str) -> u32 {
        self.patch_failures.get(path).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_call() {
        let mut metrics = RunMetrics::new();
        metrics.record_call("read", false);
        metrics.record_call("read", true);
        metrics.record_call("write", false);
        assert_eq!(metrics.tool_calls_total, 3);
        assert_eq!(metrics.tool_errors_total, 1);
        assert_eq!(metrics.tool_call_counts["read"], 2);
        assert_eq!(metrics.tool_error_counts["read"], 1);
    }

    #[test]
    fn test_patch_failures() {
        let mut metrics = RunMetrics::new();
        assert_eq!(metrics.record_patch_failure("a.rs"), 1);
        assert_eq!(metrics.record_patch_failure("a.rs"), 2);
        metrics.clear_patch_failures("a.rs");
        assert_eq!(metrics.patch_failures("a.rs"), 0);

        let json = serde_json::to_value(&metrics).unwrap();
        assert!(json.get("patch_failures").is_none());
    }
}
