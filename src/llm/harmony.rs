//! Channel-token handling for backends that emit Harmony-style framing.
//!
//! Some models put `<|channel|>analysis<|message|>...<|end|>` sequences into
//! the visible content. A reply that has an analysis channel but no final
//! channel is an artifact, not an answer; [`HarmonyBackend`] marks such
//! replies `analysis_only` and moves the text into `reasoning`.

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;

use super::{ModelBackend, ModelRequest, ModelResponse};
use crate::error::BackendError;

const ANALYSIS_PREFIX: &str = "<|channel|>analysis";
const FINAL_MARKER: &str = "<|channel|>final";
const FRAMING_TOKENS: &[&str] = &["<|start|>", "<|message|>", "<|end|>", "<|return|>"];

fn analysis_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)<\|channel\|>analysis<\|message\|>(.*?)(?:<\|end\|>|<\|channel\|>|$)")
            .expect("static regex")
    })
}

fn final_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)<\|channel\|>final<\|message\|>(.*?)(?:<\|end\|>|<\|return\|>|$)")
            .expect("static regex")
    })
}

/// Whether `content` carries only an analysis channel.
pub fn is_analysis_artifact(content: &str) -> bool {
    let text = content.trim_start();
    text.starts_with(ANALYSIS_PREFIX)
        && !text.contains(FINAL_MARKER)
        && FRAMING_TOKENS.iter().any(|t| text.contains(t))
}

/// Text of the first analysis channel, if any.
pub fn extract_analysis(content: &str) -> Option<&str> {
    analysis_re()
        .captures(content)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Text of the final channel, if any.
pub fn extract_final(content: &str) -> Option<&str> {
    final_re()
        .captures(content)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Rewrite a response so no channel framing reaches the turn loop.
pub fn normalize_response(mut response: ModelResponse) -> ModelResponse {
    let Some(content) = response.content.take() else {
        return response;
    };

    if is_analysis_artifact(&content) {
        let analysis = extract_analysis(&content).unwrap_or(content.as_str()).trim().to_string();
        tracing::debug!(chars = analysis.len(), "analysis-only reply");
        if response.reasoning.is_none() && !analysis.is_empty() {
            response.reasoning = Some(analysis);
        }
        response.analysis_only = true;
        return response;
    }

    if content.contains(FINAL_MARKER) {
        if response.reasoning.is_none() {
            response.reasoning = extract_analysis(&content)
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty());
        }
        response.content = Some(extract_final(&content).unwrap_or_default().to_string());
        return response;
    }

    response.content = Some(content);
    response
}

/// Wraps a backend and normalizes channel framing in its replies.
pub struct HarmonyBackend<B> {
    inner: B,
}

impl<B: ModelBackend> HarmonyBackend<B> {
    pub fn new(inner: B) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> B {
        self.inner
    }
}

#[async_trait]
impl<B: ModelBackend> ModelBackend for HarmonyBackend<B> {
    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, BackendError> {
        let response = self.inner.complete(request).await?;
        Ok(normalize_response(response))
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
