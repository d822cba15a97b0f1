//! Model-call tools: side-calls to the same backend and sub-agent processes.
//!
//! - `self`: one request with the flattened conversation as context.
//! - `self_batch`: independent questions sent concurrently on a bounded
//!   pool. Fail-all: one failed question fails the whole call.
//! - `subprocess`: a configured command receives the prompt as its last
//!   argument; its cleaned stdout is the answer.

use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use serde_json::{Map, Value};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::time::timeout;

use super::{int_arg, ModelCallSpec, ToolContext, ToolError, ToolErrorKind, ToolOutput};
use crate::llm::{Message, ModelBackend, ModelRequest, Role, ToolChoice};

const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a careful senior engineer. Answer the question directly and concisely.";
const DEFAULT_TEMPERATURE: f32 = 0.3;
const DEFAULT_MAX_TOKENS: u32 = 4000;
const HISTORY_CONTENT_CHARS: usize = 2000;
const HISTORY_TOOL_RESULT_CHARS: usize = 500;
/// Fallback argument names tried after the configured prompt parameter.
const PROMPT_KEYS: &[&str] = &["prompt", "content", "thought", "question", "query", "request", "text"];

fn ansi_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").expect("static regex"))
}

fn model_error(message: impl Into<String>) -> ToolError {
    ToolError::new(ToolErrorKind::ModelCall, message)
}

/// One side-call to the session backend.
pub async fn self_call(
    spec: &ModelCallSpec,
    args: &Map<String, Value>,
    ctx: &mut ToolContext<'_>,
) -> Result<ToolOutput, ToolError> {
    let prompt = pick_prompt(args, spec)?;
    let backend = ctx
        .backend
        .ok_or_else(|| model_error("no model backend available for model calls"))?;
    let answer = ask(backend, spec, ctx.history, prompt).await?;
    Ok(ToolOutput::ok(answer))
}

/// Several side-calls in parallel. Answers keep question order.
pub async fn self_batch(
    spec: &ModelCallSpec,
    args: &Map<String, Value>,
    ctx: &mut ToolContext<'_>,
) -> Result<ToolOutput, ToolError> {
    let key = if args.contains_key(&spec.prompt_param) {
        spec.prompt_param.as_str()
    } else {
        "questions"
    };
    let Some(raw) = args.get(key).and_then(Value::as_array) else {
        return Err(ToolError::new(
            ToolErrorKind::InvalidArguments,
            "questions is required and must be an array of strings",
        ));
    };
    let questions: Vec<&str> = raw
        .iter()
        .filter_map(Value::as_str)
        .filter(|q| !q.trim().is_empty())
        .collect();
    if questions.is_empty() {
        return Err(ToolError::new(
            ToolErrorKind::InvalidArguments,
            "questions array must contain at least one non-empty string",
        ));
    }
    if questions.len() > spec.max_questions {
        return Err(ToolError::new(
            ToolErrorKind::InvalidValue,
            format!("maximum {} questions per batch", spec.max_questions),
        ));
    }
    let backend = ctx
        .backend
        .ok_or_else(|| model_error("no model backend available for model calls"))?;

    let sem = Arc::new(Semaphore::new(spec.max_concurrent.max(1)));
    let history = ctx.history;
    let mut futures = Vec::with_capacity(questions.len());
    for question in &questions {
        let sem = sem.clone();
        futures.push(async move {
            let _permit = sem
                .acquire()
                .await
                .map_err(|e| model_error(format!("batch pool closed: {e}")))?;
            ask(backend, spec, history, question).await
        });
    }
    let results = futures::future::join_all(futures).await;

    let mut parts = Vec::with_capacity(results.len());
    for (idx, result) in results.into_iter().enumerate() {
        let answer = result.map_err(|e| {
            tracing::warn!(question = idx + 1, error = %e, "batch question failed");
            e
        })?;
        parts.push(format!("## Question {}: {}\n\n{answer}", idx + 1, questions[idx]));
    }
    tracing::info!(questions = parts.len(), "batch model call finished");
    Ok(ToolOutput::ok(parts.join("\n\n---\n\n")))
}

/// Run a sub-agent process.
pub async fn subprocess(
    spec: &ModelCallSpec,
    args: &Map<String, Value>,
) -> Result<ToolOutput, ToolError> {
    let prompt = pick_prompt(args, spec)?;
    let Some((program, fixed_args)) = spec.command.split_first() else {
        return Err(model_error("subprocess command is not configured"));
    };
    let timeout_secs = int_arg(args, "timeout")
        .filter(|t| *t > 0)
        .map(|t| t as u64)
        .unwrap_or(spec.timeout_secs);

    let child = Command::new(program)
        .args(fixed_args)
        .arg(prompt)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| model_error(format!("failed to call agent: {e}")))?;

    let output = match timeout(Duration::from_secs(timeout_secs), child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return Err(model_error(format!("failed to call agent: {e}"))),
        Err(_) => {
            return Err(model_error(format!(
                "agent timed out after {timeout_secs} seconds"
            )))
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let response = clean_agent_output(&stdout);
    if response.is_empty() {
        return Err(model_error(format!(
            "agent returned no output (stdout_len={}, returncode={})",
            stdout.len(),
            output.status.code().unwrap_or(-1)
        )));
    }
    Ok(ToolOutput::ok(response))
}

async fn ask(
    backend: &dyn ModelBackend,
    spec: &ModelCallSpec,
    history: &[Message],
    prompt: &str,
) -> Result<String, ToolError> {
    let mut messages = if spec.include_history {
        flatten_history(history)
    } else {
        Vec::new()
    };
    messages.push(Message::user(prompt));

    let request = ModelRequest::new(messages)
        .with_system_prompt(
            spec.system_prompt
                .as_deref()
                .unwrap_or(DEFAULT_SYSTEM_PROMPT),
        )
        .with_tool_choice(ToolChoice::None)
        .with_temperature(spec.temperature.unwrap_or(DEFAULT_TEMPERATURE))
        .with_max_tokens(spec.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS));

    let response = backend
        .complete(request)
        .await
        .map_err(|e| model_error(format!("API call failed: {e}")))?;
    let answer = response.content_str().trim();
    if answer.is_empty() {
        return Err(model_error("no response from model"));
    }
    Ok(answer.to_string())
}

/// Role/content-only copy of the conversation, so side-calls never enter
/// tool-call mode.
fn flatten_history(history: &[Message]) -> Vec<Message> {
    history
        .iter()
        .filter_map(|msg| match msg.role {
            Role::User => non_empty(clip(&msg.content, HISTORY_CONTENT_CHARS)).map(Message::user),
            Role::Assistant => {
                non_empty(clip(&msg.content, HISTORY_CONTENT_CHARS)).map(Message::assistant)
            }
            Role::Tool => non_empty(clip(&msg.content, HISTORY_TOOL_RESULT_CHARS)).map(|r| {
                Message::assistant(format!(
                    "Tool result ({}): {r}",
                    msg.name.as_deref().unwrap_or("tool")
                ))
            }),
            Role::System => None,
        })
        .collect()
}

fn pick_prompt<'a>(args: &'a Map<String, Value>, spec: &ModelCallSpec) -> Result<&'a str, ToolError> {
    let mut keys: Vec<&str> = vec![spec.prompt_param.as_str()];
    keys.extend(PROMPT_KEYS.iter().filter(|k| **k != spec.prompt_param));
    keys.iter()
        .find_map(|k| args.get(*k).and_then(Value::as_str).filter(|v| !v.trim().is_empty()))
        .ok_or_else(|| {
            ToolError::new(
                ToolErrorKind::InvalidArguments,
                format!(
                    "prompt is required and must be a string (accepted keys: {})",
                    keys.join(", ")
                ),
            )
        })
}

fn clip(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", text[..cut].trim_end()),
        None => text.to_string(),
    }
}

fn non_empty(text: String) -> Option<String> {
    (!text.is_empty()).then_some(text)
}

/// Strip ANSI escapes and blank lines from sub-agent output.
fn clean_agent_output(stdout: &str) -> String {
    stdout
        .lines()
        .map(|line| ansi_re().replace_all(line, "").trim().to_string())
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
