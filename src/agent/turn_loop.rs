use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

use super::budget::RetryBudget;
use super::config::AgentSettings;
use super::error::AgentError;
use super::feedback::{
    build_feedback, patch_file, strict_unknown_tool_suffix, with_attempt, FeedbackInput,
    FeedbackReason,
};
use super::metrics::RunMetrics;
use super::trim::{request_window, trim_messages};
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::llm::{Message, ModelBackend, ModelRequest, ModelResponse, ToolCall, ToolChoice};
use crate::session::SessionState;
use crate::tools::{ToolCategory, ToolErrorKind, ToolRegistry};

const FINISH_TOOL: &str = "finish";
const PATCH_TOOL: &str = "apply_patch";
/// Preference order when a code change has to be forced.
const CODE_CHANGE_TOOLS: [&str; 3] = ["apply_patch", "edit", "write"];
/// `write_repeated_noop` feedback count that ends the run.
const WRITE_NOOP_GUARD_LIMIT: u32 = 3;
/// Consecutive all-no-op write turns after a change that end the run.
const NOOP_FORCE_STOP_TURNS: usize = 3;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The model answered without tool calls and every requirement held.
    FinalContent,
    /// The model called `finish`.
    Finish,
    /// Repeated no-op writes tripped the loop guard.
    WriteNoopGuard,
    /// Several turns in a row produced only no-op writes after a change.
    NoopForceStop,
    /// The run ended with an [`AgentError`].
    Error,
}

/// Result of [`AgentLoop::run`]. The transcript is returned on success and
/// on failure alike.
#[derive(Debug)]
pub struct RunOutcome {
    pub result: Result<String, AgentError>,
    pub stop: StopReason,
    pub messages: Vec<Message>,
    pub turns: usize,
    pub metrics: RunMetrics,
}

impl RunOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    /// Final content, or the `error: ...` marker of a failed run.
    pub fn content(&self) -> String {
        match &self.result {
            Ok(content) => content.clone(),
            Err(err) => format!("error: {err}"),
        }
    }
}

/// Mutable bookkeeping of one run.
struct RunState {
    messages: Vec<Message>,
    metrics: RunMetrics,
    budget: RetryBudget,
    turns: usize,
    /// Turns spent on format retries; excluded from the soft limit.
    retry_turns: usize,
    forced: Option<String>,
    code_changed: bool,
    noop_turns: usize,
}

impl RunState {
    fn retry(&mut self, text: String) {
        tracing::info!(turn = self.turns, message = %first_line(&text), "format retry");
        self.messages.push(Message::user(text));
        self.retry_turns += 1;
    }

    /// Keep a rejected plain-text answer in the transcript.
    fn push_rejected(&mut self, content: &str, analysis_only: bool) {
        if !analysis_only && !content.trim().is_empty() {
            self.messages.push(Message::assistant(content));
        }
    }
}

/// Drives one agent conversation against a model backend.
pub struct AgentLoop {
    backend: Arc<dyn ModelBackend>,
    dispatcher: Dispatcher,
    settings: AgentSettings,
    system_prompt: Option<String>,
}

impl AgentLoop {
    pub fn new(backend: Arc<dyn ModelBackend>, dispatcher: Dispatcher, settings: AgentSettings) -> Self {
        Self {
            backend,
            dispatcher,
            settings,
            system_prompt: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Run the agent on `prompt`, continuing after `previous` messages.
    ///
    /// Never panics on tool failures; run-level failures are reported in
    /// [`RunOutcome::result`] together with the full transcript.
    pub async fn run(
        &self,
        session: &mut SessionState,
        prompt: &str,
        previous: Vec<Message>,
    ) -> RunOutcome {
        // A finish signal from an earlier run must not end this one.
        session.take_finish();

        let mut messages = previous;
        messages.push(Message::user(prompt));
        let mut state = RunState {
            messages,
            metrics: RunMetrics::new(),
            budget: RetryBudget::new(self.settings.max_format_retries),
            turns: 0,
            retry_turns: 0,
            forced: None,
            code_changed: false,
            noop_turns: 0,
        };

        tracing::info!(
            backend = self.backend.name(),
            max_turns = self.settings.max_turns,
            "starting agent run"
        );
        let (result, stop) = match self.drive(session, prompt, &mut state).await {
            Ok((content, stop)) => (Ok(content), stop),
            Err(err) => {
                tracing::warn!(error = %err, turns = state.turns, "agent run failed");
                (Err(err), StopReason::Error)
            }
        };
        state.metrics.format_retries = state.budget.format_retries();
        tracing::info!(
            stop = ?stop,
            turns = state.turns,
            tool_calls = state.metrics.tool_calls_total,
            "agent run finished"
        );

        RunOutcome {
            result,
            stop,
            messages: state.messages,
            turns: state.turns,
            metrics: state.metrics,
        }
    }

    async fn drive(
        &self,
        session: &mut SessionState,
        prompt: &str,
        state: &mut RunState,
    ) -> Result<(String, StopReason), AgentError> {
        let settings = &self.settings;
        loop {
            state.turns += 1;
            if state.turns > settings.hard_turn_limit() {
                return Err(AgentError::HardTurnLimit);
            }
            if state.turns - state.retry_turns > settings.max_turns {
                return Err(AgentError::MaxTurns);
            }

            state.metrics.trimmed_messages += trim_messages(
                &mut state.messages,
                settings.max_context_chars,
                settings.trim_keep_last,
            );

            let forced = state.forced.take();
            let response = self.request(&state.messages, forced.as_deref()).await?;
            state.metrics.usage.add(response.usage);

            let ModelResponse {
                content,
                mut tool_calls,
                reasoning,
                analysis_only,
                ..
            } = response;
            let content = content.unwrap_or_default();
            let reasoning = reasoning.filter(|_| settings.retain_reasoning);
            if settings.max_batch_tool_calls > 0 && tool_calls.len() > settings.max_batch_tool_calls {
                tracing::info!(
                    received = tool_calls.len(),
                    kept = settings.max_batch_tool_calls,
                    "truncating tool call batch"
                );
                tool_calls.truncate(settings.max_batch_tool_calls);
            }

            if let Some(expected) = forced.as_deref() {
                if !self.calls_only(&tool_calls, expected) {
                    let Some(attempt) = state.budget.take_format_retry() else {
                        return Err(AgentError::ForcedToolChoiceMismatch);
                    };
                    let display = self.registry().display_name(expected);
                    state.retry(format!(
                        "FORMAT ERROR (attempt {attempt}/{}): TOOL CALL REQUIRED: {display}. \
                         Output ONLY that tool call (no text, no other tools).",
                        settings.max_format_retries
                    ));
                    state.forced = Some(expected.to_string());
                    continue;
                }
            }

            if tool_calls.is_empty() {
                if let Some(done) = self
                    .handle_no_calls(session, prompt, state, content, reasoning, analysis_only)
                    .await?
                {
                    return Ok(done);
                }
                continue;
            }

            if let Some(done) = self
                .handle_calls(session, state, content, reasoning, tool_calls)
                .await
            {
                return Ok(done);
            }
        }
    }

    fn registry(&self) -> &ToolRegistry {
        self.dispatcher.registry()
    }

    async fn request(
        &self,
        messages: &[Message],
        forced: Option<&str>,
    ) -> Result<ModelResponse, AgentError> {
        let registry = self.registry();
        let choice = match forced {
            Some(name) => ToolChoice::Function(registry.display_name(name).to_string()),
            None if self.settings.tool_choice_required => ToolChoice::Required,
            None => ToolChoice::Auto,
        };
        let window = request_window(messages, self.settings.history_max_messages);

        let mut request = ModelRequest::new(window.to_vec())
            .with_tools(registry.to_json_schema())
            .with_tool_choice(choice);
        if let Some(prompt) = &self.system_prompt {
            request = request.with_system_prompt(prompt.clone());
        }
        if let Some(temperature) = self.settings.temperature {
            request = request.with_temperature(temperature);
        }
        if let Some(max_tokens) = self.settings.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }

        tracing::debug!(
            messages = window.len(),
            forced = forced.unwrap_or("-"),
            "requesting completion"
        );
        self.backend.complete(request).await.map_err(|err| {
            tracing::error!(backend = self.backend.name(), error = %err, "backend request failed");
            AgentError::from(err)
        })
    }

    /// Whether the response calls the forced tool and nothing else.
    fn calls_only(&self, calls: &[ToolCall], expected: &str) -> bool {
        !calls.is_empty()
            && calls
                .iter()
                .all(|c| self.dispatcher.resolve_name(c.name()) == expected)
    }

    fn is_write_tool(&self, tool: &str) -> bool {
        self.registry()
            .get(tool)
            .is_some_and(|t| t.definition.category == Some(ToolCategory::Write))
    }

    async fn handle_no_calls(
        &self,
        session: &mut SessionState,
        prompt: &str,
        state: &mut RunState,
        content: String,
        reasoning: Option<String>,
        analysis_only: bool,
    ) -> Result<Option<(String, StopReason)>, AgentError> {
        let settings = &self.settings;
        let max = settings.max_format_retries;

        if settings.min_tool_calls > 0 && state.metrics.tool_calls_total < settings.min_tool_calls {
            state.push_rejected(&content, analysis_only);
            if let Some(attempt) = state.budget.take_format_retry() {
                let text = if settings.tool_choice_required {
                    state.forced = select_forced_tool_call(self.registry(), session, prompt)
                        .map(|(name, _)| name);
                    format!(
                        "FORMAT ERROR (attempt {attempt}/{max}): TOOL CALL REQUIRED. \
                         Output ONLY a tool call (no text). Available tools: {}.",
                        self.tool_names().join(", ")
                    )
                } else {
                    format!(
                        "FORMAT ERROR (attempt {attempt}/{max}): TOOL CALL REQUIRED. \
                         Use at least one tool call before finishing."
                    )
                };
                state.retry(text);
                return Ok(None);
            }
            if settings.auto_tool_call_on_failure && state.budget.take_auto_tool_call().is_some() {
                if let Some((name, args)) = select_forced_tool_call(self.registry(), session, prompt) {
                    self.inject_forced_call(session, state, &name, args).await;
                    return Ok(None);
                }
            }
            return Err(AgentError::MinToolCallsNotMet);
        }

        if settings.require_code_change && !state.code_changed {
            state.push_rejected(&content, analysis_only);
            let Some(attempt) = state.budget.take_code_change_retry() else {
                return Err(AgentError::CodeChangeRequired);
            };
            let tools = self.code_change_tools();
            state.forced = tools.first().map(|t| t.to_string());
            let names: Vec<&str> = tools.iter().map(|t| self.registry().display_name(t)).collect();
            state.retry(format!(
                "FORMAT ERROR (attempt {attempt}/{max}): TOOL CALL REQUIRED: {}. \
                 Output ONLY that tool call (no text, no other tools).",
                names.join("/")
            ));
            return Ok(None);
        }

        if analysis_only || content.trim().is_empty() {
            if analysis_only {
                state.metrics.analysis_retries += 1;
            }
            let Some(attempt) = state.budget.take_format_retry() else {
                return Err(if analysis_only {
                    AgentError::AnalysisOnlyExhausted
                } else {
                    AgentError::EmptyResponseExhausted
                });
            };
            let what = if analysis_only {
                "analysis-only artifact detected"
            } else {
                "empty response"
            };
            state.retry(format!(
                "FORMAT ERROR (attempt {attempt}/{max}): {what}; output final content or a tool call."
            ));
            return Ok(None);
        }

        state
            .messages
            .push(Message::assistant(content.clone()).with_reasoning(reasoning));
        Ok(Some((content, StopReason::FinalContent)))
    }

    async fn handle_calls(
        &self,
        session: &mut SessionState,
        state: &mut RunState,
        content: String,
        reasoning: Option<String>,
        tool_calls: Vec<ToolCall>,
    ) -> Option<(String, StopReason)> {
        let registry = self.registry();
        let mut calls: Vec<ToolCall> = tool_calls
            .into_iter()
            .map(|mut call| {
                if call.id.trim().is_empty() {
                    call.id = format!("call_{}", Uuid::new_v4().simple());
                }
                call
            })
            .collect();

        let mut results = Vec::with_capacity(calls.len());
        let mut feedback: Option<(FeedbackReason, String)> = None;
        let mut finished = false;
        let (mut write_results, mut noop_results) = (0usize, 0usize);

        for call in &calls {
            let outcome = self
                .dispatcher
                .dispatch(call, session, Some(self.backend.as_ref()), &state.messages)
                .await;
            let is_error = outcome.is_error();
            state.metrics.record_call(&outcome.tool, is_error);
            if self.is_write_tool(&outcome.tool) {
                write_results += 1;
                if is_noop_result(&outcome) {
                    noop_results += 1;
                }
                if outcome.made_change() {
                    state.code_changed = true;
                }
            }
            let patch_failures = track_patch_failures(&mut state.metrics, &outcome, is_error);
            results.push(Message::tool(
                call.id.clone(),
                outcome.raw_name.clone(),
                outcome.output.content.clone(),
            ));

            if outcome.tool == FINISH_TOOL && !is_error {
                finished = true;
                break;
            }
            if !is_error {
                continue;
            }
            let reason = outcome
                .error_kind()
                .and_then(|kind| FeedbackReason::classify(&outcome.tool, kind, &outcome.output.content));
            if let Some(reason) = reason {
                let input = FeedbackInput {
                    reason,
                    tool: &outcome.tool,
                    raw_name: &outcome.raw_name,
                    path: feedback_path(&outcome),
                    patch_failures,
                };
                feedback = Some((reason, build_feedback(registry, &input)));
                break;
            }
        }

        let dispatched = results.len();
        if dispatched < calls.len() {
            tracing::info!(
                dispatched,
                skipped = calls.len() - dispatched,
                "stopped dispatching for this turn"
            );
            calls.truncate(dispatched);
        }
        state
            .messages
            .push(Message::assistant_with_tool_calls(content, calls).with_reasoning(reasoning));
        state.messages.extend(results);

        if finished {
            let signal = session.take_finish();
            if self.settings.require_code_change && !state.code_changed {
                let input = FeedbackInput {
                    reason: FeedbackReason::FinishBeforeChange,
                    tool: FINISH_TOOL,
                    raw_name: FINISH_TOOL,
                    path: None,
                    patch_failures: 0,
                };
                feedback = Some((input.reason, build_feedback(registry, &input)));
            } else {
                let summary = signal
                    .map(|s| s.summary)
                    .filter(|s| !s.trim().is_empty())
                    .unwrap_or_else(|| "done".to_string());
                return Some((summary, StopReason::Finish));
            }
        }

        if state.code_changed && write_results > 0 && noop_results == write_results {
            state.noop_turns += 1;
        } else {
            state.noop_turns = 0;
        }
        if state.noop_turns >= NOOP_FORCE_STOP_TURNS {
            tracing::warn!(turns = state.noop_turns, "no-op writes after change, stopping run");
            return Some((String::new(), StopReason::NoopForceStop));
        }

        let (reason, text) = feedback?;
        let attempt = state.budget.record_feedback(reason);
        state.metrics.record_feedback(reason.as_str(), attempt);
        if reason == FeedbackReason::WriteRepeatedNoop && attempt >= WRITE_NOOP_GUARD_LIMIT {
            tracing::warn!(attempt, "write no-op guard stopped the run");
            return Some((String::new(), StopReason::WriteNoopGuard));
        }

        let mut text = with_attempt(&text, attempt);
        if reason == FeedbackReason::UnknownToolName && attempt >= 2 {
            text.push_str(&strict_unknown_tool_suffix(registry));
        }
        tracing::info!(reason = %reason, attempt, "sending corrective feedback");
        state.messages.push(Message::user(text));
        None
    }

    /// Run one synthesized call as if the model had issued it.
    async fn inject_forced_call(
        &self,
        session: &mut SessionState,
        state: &mut RunState,
        name: &str,
        args: Value,
    ) {
        let display = self.registry().display_name(name).to_string();
        let call = ToolCall::new(format!("call_forced_{}", state.turns), display, args);
        tracing::info!(tool = name, "injecting forced tool call");

        let outcome = self
            .dispatcher
            .dispatch(&call, session, Some(self.backend.as_ref()), &state.messages)
            .await;
        state.metrics.record_call(&outcome.tool, outcome.is_error());
        if self.is_write_tool(&outcome.tool) && outcome.made_change() {
            state.code_changed = true;
        }
        let result = Message::tool(call.id.clone(), outcome.raw_name, outcome.output.content);
        state
            .messages
            .push(Message::assistant_with_tool_calls(String::new(), vec![call]));
        state.messages.push(result);
    }

    fn tool_names(&self) -> Vec<&str> {
        let registry = self.registry();
        registry
            .list_tools()
            .into_iter()
            .map(|name| registry.display_name(name))
            .collect()
    }

    /// Write tools in forcing preference order.
    fn code_change_tools(&self) -> Vec<&str> {
        let registry = self.registry();
        let mut tools: Vec<&str> = CODE_CHANGE_TOOLS
            .iter()
            .copied()
            .filter(|t| registry.get(t).is_some())
            .collect();
        for tool in registry.tools_in_category(ToolCategory::Write) {
            if !tools.contains(&tool) {
                tools.push(tool);
            }
        }
        tools
    }
}

fn prompt_path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:/|\b)[\w./-]+\.[A-Za-z0-9]{1,6}\b").expect("static regex")
    })
}

/// Pick a harmless call to force when the model refuses to use tools:
/// `read` on the first existing file mentioned in `prompt`, else `ls` of
/// the working directory.
pub fn select_forced_tool_call(
    registry: &ToolRegistry,
    session: &SessionState,
    prompt: &str,
) -> Option<(String, Value)> {
    if registry.get("read").is_some() {
        for found in prompt_path_re().find_iter(prompt) {
            let candidate = found.as_str();
            let exists = session
                .sandbox()
                .validate_path(candidate, true)
                .is_ok_and(|path| path.is_file());
            if exists {
                return Some(("read".to_string(), json!({ "path": candidate })));
            }
        }
    }
    registry
        .get("ls")
        .map(|_| ("ls".to_string(), json!({ "path": "." })))
}

fn is_noop_result(outcome: &DispatchOutcome) -> bool {
    outcome.is_noop()
        || matches!(
            outcome.error_kind(),
            Some(
                ToolErrorKind::WriteNoop
                    | ToolErrorKind::WriteRepeatedNoop
                    | ToolErrorKind::OldEqualsNew
                    | ToolErrorKind::PatchNoop
                    | ToolErrorKind::RepeatedPatch
            )
        )
}

fn feedback_path(outcome: &DispatchOutcome) -> Option<&str> {
    if outcome.tool == PATCH_TOOL {
        if let Some(path) = outcome.args.get("patch").and_then(Value::as_str).and_then(patch_file) {
            return Some(path);
        }
    }
    outcome.args.get("path").and_then(Value::as_str)
}

/// Update the per-file patch failure count; returns the current count.
fn track_patch_failures(metrics: &mut RunMetrics, outcome: &DispatchOutcome, is_error: bool) -> u32 {
    if outcome.tool != PATCH_TOOL {
        return 0;
    }
    let Some(path) = feedback_path(outcome) else {
        return 0;
    };
    if is_error {
        metrics.record_patch_failure(path)
    } else {
        metrics.clear_patch_failures(path);
        0
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}
