//! Tool-call dispatch.
//!
//! Turns one raw model tool call into a [`ToolOutput`]: resolve the name,
//! recover the arguments, normalize and validate them, run the handler.
//! Nothing here ever fails the caller; every problem becomes an `error:`
//! result carrying a [`ToolErrorKind`].

pub mod repair;
pub mod validate;

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use serde_json::{Map, Value};

use crate::llm::{Message, ModelBackend, ToolCall};
use crate::session::SessionState;
use crate::tools::shell::parse_payload;
use crate::tools::{
    Effect, ToolContext, ToolError, ToolErrorKind, ToolLimits, ToolOutput, ToolRegistry,
};

const RAW_PREVIEW_CHARS: usize = 100;
const PATCH_TOOL: &str = "apply_patch";
const SHELL_TOOL: &str = "shell";

/// Result of dispatching one call.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    /// Canonical tool name, or the cleaned raw name when unresolved.
    pub tool: String,
    /// Name as the model sent it.
    pub raw_name: String,
    pub args: Map<String, Value>,
    pub output: ToolOutput,
}

impl DispatchOutcome {
    pub fn is_error(&self) -> bool {
        self.output.is_error() || is_tool_error(&self.tool, &self.output.content)
    }

    pub fn error_kind(&self) -> Option<ToolErrorKind> {
        self.output.error
    }

    pub fn made_change(&self) -> bool {
        !self.is_error() && self.output.effect == Effect::Changed
    }

    pub fn is_noop(&self) -> bool {
        self.output.effect == Effect::NoOp
    }

    /// Primary target of the call, used in feedback and logs.
    pub fn target(&self) -> Option<&str> {
        ["path", "command", "pat", "pattern"]
            .iter()
            .find_map(|k| self.args.get(*k).and_then(Value::as_str))
    }
}

/// Whether a result string denotes a failure: an `error:` prefix, or a
/// shell payload with a non-zero exit code.
pub fn is_tool_error(tool: &str, content: &str) -> bool {
    if content.starts_with("error:") {
        return true;
    }
    tool == SHELL_TOOL && parse_payload(content).is_some_and(|p| p.metadata.exit_code != 0)
}

/// Routes tool calls to their handlers.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: ToolRegistry,
    limits: ToolLimits,
}

impl Dispatcher {
    pub fn new(registry: ToolRegistry, limits: ToolLimits) -> Self {
        Self { registry, limits }
    }

    /// Dispatcher over the built-in tools with default limits.
    pub fn with_builtin_tools() -> Self {
        Self::new(ToolRegistry::with_builtin_tools(), ToolLimits::default())
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn limits(&self) -> &ToolLimits {
        &self.limits
    }

    /// Canonical name for a raw model-supplied name. Only the first line
    /// counts, and any trailing framing token (`<|...`) is cut.
    pub fn resolve_name(&self, raw: &str) -> String {
        let key = clean_name(raw);
        self.registry
            .resolve_alias(&key)
            .map(str::to_string)
            .unwrap_or(key)
    }

    /// Decode call arguments, running the repair pipeline when the text is
    /// not valid JSON.
    pub fn parse_arguments(&self, tool: &str, raw: &Value) -> Result<Map<String, Value>, ToolError> {
        let text = match raw {
            Value::Null => return Ok(Map::new()),
            Value::Object(map) => return Ok(map.clone()),
            Value::String(s) => s.as_str(),
            other => {
                return Err(ToolError::new(
                    ToolErrorKind::InvalidArguments,
                    format!("invalid arguments for tool '{tool}': expected object, got {other}"),
                ))
            }
        };
        if text.trim().is_empty() {
            return Ok(Map::new());
        }

        let parse_error = match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => return Ok(map),
            Ok(Value::Null) => return Ok(Map::new()),
            Ok(other) => {
                return Err(ToolError::new(
                    ToolErrorKind::InvalidArguments,
                    format!("invalid arguments for tool '{tool}': expected object, got {other}"),
                ))
            }
            Err(e) => e,
        };

        if let Some(map) = repair::repair_json(text) {
            tracing::info!(tool, "repaired malformed tool arguments");
            return Ok(map);
        }

        if tool == PATCH_TOOL {
            if let Some(block) = repair::extract_patch_block(text) {
                tracing::info!(tool, "recovered patch block from malformed arguments");
                let mut map = Map::new();
                map.insert("patch".into(), Value::String(block.to_string()));
                return Ok(map);
            }
        }

        let numeric_fields: Vec<&str> = self
            .registry
            .get(tool)
            .map(|t| {
                t.definition
                    .parameters
                    .iter()
                    .filter(|p| p.param_type.is_numeric())
                    .map(|p| p.name.as_str())
                    .collect()
            })
            .unwrap_or_default();
        let repaired = repair::repair_number_words(text, &numeric_fields);
        if repaired != text {
            if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&repaired) {
                tracing::info!(tool, "repaired number words in tool arguments");
                return Ok(map);
            }
        }

        let preview: String = text.chars().take(RAW_PREVIEW_CHARS).collect();
        Err(ToolError::new(
            ToolErrorKind::InvalidArguments,
            format!("invalid JSON in tool arguments: {parse_error}. Raw: {preview}"),
        ))
    }

    /// Dispatch one call. Handler errors and panics become error results.
    pub async fn dispatch(
        &self,
        call: &ToolCall,
        session: &mut SessionState,
        backend: Option<&dyn ModelBackend>,
        history: &[Message],
    ) -> DispatchOutcome {
        let raw_name = call.name().to_string();
        let mut outcome = DispatchOutcome {
            tool: String::new(),
            raw_name: raw_name.clone(),
            args: Map::new(),
            output: ToolOutput::ok(""),
        };
        if raw_name.trim().is_empty() {
            outcome.output = ToolOutput::error(ToolErrorKind::MissingToolName, "missing tool name");
            return outcome;
        }

        let tool = self.resolve_name(&raw_name);
        outcome.tool = tool.clone();

        let args = match self.parse_arguments(&tool, &call.function.arguments) {
            Ok(args) => args,
            Err(err) => {
                tracing::warn!(tool = %tool, error = %err, "tool arguments rejected");
                outcome.output = err.into_output();
                return outcome;
            }
        };

        let hint = self
            .registry
            .unsupported_hint(&clean_name(&raw_name))
            .or_else(|| self.registry.unsupported_hint(&tool));
        if let Some(hint) = hint {
            outcome.args = args;
            outcome.output = ToolOutput::error(ToolErrorKind::UnsupportedTool, hint);
            return outcome;
        }

        let Some(registered) = self.registry.get(&tool) else {
            tracing::warn!(tool = %raw_name, "unknown tool");
            outcome.args = args;
            outcome.output = ToolOutput::error(
                ToolErrorKind::UnknownTool,
                format!("unknown tool '{raw_name}'"),
            );
            return outcome;
        };

        let def = &registered.definition;
        let display = self.registry.display_name(&tool);
        let mut args = validate::normalize_argument_names(def, args);
        validate::coerce_numeric(def, &mut args);
        if let Err(err) = validate::validate_arguments(def, display, &args) {
            tracing::warn!(tool = %tool, error = %err, "tool arguments invalid");
            outcome.args = args;
            outcome.output = err.into_output();
            return outcome;
        }

        let mut ctx = ToolContext {
            session,
            limits: &self.limits,
            backend,
            history,
        };
        let result = AssertUnwindSafe(registered.handler.execute(&args, &mut ctx))
            .catch_unwind()
            .await;
        outcome.output = match result {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => err.into_output(),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(tool = %tool, panic = %message, "tool handler panicked");
                ToolOutput::error(
                    ToolErrorKind::HandlerPanic,
                    format!("tool '{display}' failed: {message}"),
                )
            }
        };
        outcome.args = args;

        tracing::debug!(
            tool = %tool,
            error = ?outcome.output.error,
            effect = ?outcome.output.effect,
            "tool call dispatched"
        );
        outcome
    }
}

fn clean_name(raw: &str) -> String {
    let first = raw.trim().lines().next().unwrap_or_default();
    let cut = first.split("<|").next().unwrap_or_default();
    cut.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxGuard;
    use serde_json::json;

    #[test]
    fn test_resolve_name() {
        let dispatcher = Dispatcher::with_builtin_tools();
        assert_eq!(dispatcher.resolve_name("Read_File"), "read");
        assert_eq!(dispatcher.resolve_name("  bash<|channel|>commentary"), "shell");
        assert_eq!(dispatcher.resolve_name("write\nextra line"), "write");
        assert_eq!(dispatcher.resolve_name("mystery"), "mystery");
    }

    #[test]
    fn test_parse_arguments_paths() {
        let dispatcher = Dispatcher::with_builtin_tools();
        assert!(dispatcher.parse_arguments("ls", &Value::Null).unwrap().is_empty());
        assert!(dispatcher.parse_arguments("ls", &json!("")).unwrap().is_empty());
        assert_eq!(
            dispatcher.parse_arguments("ls", &json!({"path": "."})).unwrap()["path"],
            "."
        );
        assert_eq!(
            dispatcher
                .parse_arguments("read", &json!("{\"path\": \"a\", \"limit\": fifty}"))
                .unwrap()["limit"],
            50
        );

        let raw = "patch: *** Begin Patch\n*** Add File: a.txt\n+hi\n*** End Patch";
        let args = dispatcher.parse_arguments("apply_patch", &json!(raw)).unwrap();
        assert!(args["patch"].as_str().unwrap().starts_with("*** Begin Patch"));

        let err = dispatcher
            .parse_arguments("read", &json!("path = a.txt"))
            .unwrap_err();
        assert!(err.to_string().starts_with("invalid JSON in tool arguments:"));
        assert!(err.to_string().ends_with("Raw: path = a.txt"));
    }

    #[test]
    fn test_is_tool_error() {
        assert!(is_tool_error("read", "error: nope"));
        assert!(!is_tool_error("read", "ok"));
        let failed = r#"{"output":"x","metadata":{"exit_code":2,"duration_seconds":0.1}}"#;
        let passed = r#"{"output":"x","metadata":{"exit_code":0,"duration_seconds":0.1}}"#;
        assert!(is_tool_error("shell", failed));
        assert!(!is_tool_error("shell", passed));
        assert!(!is_tool_error("read", failed));
    }

    #[tokio::test]
    async fn test_dispatch_name_errors() {
        let mut dispatcher = Dispatcher::with_builtin_tools();
        let mut session = SessionState::new(SandboxGuard::unrestricted("."));

        let out = dispatcher
            .dispatch(&ToolCall::new("c1", "  ", json!({})), &mut session, None, &[])
            .await;
        assert_eq!(out.output.content, "error: missing tool name");

        let out = dispatcher
            .dispatch(&ToolCall::new("c2", "teleport", json!({})), &mut session, None, &[])
            .await;
        assert_eq!(out.output.content, "error: unknown tool 'teleport'");
        assert_eq!(out.error_kind(), Some(ToolErrorKind::UnknownTool));

        dispatcher
            .registry
            .mark_unsupported("web_fetch", "error: web_fetch is not available; use shell");
        let out = dispatcher
            .dispatch(&ToolCall::new("c3", "web_fetch", json!({})), &mut session, None, &[])
            .await;
        assert_eq!(out.error_kind(), Some(ToolErrorKind::UnsupportedTool));
        assert_eq!(out.output.content, "error: web_fetch is not available; use shell");
    }

    #[tokio::test]
    async fn test_dispatch_validates_before_running() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = Dispatcher::with_builtin_tools();
        let mut session = SessionState::new(SandboxGuard::new(dir.path()).unwrap());

        let call = ToolCall::new("c1", "write_file", json!({"file": "a.txt"}));
        let out = dispatcher.dispatch(&call, &mut session, None, &[]).await;
        assert_eq!(out.tool, "write");
        assert_eq!(out.error_kind(), Some(ToolErrorKind::MissingParameter));
        assert!(!dir.path().join("a.txt").exists());

        let call = ToolCall::new(
            "c2",
            "write_file",
            json!("{\"file\": \"a.txt\", \"text\": \"hello\\n\",}"),
        );
        let out = dispatcher.dispatch(&call, &mut session, None, &[]).await;
        assert!(!out.is_error(), "{}", out.output.content);
        assert!(out.made_change());
        assert_eq!(out.target(), Some("a.txt"));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("a.txt")).unwrap(),
            "hello\n"
        );
    }
}
