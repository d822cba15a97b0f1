//! Tool definitions, registry and handlers.
//!
//! Every tool the model can call is described by a [`ToolDefinition`] and
//! bound to a closed [`HandlerKind`]. Handlers receive a [`ToolContext`]
//! carrying the mutable [`SessionState`] and return a [`ToolOutput`]; any
//! failure is a [`ToolError`] with a typed [`ToolErrorKind`], which the
//! dispatcher turns into an `error:` string for the model.

pub mod definition;
pub mod file;
pub mod finish;
pub mod model_call;
pub mod patch;
pub mod search;
pub mod shell;

pub use definition::{
    ModelCallMode, ModelCallSpec, ParamSpec, ParamType, ToolCategory, ToolDefinition,
};

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::error::ConfigError;
use crate::llm::{Message, ModelBackend};
use crate::patch::PatchError;
use crate::sandbox::SandboxError;
use crate::session::SessionState;

/// Broad error taxonomy used for logging and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    SandboxRejection,
    PatchApplication,
    NoOpDetected,
    Execution,
}

/// Typed failure reason attached to every tool error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    MissingToolName,
    UnknownTool,
    UnsupportedTool,
    InvalidArguments,
    UnknownParameter,
    MissingParameter,
    InvalidParameterType,
    InvalidValue,
    AccessDenied,
    PathNotFound,
    IsADirectory,
    CommandRejected,
    CommandFailed,
    CommandTimedOut,
    MustReadFirst,
    OldNotFound,
    OldNotUnique,
    OldEqualsNew,
    WriteNoop,
    WriteRepeatedNoop,
    InvalidPatchFormat,
    UnexpectedPatchLine,
    InvalidAddLine,
    ContextNotFound,
    ContextNotUnique,
    RepeatedPatch,
    PatchNoop,
    FileExists,
    InvalidRegex,
    FileTooLarge,
    Io,
    ModelCall,
    HandlerPanic,
}

impl ToolErrorKind {
    pub fn category(&self) -> ErrorCategory {
        use ToolErrorKind::*;
        match self {
            MissingToolName | UnknownTool | UnsupportedTool | InvalidArguments
            | UnknownParameter | MissingParameter | InvalidParameterType | InvalidValue
            | InvalidRegex => ErrorCategory::Validation,
            AccessDenied | CommandRejected => ErrorCategory::SandboxRejection,
            InvalidPatchFormat | UnexpectedPatchLine | InvalidAddLine | ContextNotFound
            | ContextNotUnique | RepeatedPatch | FileExists | MustReadFirst | OldNotFound
            | OldNotUnique | OldEqualsNew => ErrorCategory::PatchApplication,
            WriteNoop | WriteRepeatedNoop | PatchNoop => ErrorCategory::NoOpDetected,
            PathNotFound | IsADirectory | CommandFailed | CommandTimedOut | FileTooLarge | Io
            | ModelCall | HandlerPanic => ErrorCategory::Execution,
        }
    }

    pub fn as_str(&self) -> &'static str {
        use ToolErrorKind::*;
        match self {
            MissingToolName => "missing_tool_name",
            UnknownTool => "unknown_tool",
            UnsupportedTool => "unsupported_tool",
            InvalidArguments => "invalid_arguments",
            UnknownParameter => "unknown_parameter",
            MissingParameter => "missing_parameter",
            InvalidParameterType => "invalid_parameter_type",
            InvalidValue => "invalid_value",
            AccessDenied => "access_denied",
            PathNotFound => "path_not_found",
            IsADirectory => "is_a_directory",
            CommandRejected => "command_rejected",
            CommandFailed => "command_failed",
            CommandTimedOut => "command_timed_out",
            MustReadFirst => "must_read_first",
            OldNotFound => "old_not_found",
            OldNotUnique => "old_not_unique",
            OldEqualsNew => "old_equals_new",
            WriteNoop => "write_noop",
            WriteRepeatedNoop => "write_repeated_noop",
            InvalidPatchFormat => "invalid_patch_format",
            UnexpectedPatchLine => "unexpected_patch_line",
            InvalidAddLine => "invalid_add_line",
            ContextNotFound => "context_not_found",
            ContextNotUnique => "context_not_unique",
            RepeatedPatch => "repeated_patch",
            PatchNoop => "patch_noop",
            FileExists => "file_exists",
            InvalidRegex => "invalid_regex",
            FileTooLarge => "file_too_large",
            Io => "io",
            ModelCall => "model_call",
            HandlerPanic => "handler_panic",
        }
    }
}

impl std::fmt::Display for ToolErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur during tool execution.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{message}")]
    Failed {
        kind: ToolErrorKind,
        message: String,
    },

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Patch(#[from] PatchError),

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl ToolError {
    pub fn new(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        Self::Failed {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ToolErrorKind {
        match self {
            Self::Failed { kind, .. } => *kind,
            Self::Sandbox(e) => e.kind(),
            Self::Patch(e) => e.kind(),
            Self::Io(_) => ToolErrorKind::Io,
        }
    }

    /// Render the model-visible result.
    pub fn into_output(self) -> ToolOutput {
        let kind = self.kind();
        ToolOutput::error(kind, self.to_string())
    }
}

/// What a successful call did to the workspace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    #[default]
    None,
    Changed,
    NoOp,
}

/// Result of one tool call as shown to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolErrorKind>,
    #[serde(default)]
    pub effect: Effect,
}

impl ToolOutput {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            error: None,
            effect: Effect::None,
        }
    }

    pub fn changed(content: impl Into<String>) -> Self {
        Self {
            effect: Effect::Changed,
            ..Self::ok(content)
        }
    }

    pub fn noop(content: impl Into<String>) -> Self {
        Self {
            effect: Effect::NoOp,
            ..Self::ok(content)
        }
    }

    /// An error result; the content is prefixed with `error: ` when missing.
    pub fn error(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        let content = if message.starts_with("error:") {
            message
        } else {
            format!("error: {message}")
        };
        Self {
            content,
            error: Some(kind),
            effect: Effect::None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Size and time limits applied by the handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolLimits {
    pub read_limit: usize,
    pub max_read_bytes: u64,
    pub max_line_chars: usize,
    pub shell_default_timeout_ms: u64,
    pub shell_min_timeout_ms: u64,
    pub shell_max_timeout_ms: u64,
    pub shell_max_output_bytes: usize,
    pub max_results: usize,
}

impl Default for ToolLimits {
    fn default() -> Self {
        Self {
            read_limit: 2000,
            max_read_bytes: 250 * 1024,
            max_line_chars: 2000,
            shell_default_timeout_ms: 30_000,
            shell_min_timeout_ms: 1_000,
            shell_max_timeout_ms: 600_000,
            shell_max_output_bytes: 30_000,
            max_results: 100,
        }
    }
}

impl ToolLimits {
    pub fn with_shell_default_timeout_ms(mut self, ms: u64) -> Self {
        self.shell_default_timeout_ms = ms;
        self
    }

    pub fn with_shell_max_output_bytes(mut self, bytes: usize) -> Self {
        self.shell_max_output_bytes = bytes;
        self
    }

    pub fn with_read_limit(mut self, lines: usize) -> Self {
        self.read_limit = lines;
        self
    }
}

/// Everything a handler may touch during one call.
pub struct ToolContext<'a> {
    pub session: &'a mut SessionState,
    pub limits: &'a ToolLimits,
    /// Backend for model-call tools; `None` when unavailable.
    pub backend: Option<&'a dyn ModelBackend>,
    /// Conversation so far, for model calls that include history.
    pub history: &'a [Message],
}

/// Built-in handler implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinTool {
    Read,
    BatchRead,
    Write,
    Edit,
    ApplyPatch,
    Glob,
    Grep,
    Search,
    Ls,
    Shell,
    Finish,
}

impl BuiltinTool {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "read" => Self::Read,
            "batch_read" => Self::BatchRead,
            "write" => Self::Write,
            "edit" => Self::Edit,
            "apply_patch" => Self::ApplyPatch,
            "glob" => Self::Glob,
            "grep" => Self::Grep,
            "search" => Self::Search,
            "ls" => Self::Ls,
            "shell" => Self::Shell,
            "finish" => Self::Finish,
            _ => return None,
        })
    }
}

/// How a registered tool is executed.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerKind {
    Builtin(BuiltinTool),
    SelfCall(ModelCallSpec),
    SelfBatch(ModelCallSpec),
    Subprocess(ModelCallSpec),
}

impl HandlerKind {
    fn for_definition(def: &ToolDefinition) -> Result<Self, ConfigError> {
        if let Some(spec) = &def.model_call {
            return Ok(match spec.mode {
                ModelCallMode::SelfCall => Self::SelfCall(spec.clone()),
                ModelCallMode::SelfBatch => Self::SelfBatch(spec.clone()),
                ModelCallMode::Subprocess => Self::Subprocess(spec.clone()),
            });
        }
        BuiltinTool::from_name(def.handler_name())
            .map(Self::Builtin)
            .ok_or_else(|| ConfigError::UnknownHandler {
                tool: def.name.clone(),
                handler: def.handler_name().to_string(),
            })
    }

    /// Run the handler.
    pub async fn execute(
        &self,
        args: &Map<String, Value>,
        ctx: &mut ToolContext<'_>,
    ) -> Result<ToolOutput, ToolError> {
        match self {
            Self::Builtin(tool) => match tool {
                BuiltinTool::Read => file::read(args, ctx),
                BuiltinTool::BatchRead => file::batch_read(args, ctx),
                BuiltinTool::Write => file::write(args, ctx),
                BuiltinTool::Edit => file::edit(args, ctx),
                BuiltinTool::ApplyPatch => patch::apply(args, ctx),
                BuiltinTool::Glob => search::glob(args, ctx),
                BuiltinTool::Grep => search::grep(args, ctx),
                BuiltinTool::Search => search::search(args, ctx),
                BuiltinTool::Ls => search::ls(args, ctx),
                BuiltinTool::Shell => shell::execute(args, ctx).await,
                BuiltinTool::Finish => finish::finish(args, ctx),
            },
            Self::SelfCall(spec) => model_call::self_call(spec, args, ctx).await,
            Self::SelfBatch(spec) => model_call::self_batch(spec, args, ctx).await,
            Self::Subprocess(spec) => model_call::subprocess(spec, args).await,
        }
    }
}

/// A definition bound to its handler.
#[derive(Debug, Clone)]
pub struct RegisteredTool {
    pub definition: ToolDefinition,
    pub handler: HandlerKind,
}

/// Registry for managing available tools.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
    aliases: HashMap<String, String>,
    order: Vec<String>,
    unsupported: HashMap<String, String>,
}

impl ToolRegistry {
    /// Create a new empty tool registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the embedded built-in tools.
    pub fn try_with_builtin_tools() -> Result<Self, ConfigError> {
        Self::from_definitions(ToolDefinition::builtin()?)
    }

    /// Infallible form of [`Self::try_with_builtin_tools`] for callers that
    /// only ever use the embedded definitions.
    pub fn with_builtin_tools() -> Self {
        Self::try_with_builtin_tools().expect("embedded tool definitions are valid")
    }

    pub fn from_definitions(
        defs: impl IntoIterator<Item = ToolDefinition>,
    ) -> Result<Self, ConfigError> {
        let mut registry = Self::new();
        for def in defs {
            registry.register(def)?;
        }
        Ok(registry)
    }

    /// Register a tool and its aliases.
    pub fn register(&mut self, definition: ToolDefinition) -> Result<(), ConfigError> {
        let name = definition.name.to_lowercase();
        if self.tools.contains_key(&name) {
            return Err(ConfigError::DuplicateTool(name));
        }
        if let Some(existing) = self.aliases.get(&name) {
            return Err(ConfigError::AliasConflict {
                alias: name.clone(),
                tool: name,
                existing: existing.clone(),
            });
        }
        let handler = HandlerKind::for_definition(&definition)?;

        let mut names = definition.aliases.clone();
        if let Some(display) = &definition.display_name {
            names.push(display.clone());
        }
        for alias in names {
            let alias = alias.to_lowercase();
            if alias == name {
                continue;
            }
            let taken_by = self
                .aliases
                .get(&alias)
                .cloned()
                .or_else(|| self.tools.contains_key(&alias).then(|| alias.clone()));
            if let Some(existing) = taken_by.filter(|e| e != &name) {
                return Err(ConfigError::AliasConflict {
                    alias,
                    tool: name,
                    existing,
                });
            }
            self.aliases.insert(alias, name.clone());
        }

        self.order.push(name.clone());
        self.tools.insert(
            name,
            RegisteredTool {
                definition,
                handler,
            },
        );
        Ok(())
    }

    /// Mark a tool name as known but unavailable, with a hint for the model.
    pub fn mark_unsupported(&mut self, name: impl Into<String>, hint: impl Into<String>) {
        self.unsupported.insert(name.into().to_lowercase(), hint.into());
    }

    pub fn unsupported_hint(&self, name: &str) -> Option<&str> {
        self.unsupported.get(name).map(String::as_str)
    }

    /// Get a tool by canonical name.
    pub fn get(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.get(name)
    }

    /// Map a name or alias to the canonical tool name.
    pub fn resolve_alias(&self, name: &str) -> Option<&str> {
        if let Some((key, _)) = self.tools.get_key_value(name) {
            return Some(key.as_str());
        }
        self.aliases.get(name).map(String::as_str)
    }

    /// Canonical tool names in registration order.
    pub fn list_tools(&self) -> Vec<&str> {
        self.order.iter().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Name the model sees for `name`.
    pub fn display_name<'a>(&'a self, name: &'a str) -> &'a str {
        self.tools
            .get(name)
            .and_then(|t| t.definition.display_name.as_deref())
            .unwrap_or(name)
    }

    pub fn tools_in_category(&self, category: ToolCategory) -> Vec<&str> {
        self.order
            .iter()
            .filter(|n| {
                self.tools
                    .get(n.as_str())
                    .is_some_and(|t| t.definition.category == Some(category))
            })
            .map(String::as_str)
            .collect()
    }

    /// Function-calling schema for every tool, in registration order.
    pub fn to_json_schema(&self) -> Value {
        let tools: Vec<Value> = self
            .order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| {
                let def = &tool.definition;
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": def.display_name.as_deref().unwrap_or(&def.name),
                        "description": def.description,
                        "parameters": def.parameters_schema()
                    }
                })
            })
            .collect();

        Value::Array(tools)
    }
}

/// Argument accessors shared by the handlers. Arguments have already been
/// validated against the schema, so these only guard against absence.
pub(crate) fn str_arg<'a>(args: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

pub(crate) fn required_str<'a>(
    args: &'a Map<String, Value>,
    key: &str,
) -> Result<&'a str, ToolError> {
    str_arg(args, key).ok_or_else(|| {
        ToolError::new(
            ToolErrorKind::MissingParameter,
            format!("{key} is required"),
        )
    })
}

pub(crate) fn int_arg(args: &Map<String, Value>, key: &str) -> Option<i64> {
    args.get(key).and_then(Value::as_i64)
}

pub(crate) fn bool_arg(args: &Map<String, Value>, key: &str) -> bool {
    args.get(key).and_then(Value::as_bool).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_output_error_prefix() {
        let out = ToolOutput::error(ToolErrorKind::Io, "disk full");
        assert_eq!(out.content, "error: disk full");
        assert!(out.is_error());

        let out = ToolOutput::error(ToolErrorKind::Io, "error: already prefixed");
        assert_eq!(out.content, "error: already prefixed");
    }

    #[test]
    fn test_tool_error_kind() {
        let err = ToolError::from(SandboxError::EmptyPath);
        assert_eq!(err.kind(), ToolErrorKind::MissingParameter);
        let err = ToolError::from(PatchError::MissingBegin);
        assert_eq!(err.kind(), ToolErrorKind::InvalidPatchFormat);
        assert_eq!(
            ToolErrorKind::WriteNoop.category(),
            ErrorCategory::NoOpDetected
        );
        assert_eq!(
            serde_json::to_value(ToolErrorKind::RepeatedPatch).unwrap(),
            "repeated_patch"
        );
        assert_eq!(ToolErrorKind::RepeatedPatch.as_str(), "repeated_patch");
    }

    #[test]
    fn test_registry_with_builtin_tools() {
        let registry = ToolRegistry::with_builtin_tools();
        assert_eq!(registry.len(), 11);
        assert_eq!(registry.resolve_alias("read_file"), Some("read"));
        assert_eq!(registry.resolve_alias("bash"), Some("shell"));
        assert_eq!(registry.resolve_alias("str_replace"), Some("edit"));
        assert_eq!(registry.resolve_alias("read"), Some("read"));
        assert_eq!(registry.resolve_alias("nope"), None);
        assert_eq!(registry.list_tools()[0], "read");
    }

    #[test]
    fn test_try_with_builtin_tools() {
        let registry = ToolRegistry::try_with_builtin_tools().unwrap();
        let builtin = ToolRegistry::with_builtin_tools();
        assert_eq!(registry.list_tools(), builtin.list_tools());
    }

    #[test]
    fn test_registry_categories() {
        let registry = ToolRegistry::with_builtin_tools();
        let writes = registry.tools_in_category(ToolCategory::Write);
        assert_eq!(writes, vec!["write", "edit", "apply_patch"]);
        assert!(registry
            .tools_in_category(ToolCategory::Read)
            .contains(&"grep"));
    }

    #[test]
    fn test_registry_to_json_schema() {
        let registry = ToolRegistry::with_builtin_tools();
        let schema = registry.to_json_schema();
        let arr = schema.as_array().expect("schema should be an array");
        assert_eq!(arr.len(), 11);

        let first_tool = &arr[0];
        assert_eq!(first_tool["type"], "function");
        assert_eq!(first_tool["function"]["name"], "read");
        assert!(first_tool["function"]["parameters"].is_object());
    }

    #[test]
    fn test_alias_conflict() {
        let yaml = r#"
- name: read
  description: a
  aliases: [view]
- name: ls
  description: b
  aliases: [view]
"#;
        let defs = ToolDefinition::from_yaml(yaml).unwrap();
        let err = ToolRegistry::from_definitions(defs).unwrap_err();
        assert!(matches!(err, ConfigError::AliasConflict { ref alias, .. } if alias == "view"));
    }

    #[test]
    fn test_alias_shadowing_tool_name() {
        let yaml = r#"
- name: read
  description: a
- name: ls
  description: b
  aliases: [read]
"#;
        let defs = ToolDefinition::from_yaml(yaml).unwrap();
        assert!(ToolRegistry::from_definitions(defs).is_err());
    }

    #[test]
    fn test_unknown_handler() {
        let yaml = "- name: teleport\n  description: x\n";
        let defs = ToolDefinition::from_yaml(yaml).unwrap();
        assert!(matches!(
            ToolRegistry::from_definitions(defs),
            Err(ConfigError::UnknownHandler { .. })
        ));
    }

    #[test]
    fn test_display_name() {
        let yaml = r#"
- name: apply_patch
  description: patch
  display_name: patch_files
"#;
        let defs = ToolDefinition::from_yaml(yaml).unwrap();
        let registry = ToolRegistry::from_definitions(defs).unwrap();
        assert_eq!(registry.display_name("apply_patch"), "patch_files");
        assert_eq!(registry.resolve_alias("patch_files"), Some("apply_patch"));
        assert_eq!(
            registry.to_json_schema()[0]["function"]["name"],
            "patch_files"
        );
    }
}
