//! Model backend boundary.
//!
//! The turn loop talks to a model only through [`ModelBackend`]. The HTTP
//! transport lives outside this crate; implementations translate
//! [`ModelRequest`] into whatever wire format they speak.
//!
//! ```ignore
//! use agent_forge::llm::{Message, ModelRequest, ToolChoice};
//!
//! let request = ModelRequest::new(vec![Message::user("fix the failing test")])
//!     .with_system_prompt("You are a coding agent.")
//!     .with_tools(registry.to_json_schema())
//!     .with_tool_choice(ToolChoice::Auto);
//! let response = backend.complete(request).await?;
//! ```
//!
//! Backends that leak channel framing tokens into their content can be
//! wrapped in [`harmony::HarmonyBackend`].

pub mod harmony;

pub use harmony::HarmonyBackend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::BackendError;

/// Role of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A function invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// Either a JSON-encoded string or an already structured object.
    #[serde(default)]
    pub arguments: Value,
}

/// One tool call inside an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "default_call_type")]
    pub call_type: String,
    pub function: FunctionCall,
}

fn default_call_type() -> String {
    "function".to_string()
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            call_type: default_call_type(),
            function: FunctionCall {
                name: name.into(),
                arguments,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }
}

/// A message in the agent conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
}

impl Message {
    fn with_role(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
            reasoning_content: None,
        }
    }

    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, content)
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content)
    }

    /// Create a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    /// Create an assistant message carrying tool calls.
    pub fn assistant_with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::with_role(Role::Assistant, content)
        }
    }

    /// Create the result message for one tool call.
    pub fn tool(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            name: Some(name.into()),
            ..Self::with_role(Role::Tool, content)
        }
    }

    pub fn with_reasoning(mut self, reasoning: Option<String>) -> Self {
        self.reasoning_content = reasoning;
        self
    }

    /// Approximate size used for context budgeting.
    pub fn char_len(&self) -> usize {
        let calls: usize = self
            .tool_calls
            .iter()
            .map(|c| c.function.name.len() + c.function.arguments.to_string().len())
            .sum();
        self.content.chars().count()
            + calls
            + self.reasoning_content.as_ref().map_or(0, |r| r.chars().count())
    }
}

/// Tool selection constraint for one request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ToolChoice {
    #[default]
    Auto,
    Required,
    None,
    /// The model must call exactly this tool.
    Function(String),
}

impl ToolChoice {
    /// OpenAI-style wire value.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Auto => json!("auto"),
            Self::Required => json!("required"),
            Self::None => json!("none"),
            Self::Function(name) => json!({"type": "function", "function": {"name": name}}),
        }
    }

    pub fn forced_name(&self) -> Option<&str> {
        match self {
            Self::Function(name) => Some(name),
            _ => None,
        }
    }
}

/// One request to a model backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    pub system_prompt: Option<String>,
    pub messages: Vec<Message>,
    /// Function-calling schemas, as produced by `ToolRegistry::to_json_schema`.
    pub tools: Value,
    pub tool_choice: ToolChoice,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl ModelRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            system_prompt: None,
            messages,
            tools: Value::Array(Vec::new()),
            tool_choice: ToolChoice::Auto,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_tools(mut self, tools: Value) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_tool_choice(mut self, choice: ToolChoice) -> Self {
        self.tool_choice = choice;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Token usage statistics for a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn add(&mut self, other: Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// A backend reply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub reasoning: Option<String>,
    pub usage: Usage,
    /// Set when the reply carried only analysis-channel text.
    pub analysis_only: bool,
}

impl ModelResponse {
    /// A plain text reply.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    /// A reply consisting of tool calls.
    pub fn calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::default()
        }
    }

    pub fn content_str(&self) -> &str {
        self.content.as_deref().unwrap_or_default()
    }
}

/// A model the agent can talk to.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Generate a response for the given request.
    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, BackendError>;

    /// Short name for logs.
    fn name(&self) -> &str {
        "backend"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_serialization() {
        let msg = Message::assistant_with_tool_calls(
            "",
            vec![ToolCall::new("call_1", "read", json!({"path": "a"}))],
        );
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["role"], "assistant");
        assert_eq!(value["tool_calls"][0]["type"], "function");
        assert_eq!(value["tool_calls"][0]["function"]["arguments"]["path"], "a");
        assert!(value.get("tool_call_id").is_none());

        let tool = Message::tool("call_1", "read", "ok");
        let value = serde_json::to_value(&tool).unwrap();
        assert_eq!(value["role"], "tool");
        assert_eq!(value["tool_call_id"], "call_1");

        let back: Message = serde_json::from_value(value).unwrap();
        assert_eq!(back, tool);
    }

    #[test]
    fn test_tool_call_string_arguments() {
        let raw = r#"{"id":"c","function":{"name":"ls","arguments":"{\"path\":\".\"}"}}"#;
        let call: ToolCall = serde_json::from_str(raw).unwrap();
        assert_eq!(call.call_type, "function");
        assert!(call.function.arguments.is_string());
    }

    #[test]
    fn test_tool_choice_json() {
        assert_eq!(ToolChoice::Auto.to_json(), json!("auto"));
        assert_eq!(
            ToolChoice::Function("read".into()).to_json(),
            json!({"type": "function", "function": {"name": "read"}})
        );
        assert_eq!(ToolChoice::Function("read".into()).forced_name(), Some("read"));
        assert_eq!(ToolChoice::Required.forced_name(), None);
    }

    #[test]
    fn test_char_len() {
        let msg = Message::user("héllo").with_reasoning(Some("ab".into()));
        assert_eq!(msg.char_len(), 7);
    }
}
