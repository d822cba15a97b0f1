//! Declarative tool definitions.
//!
//! Tools are described in YAML (name, description, parameters, aliases,
//! category, feedback templates, optional model-call block) and turned into
//! a [`ToolRegistry`](super::ToolRegistry) at startup. The built-in set ships
//! embedded in the binary.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::ConfigError;

const BUILTIN_TOOLS_YAML: &str = include_str!("builtin_tools.yaml");

/// Declared JSON type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Integer | Self::Number)
    }

    /// Whether `value` satisfies this type. Booleans are never numbers.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }
}

/// One declared parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub minimum: Option<f64>,
    #[serde(default)]
    pub maximum: Option<f64>,
    /// Synonyms accepted in place of `name`.
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl ParamSpec {
    fn to_json_schema(&self) -> Value {
        let mut prop = Map::new();
        prop.insert("type".into(), json!(self.param_type.as_str()));
        if let Some(description) = &self.description {
            prop.insert("description".into(), json!(description));
        }
        if let Some(default) = &self.default {
            prop.insert("default".into(), default.clone());
        }
        if let Some(minimum) = self.minimum {
            prop.insert("minimum".into(), json!(minimum));
        }
        if let Some(maximum) = self.maximum {
            prop.insert("maximum".into(), json!(maximum));
        }
        match self.param_type {
            ParamType::Array => {
                prop.insert("items".into(), json!({ "type": "string" }));
            }
            ParamType::Object => {
                prop.insert("additionalProperties".into(), json!(true));
            }
            _ => {}
        }
        Value::Object(prop)
    }
}

/// Whether a tool observes or modifies the workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCategory {
    Read,
    Write,
}

/// How a model-call tool reaches a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelCallMode {
    /// One side-call to the same backend.
    #[serde(rename = "self")]
    SelfCall,
    /// Several independent side-calls, run concurrently, fail-all.
    SelfBatch,
    /// A separate agent process.
    Subprocess,
}

/// Configuration of a tool that delegates to a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCallSpec {
    pub mode: ModelCallMode,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Argument holding the prompt (or the question list for batches).
    #[serde(default = "default_prompt_param")]
    pub prompt_param: String,
    #[serde(default)]
    pub include_history: bool,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_max_questions")]
    pub max_questions: usize,
    /// Program and leading arguments for subprocess mode; the prompt is appended.
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default = "default_subprocess_timeout")]
    pub timeout_secs: u64,
}

fn default_prompt_param() -> String {
    "prompt".to_string()
}

fn default_max_concurrent() -> usize {
    4
}

fn default_max_questions() -> usize {
    10
}

fn default_subprocess_timeout() -> u64 {
    600
}

/// Declarative description of one tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub parameters: Vec<ParamSpec>,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub category: Option<ToolCategory>,
    /// Name shown to the model instead of `name`.
    #[serde(default)]
    pub display_name: Option<String>,
    /// Built-in handler to use; defaults to `name`.
    #[serde(default)]
    pub handler: Option<String>,
    /// Per-failure-reason feedback templates (`{{target}}`, `{{tool:name}}`).
    #[serde(default)]
    pub feedback: HashMap<String, String>,
    #[serde(default)]
    pub model_call: Option<ModelCallSpec>,
}

impl ToolDefinition {
    /// Parse a YAML list of tool definitions.
    pub fn from_yaml(yaml: &str) -> Result<Vec<Self>, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// The definitions shipped with the crate.
    pub fn builtin() -> Result<Vec<Self>, ConfigError> {
        Self::from_yaml(BUILTIN_TOOLS_YAML)
    }

    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Canonical parameter name for `key` (itself or a declared synonym).
    pub fn canonical_param(&self, key: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|p| p.name == key || p.aliases.iter().any(|a| a == key))
            .map(|p| p.name.as_str())
    }

    pub fn required_params(&self) -> impl Iterator<Item = &ParamSpec> {
        self.parameters.iter().filter(|p| !p.optional)
    }

    pub fn handler_name(&self) -> &str {
        self.handler.as_deref().unwrap_or(&self.name)
    }

    /// Parameter schema in JSON-schema form.
    pub fn parameters_schema(&self) -> Value {
        let properties: Map<String, Value> = self
            .parameters
            .iter()
            .map(|p| (p.name.clone(), p.to_json_schema()))
            .collect();
        let required: Vec<&str> = self.required_params().map(|p| p.name.as_str()).collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false,
        })
    }

    /// A short example call listing required parameters, for error messages.
    pub fn example_call(&self, display: &str) -> String {
        let args: Map<String, Value> = self
            .required_params()
            .map(|p| {
                let placeholder = match p.param_type {
                    ParamType::String => json!("..."),
                    ParamType::Integer | ParamType::Number => json!(1),
                    ParamType::Boolean => json!(true),
                    ParamType::Array => json!(["..."]),
                    ParamType::Object => json!({}),
                };
                (p.name.clone(), placeholder)
            })
            .collect();
        format!("{display}({})", Value::Object(args))
    }
}
