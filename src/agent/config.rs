//! Turn loop configuration.
//!
//! Settings come from three layers, later ones winning: [`Default`], a YAML
//! document ([`AgentSettings::from_yaml`]) and `AGENT_FORGE_*` environment
//! variables ([`AgentSettings::with_env_overrides`]).

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Settings for one agent run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Soft turn limit. Turns spent on format retries do not count; a hard
    /// cap of three times this value always applies.
    pub max_turns: usize,
    /// Tool calls required before final content is accepted.
    pub min_tool_calls: usize,
    /// Shared budget for format, analysis-only and min-tool-call retries.
    /// Code-change retries have their own counter with the same limit.
    pub max_format_retries: usize,
    /// Final content is only accepted after a confirmed file change.
    pub require_code_change: bool,
    /// Inject one forced tool call when min-tool-calls retries run out.
    pub auto_tool_call_on_failure: bool,
    /// Send `tool_choice: required` on every request.
    pub tool_choice_required: bool,
    /// Only the last N messages are sent to the backend (0 = all).
    pub history_max_messages: usize,
    /// Tool calls beyond this many per response are dropped (0 = no limit).
    pub max_batch_tool_calls: usize,
    /// Keep backend reasoning on assistant messages in the transcript.
    pub retain_reasoning: bool,
    pub max_context_chars: usize,
    pub trim_keep_last: usize,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_turns: 20,
            min_tool_calls: 0,
            max_format_retries: 2,
            require_code_change: false,
            auto_tool_call_on_failure: false,
            tool_choice_required: false,
            history_max_messages: 0,
            max_batch_tool_calls: 0,
            retain_reasoning: false,
            max_context_chars: 400_000,
            trim_keep_last: 30,
            temperature: None,
            max_tokens: None,
        }
    }
}

impl AgentSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse settings from YAML; missing keys keep their defaults.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let settings: Self = serde_yaml::from_str(yaml)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Defaults overlaid with the process environment.
    ///
    /// # Environment Variables
    ///
    /// - `AGENT_FORGE_MAX_TURNS`
    /// - `AGENT_FORGE_MIN_TOOL_CALLS`
    /// - `AGENT_FORGE_MAX_FORMAT_RETRIES`
    /// - `AGENT_FORGE_REQUIRE_CODE_CHANGE`
    /// - `AGENT_FORGE_AUTO_TOOL_CALL_ON_FAILURE`
    /// - `AGENT_FORGE_TOOL_CHOICE_REQUIRED`
    /// - `AGENT_FORGE_HISTORY_MAX_MESSAGES`
    /// - `AGENT_FORGE_MAX_BATCH_TOOL_CALLS`
    /// - `AGENT_FORGE_RETAIN_REASONING`
    /// - `AGENT_FORGE_MAX_CONTEXT_CHARS`
    /// - `AGENT_FORGE_TEMPERATURE`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(&format!("AGENT_FORGE_{name}"));

        if let Some(val) = var("MAX_TURNS") {
            self.max_turns = parse_env_value(&val, "AGENT_FORGE_MAX_TURNS")?;
        }
        if let Some(val) = var("MIN_TOOL_CALLS") {
            self.min_tool_calls = parse_env_value(&val, "AGENT_FORGE_MIN_TOOL_CALLS")?;
        }
        if let Some(val) = var("MAX_FORMAT_RETRIES") {
            self.max_format_retries = parse_env_value(&val, "AGENT_FORGE_MAX_FORMAT_RETRIES")?;
        }
        if let Some(val) = var("REQUIRE_CODE_CHANGE") {
            self.require_code_change = parse_env_bool(&val, "AGENT_FORGE_REQUIRE_CODE_CHANGE")?;
        }
        if let Some(val) = var("AUTO_TOOL_CALL_ON_FAILURE") {
            self.auto_tool_call_on_failure =
                parse_env_bool(&val, "AGENT_FORGE_AUTO_TOOL_CALL_ON_FAILURE")?;
        }
        if let Some(val) = var("TOOL_CHOICE_REQUIRED") {
            self.tool_choice_required = parse_env_bool(&val, "AGENT_FORGE_TOOL_CHOICE_REQUIRED")?;
        }
        if let Some(val) = var("HISTORY_MAX_MESSAGES") {
            self.history_max_messages =
                parse_env_value(&val, "AGENT_FORGE_HISTORY_MAX_MESSAGES")?;
        }
        if let Some(val) = var("MAX_BATCH_TOOL_CALLS") {
            self.max_batch_tool_calls =
                parse_env_value(&val, "AGENT_FORGE_MAX_BATCH_TOOL_CALLS")?;
        }
        if let Some(val) = var("RETAIN_REASONING") {
            self.retain_reasoning = parse_env_bool(&val, "AGENT_FORGE_RETAIN_REASONING")?;
        }
        if let Some(val) = var("MAX_CONTEXT_CHARS") {
            self.max_context_chars = parse_env_value(&val, "AGENT_FORGE_MAX_CONTEXT_CHARS")?;
        }
        if let Some(val) = var("TEMPERATURE") {
            self.temperature = Some(parse_env_value(&val, "AGENT_FORGE_TEMPERATURE")?);
        }

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_turns == 0 {
            return Err(invalid("max_turns", "must be greater than 0"));
        }
        if self.max_context_chars == 0 {
            return Err(invalid("max_context_chars", "must be greater than 0"));
        }
        if self.trim_keep_last == 0 {
            return Err(invalid("trim_keep_last", "must be greater than 0"));
        }
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(invalid("temperature", "must be between 0.0 and 2.0"));
            }
        }
        Ok(())
    }

    /// Hard turn cap, independent of retry accounting.
    pub fn hard_turn_limit(&self) -> usize {
        self.max_turns.saturating_mul(3)
    }

    pub fn with_max_turns(mut self, turns: usize) -> Self {
        self.max_turns = turns;
        self
    }

    pub fn with_min_tool_calls(mut self, calls: usize) -> Self {
        self.min_tool_calls = calls;
        self
    }

    pub fn with_max_format_retries(mut self, retries: usize) -> Self {
        self.max_format_retries = retries;
        self
    }

    pub fn with_require_code_change(mut self, required: bool) -> Self {
        self.require_code_change = required;
        self
    }

    pub fn with_auto_tool_call_on_failure(mut self, enabled: bool) -> Self {
        self.auto_tool_call_on_failure = enabled;
        self
    }

    pub fn with_tool_choice_required(mut self, required: bool) -> Self {
        self.tool_choice_required = required;
        self
    }

    pub fn with_history_max_messages(mut self, messages: usize) -> Self {
        self.history_max_messages = messages;
        self
    }

    pub fn with_max_batch_tool_calls(mut self, calls: usize) -> Self {
        self.max_batch_tool_calls = calls;
        self
    }

    pub fn with_retain_reasoning(mut self, retain: bool) -> Self {
        self.retain_reasoning = retain;
        self
    }

    pub fn with_max_context_chars(mut self, chars: usize) -> Self {
        self.max_context_chars = chars;
        self
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        name: key.to_string(),
        reason: format!("could not parse '{value}'"),
    })
}

fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            name: key.to_string(),
            reason: format!("expected boolean value, got '{value}'"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_settings() {
        let settings = AgentSettings::default();
        assert_eq!(settings.max_turns, 20);
        assert_eq!(settings.hard_turn_limit(), 60);
        assert_eq!(settings.max_context_chars, 400_000);
        assert_eq!(settings.trim_keep_last, 30);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_from_yaml_partial() {
        let settings = AgentSettings::from_yaml(
            "max_turns: 5\nrequire_code_change: true\nmax_batch_tool_calls: 3\n",
        )
        .unwrap();
        assert_eq!(settings.max_turns, 5);
        assert!(settings.require_code_change);
        assert_eq!(settings.max_batch_tool_calls, 3);
        assert_eq!(settings.max_format_retries, 2);

        assert!(AgentSettings::from_yaml("max_turns: 0\n").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("AGENT_FORGE_MAX_TURNS", "7"),
            ("AGENT_FORGE_REQUIRE_CODE_CHANGE", "yes"),
            ("AGENT_FORGE_TEMPERATURE", "0.5"),
        ]
        .into_iter()
        .collect();
        let settings = AgentSettings::default()
            .with_overrides_from(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(settings.max_turns, 7);
        assert!(settings.require_code_change);
        assert_eq!(settings.temperature, Some(0.5));
    }

    #[test]
    fn test_env_override_errors() {
        let err = AgentSettings::default()
            .with_overrides_from(|k| (k == "AGENT_FORGE_RETAIN_REASONING").then(|| "maybe".into()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { .. }));

        let err = AgentSettings::default()
            .with_overrides_from(|k| (k == "AGENT_FORGE_TEMPERATURE").then(|| "9".into()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
