//! agent-forge: execution core for LLM coding agents.
//!
//! This library takes tool calls issued by a language model and applies them
//! to a real filesystem and shell, returning structured corrective guidance
//! so an imperfect model can converge on a working code change.
//!
//! The main pieces are:
//! - [`sandbox`]: path containment and shell-command policy checks
//! - [`session`]: per-session state (file version cache, patch hashes, no-op counters)
//! - [`patch`]: parser and applier for the multi-file patch grammar
//! - [`tools`]: tool definitions, registry and handlers
//! - [`dispatch`]: name resolution, argument repair and validation
//! - [`agent`]: the turn loop with its retry and feedback policy
//! - [`llm`]: the model backend boundary

// Core modules
pub mod agent;
pub mod cli;
pub mod dispatch;
pub mod error;
pub mod llm;
pub mod patch;
pub mod sandbox;
pub mod session;
pub mod tools;

// Re-export commonly used error types
pub use error::{BackendError, ConfigError};

// Re-export the main entry points
pub use agent::{AgentError, AgentLoop, AgentSettings, RunOutcome};
pub use dispatch::Dispatcher;
pub use llm::{Message, ModelBackend, ModelRequest, ModelResponse, ToolCall};
pub use sandbox::{SandboxError, SandboxGuard};
pub use session::SessionState;
pub use tools::{ToolDefinition, ToolErrorKind, ToolOutput, ToolRegistry};
