//! The turn-based agent controller.
//!
//! [`AgentLoop`] drives one conversation: it sends the trimmed transcript to
//! the backend, dispatches the returned tool calls through the
//! [`Dispatcher`](crate::dispatch::Dispatcher), and applies the bounded
//! retry and feedback policy until the run produces final content or hits
//! a terminal condition.

pub mod budget;
pub mod config;
pub mod error;
pub mod feedback;
pub mod metrics;
pub mod trim;
mod turn_loop;

pub use budget::RetryBudget;
pub use config::AgentSettings;
pub use error::AgentError;
pub use feedback::FeedbackReason;
pub use metrics::RunMetrics;
pub use turn_loop::{select_forced_tool_call, AgentLoop, RunOutcome, StopReason};
