//! Command-line interface for agent-forge.
//!
//! Operator utilities around the execution core: checking shell commands
//! against the sandbox policy, replaying recorded tool calls against a
//! workspace, and printing the tool schema.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
