//! CLI command definitions for agent-forge.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::dispatch::Dispatcher;
use crate::llm::ToolCall;
use crate::sandbox::SandboxGuard;
use crate::session::SessionState;
use crate::tools::{Effect, ToolDefinition, ToolErrorKind, ToolLimits, ToolRegistry};

/// Sandboxed tool execution and patch engine for LLM coding agents.
#[derive(Parser)]
#[command(name = "agent-forge")]
#[command(about = "Sandboxed tool execution for LLM coding agents")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Check a shell command against the sandbox policy.
    Check(CheckArgs),

    /// Replay a JSONL file of tool calls against one session.
    #[command(name = "run-calls")]
    RunCalls(RunCallsArgs),

    /// Print the function-calling schema of the tool registry.
    Tools(ToolsArgs),
}

/// Arguments for `agent-forge check`.
#[derive(Parser, Debug)]
pub struct CheckArgs {
    /// The shell command to check.
    pub command: String,

    /// Sandbox root.
    #[arg(long, default_value = ".")]
    pub root: PathBuf,

    /// Only apply the checks that hold outside the sandbox.
    #[arg(long)]
    pub no_sandbox: bool,
}

/// Arguments for `agent-forge run-calls`.
#[derive(Parser, Debug)]
pub struct RunCallsArgs {
    /// JSONL file, one tool call per line.
    pub file: PathBuf,

    /// Sandbox root and working directory.
    #[arg(long, default_value = ".")]
    pub root: PathBuf,

    /// Disable path containment and the sandbox-only command checks.
    #[arg(long)]
    pub no_sandbox: bool,

    /// YAML file with tool definitions replacing the built-in set.
    #[arg(long, env = "AGENT_FORGE_TOOLS")]
    pub tools: Option<PathBuf>,

    /// Default shell timeout in milliseconds.
    #[arg(long)]
    pub shell_timeout_ms: Option<u64>,
}

/// Arguments for `agent-forge tools`.
#[derive(Parser, Debug)]
pub struct ToolsArgs {
    /// YAML file with tool definitions replacing the built-in set.
    #[arg(long, env = "AGENT_FORGE_TOOLS")]
    pub tools: Option<PathBuf>,
}

/// One recorded call. Accepts the wire shape
/// (`{"id", "function": {"name", "arguments"}}`) or a flat
/// `{"name", "arguments"}` object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RecordedCall {
    Wire(ToolCall),
    Flat {
        #[serde(default)]
        id: Option<String>,
        name: String,
        #[serde(default)]
        arguments: Value,
    },
}

impl RecordedCall {
    fn into_call(self, line: usize) -> ToolCall {
        match self {
            Self::Wire(call) => call,
            Self::Flat { id, name, arguments } => {
                ToolCall::new(id.unwrap_or_else(|| format!("call_{line}")), name, arguments)
            }
        }
    }
}

/// One line of `run-calls` output.
#[derive(Debug, Serialize)]
struct CallReport<'a> {
    line: usize,
    id: &'a str,
    tool: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ToolErrorKind>,
    effect: Effect,
    content: &'a str,
}

/// Parse command-line arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parse arguments and run the selected command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with already parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Check(args) => run_check_command(args),
        Commands::RunCalls(args) => run_calls_command(args).await,
        Commands::Tools(args) => run_tools_command(args),
    }
}

fn build_guard(root: &Path, no_sandbox: bool) -> anyhow::Result<SandboxGuard> {
    if no_sandbox {
        return Ok(SandboxGuard::unrestricted(root));
    }
    SandboxGuard::new(root)
        .with_context(|| format!("Failed to open sandbox root {}", root.display()))
}

fn load_registry(path: Option<&Path>) -> anyhow::Result<ToolRegistry> {
    let Some(path) = path else {
        return ToolRegistry::try_with_builtin_tools()
            .context("Failed to load built-in tool definitions");
    };
    let yaml = fs::read_to_string(path)
        .with_context(|| format!("Failed to read tool definitions from {}", path.display()))?;
    let defs = ToolDefinition::from_yaml(&yaml)?;
    let registry = ToolRegistry::from_definitions(defs)?;
    info!(path = %path.display(), tools = registry.len(), "loaded tool definitions");
    Ok(registry)
}

fn run_check_command(args: CheckArgs) -> anyhow::Result<()> {
    let guard = build_guard(&args.root, args.no_sandbox)?;
    match guard.validate_shell_command(&args.command) {
        Ok(()) => {
            println!("allowed");
            Ok(())
        }
        Err(err) => {
            warn!(command = %args.command, error = %err, "command rejected");
            anyhow::bail!("rejected: {err}")
        }
    }
}

async fn run_calls_command(args: RunCallsArgs) -> anyhow::Result<()> {
    let guard = build_guard(&args.root, args.no_sandbox)?;
    let registry = load_registry(args.tools.as_deref())?;
    let mut limits = ToolLimits::default();
    if let Some(ms) = args.shell_timeout_ms {
        limits = limits.with_shell_default_timeout_ms(ms);
    }
    let dispatcher = Dispatcher::new(registry, limits);
    let mut session = SessionState::new(guard);

    let text = fs::read_to_string(&args.file)
        .with_context(|| format!("Failed to read {}", args.file.display()))?;

    let mut errors = 0usize;
    let mut total = 0usize;
    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        if line.trim().is_empty() {
            continue;
        }
        let recorded: RecordedCall = serde_json::from_str(line)
            .with_context(|| format!("Invalid tool call on line {line_no}"))?;
        let call = recorded.into_call(line_no);

        let outcome = dispatcher.dispatch(&call, &mut session, None, &[]).await;
        total += 1;
        if outcome.is_error() {
            errors += 1;
        }
        let report = CallReport {
            line: line_no,
            id: &call.id,
            tool: &outcome.tool,
            error: outcome.error_kind(),
            effect: outcome.output.effect,
            content: &outcome.output.content,
        };
        println!("{}", serde_json::to_string(&report)?);
    }

    info!(calls = total, errors, mutations = session.mutations.len(), "replay finished");
    Ok(())
}

fn run_tools_command(args: ToolsArgs) -> anyhow::Result<()> {
    let registry = load_registry(args.tools.as_deref())?;
    println!("{}", serde_json::to_string_pretty(&registry.to_json_schema())?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_check_command() {
        let cli = Cli::try_parse_from(["agent-forge", "check", "ls -la", "--no-sandbox"]).unwrap();
        match cli.command {
            Commands::Check(args) => {
                assert_eq!(args.command, "ls -la");
                assert!(args.no_sandbox);
            }
            _ => panic!("expected check"),
        }
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_parse_run_calls() {
        let cli = Cli::try_parse_from([
            "agent-forge",
            "run-calls",
            "calls.jsonl",
            "--root",
            "/tmp/ws",
            "-l",
            "debug",
        ])
        .unwrap();
        match cli.command {
            Commands::RunCalls(args) => {
                assert_eq!(args.file, PathBuf::from("calls.jsonl"));
                assert_eq!(args.root, PathBuf::from("/tmp/ws"));
            }
            _ => panic!("expected run-calls"),
        }
        assert_eq!(cli.log_level, "debug");
    }

    #[test]
    fn test_load_registry_defaults_to_builtin_tools() {
        let registry = load_registry(None).unwrap();
        assert_eq!(registry.resolve_alias("bash"), Some("shell"));
        assert!(load_registry(Some(Path::new("/nonexistent/tools.yaml"))).is_err());
    }

    #[test]
    fn test_recorded_call_shapes() {
        let wire: RecordedCall = serde_json::from_str(
            r#"{"id":"c1","type":"function","function":{"name":"read","arguments":"{\"path\":\"a\"}"}}"#,
        )
        .unwrap();
        let call = wire.into_call(1);
        assert_eq!(call.id, "c1");
        assert_eq!(call.name(), "read");

        let flat: RecordedCall =
            serde_json::from_str(r#"{"name":"ls","arguments":{"path":"."}}"#).unwrap();
        let call = flat.into_call(4);
        assert_eq!(call.id, "call_4");
        assert_eq!(call.function.arguments["path"], ".");
    }
}
