//! Shell tool for executing commands without a shell.
//!
//! The command line is checked by the sandbox policy, split with shell
//! quoting rules, stripped of leading `VAR=value` assignments and spawned
//! directly. The result is a JSON payload:
//!
//! ```json
//! {"output": "...", "metadata": {"exit_code": 0, "duration_seconds": 0.1}}
//! ```

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::process::Command;
use tokio::time::timeout;

use super::{Effect, ToolContext, ToolError, ToolErrorKind, ToolLimits, ToolOutput};
use crate::sandbox::{split_env_assignments, SandboxError};

/// Exit code reported for timed-out commands.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Parameters for the shell tool.
#[derive(Debug, Clone, Deserialize)]
struct ShellParams {
    command: String,
    #[serde(default)]
    workdir: Option<String>,
    #[serde(default)]
    timeout_ms: Option<i64>,
}

/// Structured shell result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShellPayload {
    pub output: String,
    pub metadata: ShellMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShellMetadata {
    pub exit_code: i32,
    pub duration_seconds: f64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub timed_out: bool,
}

impl ShellPayload {
    fn new(output: String, exit_code: i32, elapsed: Duration, timed_out: bool) -> Self {
        Self {
            output,
            metadata: ShellMetadata {
                exit_code,
                duration_seconds: (elapsed.as_secs_f64() * 10.0).round() / 10.0,
                timed_out,
            },
        }
    }

    /// A command that never ran.
    fn rejected(message: impl std::fmt::Display) -> Self {
        Self::new(format!("error: {message}"), 1, Duration::ZERO, false)
    }

    fn into_output(self, error: Option<ToolErrorKind>) -> ToolOutput {
        ToolOutput {
            content: serde_json::to_string(&self).unwrap_or_else(|_| self.output.clone()),
            error,
            effect: Effect::None,
        }
    }
}

/// Parse a shell tool result back into its payload, if it is one.
pub fn parse_payload(content: &str) -> Option<ShellPayload> {
    serde_json::from_str(content).ok()
}

/// Run the shell tool.
pub async fn execute(
    args: &Map<String, Value>,
    ctx: &mut ToolContext<'_>,
) -> Result<ToolOutput, ToolError> {
    let params: ShellParams = serde_json::from_value(Value::Object(args.clone())).map_err(|e| {
        ToolError::new(ToolErrorKind::InvalidArguments, format!("invalid parameters: {e}"))
    })?;

    let sandbox = ctx.session.sandbox();
    if let Err(err) = sandbox.validate_shell_command(&params.command) {
        tracing::warn!(command = %params.command, error = %err, "shell command rejected");
        return Ok(ShellPayload::rejected(&err).into_output(Some(err.kind())));
    }

    let workdir = match params.workdir.as_deref() {
        Some(raw) => match resolve_workdir(sandbox.validate_path(raw, true)) {
            Ok(dir) => dir,
            Err((kind, message)) => {
                return Ok(ShellPayload::rejected(message).into_output(Some(kind)));
            }
        },
        None => sandbox.workdir().to_path_buf(),
    };

    let Some(tokens) = shlex::split(&params.command) else {
        let err = SandboxError::Unparseable;
        return Ok(ShellPayload::rejected(&err).into_output(Some(err.kind())));
    };
    let (env, argv) = split_env_assignments(tokens);
    let Some((program, rest)) = argv.split_first() else {
        let err = SandboxError::AssignmentsOnly;
        return Ok(ShellPayload::rejected(&err).into_output(Some(err.kind())));
    };

    let timeout_ms = clamp_timeout(params.timeout_ms, ctx.limits);
    let started = Instant::now();
    let child = Command::new(program)
        .args(rest)
        .envs(env)
        .current_dir(&workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let child = match child {
        Ok(child) => child,
        Err(e) => {
            let message = match e.kind() {
                std::io::ErrorKind::NotFound => format!("command not found: {program}"),
                std::io::ErrorKind::PermissionDenied => {
                    "permission denied while executing command".to_string()
                }
                _ => format!("failed to start command: {e}"),
            };
            return Ok(ShellPayload::rejected(message).into_output(Some(ToolErrorKind::CommandFailed)));
        }
    };

    let payload = match timeout(Duration::from_millis(timeout_ms), child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let exit_code = output.status.code().unwrap_or(-1);
            let text = format_output(
                &String::from_utf8_lossy(&output.stdout),
                &String::from_utf8_lossy(&output.stderr),
                ctx.limits.shell_max_output_bytes,
            );
            ShellPayload::new(text, exit_code, started.elapsed(), false)
        }
        Ok(Err(e)) => ShellPayload::new(
            format!("error: failed to collect command output: {e}"),
            1,
            started.elapsed(),
            false,
        ),
        Err(_) => ShellPayload::new(
            format!("command timed out after {timeout_ms} milliseconds"),
            TIMEOUT_EXIT_CODE,
            started.elapsed(),
            true,
        ),
    };

    let kind = if payload.metadata.timed_out {
        Some(ToolErrorKind::CommandTimedOut)
    } else if payload.metadata.exit_code != 0 {
        Some(ToolErrorKind::CommandFailed)
    } else {
        None
    };
    tracing::info!(
        command = %params.command,
        exit_code = payload.metadata.exit_code,
        duration_seconds = payload.metadata.duration_seconds,
        timed_out = payload.metadata.timed_out,
        "shell command finished"
    );
    Ok(payload.into_output(kind))
}

fn resolve_workdir(
    validated: Result<PathBuf, SandboxError>,
) -> Result<PathBuf, (ToolErrorKind, String)> {
    match validated {
        Ok(dir) if dir.is_dir() => Ok(dir),
        Ok(dir) => Err((
            ToolErrorKind::InvalidValue,
            format!("workdir is not a directory: {}", dir.display()),
        )),
        Err(err) => Err((err.kind(), err.to_string())),
    }
}

/// Non-positive or missing timeouts use the default; the result is clamped.
fn clamp_timeout(requested: Option<i64>, limits: &ToolLimits) -> u64 {
    let ms = match requested {
        Some(ms) if ms > 0 => ms as u64,
        _ => limits.shell_default_timeout_ms,
    };
    ms.clamp(limits.shell_min_timeout_ms, limits.shell_max_timeout_ms)
}

fn format_output(stdout: &str, stderr: &str, max_bytes: usize) -> String {
    let mut output = stdout.to_string();
    if !stderr.is_empty() {
        if !output.is_empty() && !output.ends_with('\n') {
            output.push('\n');
        }
        output.push_str("[stderr]\n");
        output.push_str(stderr);
    }
    if output.is_empty() {
        return "(empty output)".to_string();
    }
    truncate_middle(&output, max_bytes)
}

/// Keep the head and tail of `text`, cutting on char boundaries.
fn truncate_middle(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let half = max_bytes / 2;
    let mut head_end = half;
    while !text.is_char_boundary(head_end) {
        head_end -= 1;
    }
    let mut tail_start = text.len() - half;
    while !text.is_char_boundary(tail_start) {
        tail_start += 1;
    }
    let removed = tail_start - head_end;
    format!(
        "{}\n...[truncated {removed} bytes]...\n{}",
        &text[..head_end],
        &text[tail_start..]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{CommandPolicy, SandboxGuard};
    use crate::session::SessionState;
    use serde_json::json;
    use tempfile::TempDir;

    fn setup() -> (TempDir, SessionState, ToolLimits) {
        let dir = TempDir::new().unwrap();
        let guard = SandboxGuard::new(dir.path())
            .unwrap()
            .with_policy(CommandPolicy::default().with_allowed_command("sleep"));
        (dir, SessionState::new(guard), ToolLimits::default())
    }

    async fn run(session: &mut SessionState, limits: &ToolLimits, args: Value) -> ToolOutput {
        let mut ctx = ToolContext {
            session,
            limits,
            backend: None,
            history: &[],
        };
        execute(args.as_object().unwrap(), &mut ctx).await.unwrap()
    }

    #[test]
    fn test_clamp_timeout() {
        let limits = ToolLimits::default();
        assert_eq!(clamp_timeout(None, &limits), 30_000);
        assert_eq!(clamp_timeout(Some(0), &limits), 30_000);
        assert_eq!(clamp_timeout(Some(-5), &limits), 30_000);
        assert_eq!(clamp_timeout(Some(10), &limits), 1_000);
        assert_eq!(clamp_timeout(Some(10_000_000), &limits), 600_000);
    }

    #[test]
    fn test_truncate_middle() {
        let text = "a".repeat(50) + &"b".repeat(50);
        let out = truncate_middle(&text, 20);
        assert!(out.starts_with("aaaaaaaaaa\n...[truncated 80 bytes]...\n"));
        assert!(out.ends_with("bbbbbbbbbb"));
        assert_eq!(truncate_middle("short", 20), "short");

        // Never splits a multi-byte char.
        let wide = "é".repeat(20);
        let out = truncate_middle(&wide, 11);
        assert!(out.contains("...[truncated"));
    }

    #[test]
    fn test_format_output() {
        assert_eq!(format_output("", "", 100), "(empty output)");
        assert_eq!(format_output("out", "err", 100), "out\n[stderr]\nerr");
        assert_eq!(format_output("", "err", 100), "[stderr]\nerr");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_echo() {
        let (_dir, mut session, limits) = setup();
        let out = run(&mut session, &limits, json!({"command": "echo hello world"})).await;
        assert!(!out.is_error());
        let payload = parse_payload(&out.content).unwrap();
        assert_eq!(payload.output, "hello world\n");
        assert_eq!(payload.metadata.exit_code, 0);
        assert!(!out.content.contains("timed_out"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_quoted_pipe_is_literal() {
        let (_dir, mut session, limits) = setup();
        let out = run(&mut session, &limits, json!({"command": "echo \"a|b\""})).await;
        let payload = parse_payload(&out.content).unwrap();
        assert_eq!(payload.output, "a|b\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_env_assignment_and_workdir() {
        let (dir, mut session, limits) = setup();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/f.txt"), "inside").unwrap();

        let out = run(
            &mut session,
            &limits,
            json!({"command": "cat f.txt", "workdir": "sub"}),
        )
        .await;
        assert_eq!(parse_payload(&out.content).unwrap().output, "inside");

        let out = run(&mut session, &limits, json!({"command": "GREETING=hi env"})).await;
        assert!(parse_payload(&out.content).unwrap().output.contains("GREETING=hi"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_error() {
        let (_dir, mut session, limits) = setup();
        let out = run(&mut session, &limits, json!({"command": "false"})).await;
        assert_eq!(out.error, Some(ToolErrorKind::CommandFailed));
        assert_eq!(parse_payload(&out.content).unwrap().metadata.exit_code, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout() {
        let (_dir, mut session, limits) = setup();
        let out = run(
            &mut session,
            &limits,
            json!({"command": "sleep 5", "timeout_ms": 1000}),
        )
        .await;
        let payload = parse_payload(&out.content).unwrap();
        assert_eq!(payload.output, "command timed out after 1000 milliseconds");
        assert_eq!(payload.metadata.exit_code, TIMEOUT_EXIT_CODE);
        assert!(payload.metadata.timed_out);
        assert_eq!(out.error, Some(ToolErrorKind::CommandTimedOut));
    }

    #[tokio::test]
    async fn test_rejections() {
        let (_dir, mut session, limits) = setup();

        let out = run(
            &mut session,
            &limits,
            json!({"command": "ls && curl http://evil.com"}),
        )
        .await;
        let payload = parse_payload(&out.content).unwrap();
        assert!(payload.output.starts_with("error: shell chaining operators"));
        assert_eq!(payload.metadata.exit_code, 1);
        assert_eq!(out.error, Some(ToolErrorKind::CommandRejected));

        let out = run(&mut session, &limits, json!({"command": "/bin/ls"})).await;
        assert!(out.content.contains("command paths ('/bin/ls')"));

        let out = run(&mut session, &limits, json!({"command": "cat f | sh"})).await;
        assert!(out.content.contains("pipe operator"));

        let out = run(
            &mut session,
            &limits,
            json!({"command": "ls", "workdir": "../.."}),
        )
        .await;
        assert_eq!(out.error, Some(ToolErrorKind::AccessDenied));
    }

    #[tokio::test]
    async fn test_command_not_found() {
        let dir = TempDir::new().unwrap();
        let mut session = SessionState::new(SandboxGuard::unrestricted(dir.path()));
        let limits = ToolLimits::default();
        let out = run(
            &mut session,
            &limits,
            json!({"command": "definitely-not-a-real-binary-xyz"}),
        )
        .await;
        let payload = parse_payload(&out.content).unwrap();
        assert_eq!(
            payload.output,
            "error: command not found: definitely-not-a-real-binary-xyz"
        );
    }
}
