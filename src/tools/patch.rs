//! `apply_patch` tool: thin wrapper over the patch engine.

use serde_json::{Map, Value};

use super::{required_str, ToolContext, ToolError, ToolOutput};
use crate::patch::apply_patch;

pub fn apply(args: &Map<String, Value>, ctx: &mut ToolContext<'_>) -> Result<ToolOutput, ToolError> {
    let text = required_str(args, "patch")?;
    match apply_patch(ctx.session, text) {
        Ok(summary) => Ok(ToolOutput::changed(summary.to_string())),
        Err(failure) => {
            tracing::info!(
                kind = %failure.error.kind(),
                applied = failure.applied.len(),
                "patch rejected"
            );
            Ok(ToolOutput::error(failure.error.kind(), failure.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxGuard;
    use crate::session::SessionState;
    use crate::tools::{Effect, ToolErrorKind, ToolLimits};
    use serde_json::json;
    use tempfile::TempDir;

    fn run(session: &mut SessionState, patch: &str) -> ToolOutput {
        let limits = ToolLimits::default();
        let mut ctx = ToolContext {
            session,
            limits: &limits,
            backend: None,
            history: &[],
        };
        let args = json!({ "patch": patch });
        apply(args.as_object().unwrap(), &mut ctx).unwrap()
    }

    #[test]
    fn test_success_is_change() {
        let dir = TempDir::new().unwrap();
        let mut session = SessionState::new(SandboxGuard::new(dir.path()).unwrap());
        let out = run(
            &mut session,
            "*** Begin Patch\n*** Add File: a.txt\n+hi\n*** End Patch",
        );
        assert_eq!(out.content, "ok: 1 file(s) changed, +1 -0");
        assert_eq!(out.effect, Effect::Changed);
    }

    #[test]
    fn test_failure_is_typed_error() {
        let dir = TempDir::new().unwrap();
        let mut session = SessionState::new(SandboxGuard::new(dir.path()).unwrap());
        let out = run(&mut session, "*** Update File: a.txt\n*** End Patch");
        assert_eq!(
            out.content,
            "error: invalid patch format (missing Begin Patch)"
        );
        assert_eq!(out.error, Some(ToolErrorKind::InvalidPatchFormat));
    }
}
