//! `finish` tool: records the model's own end-of-task signal.

use serde_json::{Map, Value};

use super::{str_arg, ToolContext, ToolError, ToolOutput};
use crate::session::{FinishSignal, FinishStatus};

pub fn finish(args: &Map<String, Value>, ctx: &mut ToolContext<'_>) -> Result<ToolOutput, ToolError> {
    let raw_status = str_arg(args, "status").unwrap_or("done");
    let summary = str_arg(args, "summary").unwrap_or_default().trim().to_string();
    let status = FinishStatus::parse(raw_status);

    ctx.session.set_finish(FinishSignal { status, summary });
    tracing::info!(status = status.as_str(), "finish recorded");

    let mut message = format!("ok: finish recorded ({})", status.as_str());
    if !raw_status.trim().eq_ignore_ascii_case(status.as_str()) {
        message.push_str(&format!(" (normalized from '{}')", raw_status.trim()));
    }
    Ok(ToolOutput::ok(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxGuard;
    use crate::session::SessionState;
    use crate::tools::ToolLimits;
    use serde_json::json;

    #[test]
    fn test_finish_records_signal() {
        let mut session = SessionState::new(SandboxGuard::unrestricted("."));
        let limits = ToolLimits::default();
        let mut ctx = ToolContext {
            session: &mut session,
            limits: &limits,
            backend: None,
            history: &[],
        };

        let args = json!({"status": "completed", "summary": " all good "});
        let out = finish(args.as_object().unwrap(), &mut ctx).unwrap();
        assert_eq!(
            out.content,
            "ok: finish recorded (done) (normalized from 'completed')"
        );

        let signal = session.take_finish().unwrap();
        assert_eq!(signal.status, FinishStatus::Done);
        assert_eq!(signal.summary, "all good");
    }

    #[test]
    fn test_finish_defaults_to_done() {
        let mut session = SessionState::new(SandboxGuard::unrestricted("."));
        let limits = ToolLimits::default();
        let mut ctx = ToolContext {
            session: &mut session,
            limits: &limits,
            backend: None,
            history: &[],
        };
        let out = finish(&Map::new(), &mut ctx).unwrap();
        assert_eq!(out.content, "ok: finish recorded (done)");
    }
}
