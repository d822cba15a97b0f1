//! Corrective feedback for tool failures.
//!
//! A failed call is classified into a [`FeedbackReason`] from its tool name
//! and [`ToolErrorKind`]. The reason selects a message: the tool
//! definition's own template when it declares one, otherwise the built-in
//! text below. The turn loop stops dispatching on the first classified
//! failure and appends the message as a user turn.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::tools::{ToolErrorKind, ToolRegistry};

/// Why corrective feedback was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackReason {
    UnknownToolName,
    PatchContextNotFound,
    PatchContextNotUnique,
    MustReadBeforePatching,
    InvalidPatchFormat,
    UnexpectedPatchLine,
    InvalidAddLine,
    PatchNoop,
    PatchRepeated,
    PatchFileNotFound,
    MustReadBeforeEditing,
    OldStringNotFound,
    OldStringNotUnique,
    OldEqualsNew,
    WriteNoop,
    WriteRepeatedNoop,
    WriteMissingContent,
    ReadIsDirectory,
    ReadFileNotFound,
    InvalidRegex,
    SearchPathMissing,
    LsPathMissing,
    GlobPathMissing,
    /// `finish` was called while a required change is still missing.
    FinishBeforeChange,
}

impl FeedbackReason {
    /// Match a failed call against the rule table.
    pub fn classify(tool: &str, kind: ToolErrorKind, content: &str) -> Option<Self> {
        use ToolErrorKind as K;

        if kind == K::UnknownTool {
            return Some(Self::UnknownToolName);
        }
        let reason = match (tool, kind) {
            ("apply_patch", K::ContextNotFound) => Self::PatchContextNotFound,
            ("apply_patch", K::ContextNotUnique) => Self::PatchContextNotUnique,
            ("apply_patch", K::MustReadFirst) => Self::MustReadBeforePatching,
            ("apply_patch", K::InvalidPatchFormat) => Self::InvalidPatchFormat,
            ("apply_patch", K::UnexpectedPatchLine) => Self::UnexpectedPatchLine,
            ("apply_patch", K::InvalidAddLine) => Self::InvalidAddLine,
            ("apply_patch", K::PatchNoop) => Self::PatchNoop,
            ("apply_patch", K::RepeatedPatch) => Self::PatchRepeated,
            ("apply_patch", K::PathNotFound) => Self::PatchFileNotFound,
            ("edit", K::MustReadFirst) => Self::MustReadBeforeEditing,
            ("edit", K::OldNotFound) => Self::OldStringNotFound,
            ("edit", K::OldNotUnique) => Self::OldStringNotUnique,
            ("edit", K::OldEqualsNew) => Self::OldEqualsNew,
            ("write", K::WriteNoop) => Self::WriteNoop,
            ("write", K::WriteRepeatedNoop) => Self::WriteRepeatedNoop,
            ("write", K::MissingParameter) if content.contains("content") => {
                Self::WriteMissingContent
            }
            ("read", K::IsADirectory) => Self::ReadIsDirectory,
            ("read", K::PathNotFound) => Self::ReadFileNotFound,
            ("grep" | "search", K::InvalidRegex) => Self::InvalidRegex,
            ("grep" | "search", K::PathNotFound) => Self::SearchPathMissing,
            ("ls", K::PathNotFound) => Self::LsPathMissing,
            ("glob", K::PathNotFound) => Self::GlobPathMissing,
            _ => return None,
        };
        Some(reason)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownToolName => "unknown_tool_name",
            Self::PatchContextNotFound => "patch_context_not_found",
            Self::PatchContextNotUnique => "patch_context_not_unique",
            Self::MustReadBeforePatching => "must_read_before_patching",
            Self::InvalidPatchFormat => "invalid_patch_format",
            Self::UnexpectedPatchLine => "unexpected_patch_line",
            Self::InvalidAddLine => "invalid_add_line",
            Self::PatchNoop => "patch_noop",
            Self::PatchRepeated => "patch_repeated",
            Self::PatchFileNotFound => "patch_file_not_found",
            Self::MustReadBeforeEditing => "must_read_before_editing",
            Self::OldStringNotFound => "old_string_not_found",
            Self::OldStringNotUnique => "old_string_not_unique",
            Self::OldEqualsNew => "old_equals_new",
            Self::WriteNoop => "write_noop",
            Self::WriteRepeatedNoop => "write_repeated_noop",
            Self::WriteMissingContent => "write_missing_content",
            Self::ReadIsDirectory => "read_is_directory",
            Self::ReadFileNotFound => "read_file_not_found",
            Self::InvalidRegex => "invalid_regex",
            Self::SearchPathMissing => "search_path_missing",
            Self::LsPathMissing => "ls_path_missing",
            Self::GlobPathMissing => "glob_path_missing",
            Self::FinishBeforeChange => "code_change_required_before_finish",
        }
    }
}

impl std::fmt::Display for FeedbackReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Facts about the failed call that the messages refer to.
#[derive(Debug, Clone, Copy)]
pub struct FeedbackInput<'a> {
    pub reason: FeedbackReason,
    /// Canonical tool name.
    pub tool: &'a str,
    /// Name the model used.
    pub raw_name: &'a str,
    /// File path involved, when known.
    pub path: Option<&'a str>,
    /// Consecutive patch failures on `path`, including this one.
    pub patch_failures: u32,
}

fn tool_placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{tool:([A-Za-z0-9_]+)\}\}").expect("static regex"))
}

/// Replace `{{tool:NAME}}` with display names and `{{target}}` with `target`.
pub fn render_template(template: &str, registry: &ToolRegistry, target: &str) -> String {
    let rendered = tool_placeholder_re().replace_all(template, |caps: &regex::Captures| {
        registry.display_name(&caps[1]).to_string()
    });
    rendered.replace("{{target}}", target)
}

/// Build the feedback message for one failure (without escalation).
pub fn build_feedback(registry: &ToolRegistry, input: &FeedbackInput<'_>) -> String {
    let dn = |name: &'static str| registry.display_name(name).to_string();
    let target = describe_target(input);

    let template = registry
        .get(input.tool)
        .and_then(|t| t.definition.feedback.get(input.reason.as_str()));
    if let Some(template) = template {
        return render_template(template, registry, &target);
    }

    let (read, edit, write, patch) = (dn("read"), dn("edit"), dn("write"), dn("apply_patch"));
    let (ls, glob) = (dn("ls"), dn("glob"));
    let this = registry.display_name(input.tool).to_string();

    match input.reason {
        FeedbackReason::UnknownToolName => {
            let attempted = input.raw_name.trim().to_lowercase();
            let mut text = format!(
                "FORMAT ERROR: unknown tool name was called.\n\
                 ACTION: use only available tools shown in the error.\n\
                 Common choices: {read}, {write}, {edit}, {patch}, {}.\n\
                 Do not retry the same unknown tool name.",
                dn("finish")
            );
            if matches!(attempted.as_str(), "run" | "exec" | "execute" | "cmd") {
                text.push_str(&format!(
                    "\nIf you wanted to inspect code, use {read}/{}/{}. There is no run/exec tool.",
                    dn("grep"),
                    dn("search")
                ));
            }
            text
        }
        FeedbackReason::PatchContextNotFound => {
            let mut text = format!(
                "FORMAT ERROR: {patch} failed: patch context not found.\n\
                 ACTION: Call {read}(path) for {target} (use {read}, NOT grep/search), then retry {patch} using the CURRENT content with exact context lines.\n\
                 Do NOT repeat the same patch."
            );
            if input.patch_failures >= 2 {
                text.push_str(&format!(
                    "\nSECOND FAILURE on same file ({}): STOP patching; re-read and switch to {edit} or {write}.",
                    input.path.unwrap_or("?")
                ));
            }
            text
        }
        FeedbackReason::PatchContextNotUnique => format!(
            "FORMAT ERROR: {patch} failed: patch context not unique.\n\
             ACTION: Call {read}(path) for {target}, then retry {patch} with MORE unique context lines, \
             OR switch to {edit} / {write} if the file is small."
        ),
        FeedbackReason::MustReadBeforePatching => format!(
            "FORMAT ERROR: {patch} requires the file to be read first.\n\
             ACTION: Call {read}(path) for {target} (use {read}, NOT grep/search), then retry {patch}."
        ),
        FeedbackReason::InvalidPatchFormat => format!(
            "FORMAT ERROR: {patch} failed: invalid patch format.\n\
             ACTION: Provide a COMPLETE patch with *** Begin Patch and *** End Patch markers and valid context lines. \
             Re-read the target file and retry {patch}."
        ),
        FeedbackReason::UnexpectedPatchLine => format!(
            "FORMAT ERROR: {patch} failed: unexpected patch line.\n\
             ACTION: Ensure each line starts with ' ', '+', or '-' and include a valid @@ context header. \
             Re-read the target file and retry {patch}."
        ),
        FeedbackReason::InvalidAddLine => format!(
            "FORMAT ERROR: {patch} failed: invalid add line.\n\
             ACTION: Lines being added must start with '+'. Re-read the target file and retry {patch}."
        ),
        FeedbackReason::PatchNoop => format!(
            "FORMAT ERROR: {patch} applied but made NO changes to the file (no-op).\n\
             The file content is identical before and after your patch.\n\
             ACTION:\n\
             1. Call {read}(path) to see current content\n\
             2. Create a NEW {patch} that actually changes content\n\
             3. Or switch to {edit}/{write}\n\
             Do NOT repeat the same patch."
        ),
        FeedbackReason::PatchRepeated => format!(
            "FORMAT ERROR: You submitted the exact same patch text again.\n\
             This will loop forever.\n\
             ACTION: {read}(path), then create a DIFFERENT {patch} or use {edit}/{write}."
        ),
        FeedbackReason::PatchFileNotFound => format!(
            "FORMAT ERROR: {patch} failed: file not found in patch header.\n\
             ACTION: Use {ls}(path) or {glob}(pat, path) to locate the correct file path, \
             then retry {patch} with the correct '*** Update File:' path."
        ),
        FeedbackReason::MustReadBeforeEditing => format!(
            "FORMAT ERROR: {edit} requires the file to be read first.\n\
             ACTION: Call {read}(path) for {target} (use {read}, NOT grep/search), then retry {edit}."
        ),
        FeedbackReason::OldStringNotFound => format!(
            "FORMAT ERROR: {edit} failed: old_string not found.\n\
             ACTION: Call {read}(path) for {target} (use {read}, NOT grep/search), then retry with an EXACT substring (including whitespace), \
             OR switch to {patch} with exact context."
        ),
        FeedbackReason::OldStringNotUnique => format!(
            "FORMAT ERROR: {edit} failed: old_string is not unique.\n\
             ACTION: Call {read}(path) for {target} (use {read}, NOT grep/search), then retry with an exact unique substring, \
             OR set all=true if you intend to replace all occurrences."
        ),
        FeedbackReason::OldEqualsNew => format!(
            "ERROR: {edit} called with old identical to new; no change would occur.\n\
             ACTION:\n\
             1. Re-read the file with {read}({target})\n\
             2. Identify the EXACT text you want to CHANGE (old)\n\
             3. Write the MODIFIED version (new); it must be DIFFERENT from old\n\
             4. If the file already has correct content, the task may be complete; verify and move on.\n\
             TIP: For small files, consider using {write} to rewrite the entire file."
        ),
        FeedbackReason::WriteNoop => format!(
            "FORMAT ERROR: {write} wrote identical content (no-op).\n\
             ACTION: {read}(path) (optionally diff=true), then {write} with DIFFERENT content, \
             or use {edit} for a targeted change. If already correct, call {}.",
            dn("finish")
        ),
        FeedbackReason::WriteRepeatedNoop => format!(
            "LOOP GUARD: repeated no-op {write} calls detected.\n\
             ACTION:\n\
             1. Call {read} on {} (use diff=true if available).\n\
             2. Change strategy: use {edit} or substantially different {write} content.\n\
             3. If implementation is already correct, call {}.\n\
             Do NOT repeat the same write again.",
            input.path.unwrap_or("the same file path"),
            dn("finish")
        ),
        FeedbackReason::WriteMissingContent => format!(
            "FORMAT ERROR: {write} requires both path and content.\n\
             ACTION: call {write} with a complete JSON object containing both fields.\n\
             If this was an accidental duplicate call after a successful write, skip it and continue."
        ),
        FeedbackReason::ReadIsDirectory => format!(
            "FORMAT ERROR: {read} failed: path is a directory.\n\
             ACTION: Use {ls}(path) to list files, then call {read} on a file path."
        ),
        FeedbackReason::ReadFileNotFound => format!(
            "FORMAT ERROR: {read} failed: file not found.\n\
             ACTION: Use {ls}(path) or {glob}(pat, path) to locate the correct file, then call {read} with the valid path."
        ),
        FeedbackReason::InvalidRegex => format!(
            "FORMAT ERROR: {this} failed: invalid regex.\n\
             ACTION: If you want literal text, set literal_text=true. Otherwise escape regex metacharacters and retry {this}."
        ),
        FeedbackReason::SearchPathMissing => format!(
            "FORMAT ERROR: {this} failed: path does not exist.\n\
             ACTION: Use {ls}(path) or {glob}(pat, path) to find the correct path, then retry {this}."
        ),
        FeedbackReason::LsPathMissing => format!(
            "FORMAT ERROR: {ls} failed: path does not exist.\n\
             ACTION: Use {ls} with a valid path (e.g. '.') or use {glob}(pat, path) to discover files."
        ),
        FeedbackReason::GlobPathMissing => format!(
            "FORMAT ERROR: {glob} failed: path does not exist.\n\
             ACTION: Use {ls}(path) to verify directories, then retry {glob} with a valid path."
        ),
        FeedbackReason::FinishBeforeChange => format!(
            "FORMAT ERROR: {} called before any confirmed code change.\n\
             ACTION: Use {write}/{edit}/{patch} to make the required change, then call {}.",
            dn("finish"),
            dn("finish")
        ),
    }
}

fn describe_target(input: &FeedbackInput<'_>) -> String {
    let action = match input.tool {
        "apply_patch" => "patch",
        "edit" => "edit",
        "write" => "write",
        _ => "read",
    };
    match input.path {
        Some(path) if !path.is_empty() => {
            format!("the SAME path you attempted to {action}: {path}")
        }
        _ if input.tool == "apply_patch" => {
            "the file named in the patch header line: '*** Update File: <path>'".to_string()
        }
        _ => format!(
            "the SAME path you attempted to {action} (use the 'path' argument from your tool call)"
        ),
    }
}

/// Append ` (attempt N)` to the first line.
pub fn with_attempt(text: &str, attempt: u32) -> String {
    match text.split_once('\n') {
        Some((first, rest)) => format!("{first} (attempt {attempt})\n{rest}"),
        None => format!("{text} (attempt {attempt})"),
    }
}

/// Extra guidance after the model repeats an unknown tool name.
pub fn strict_unknown_tool_suffix(registry: &ToolRegistry) -> String {
    let mut names: Vec<&str> = registry
        .list_tools()
        .into_iter()
        .map(|n| registry.display_name(n))
        .collect();
    names.sort_unstable();
    format!(
        "\nSTRICT ACTION: you repeated an unknown tool name. \
         Next response must be exactly one valid tool call.\n\
         Allowed tools: {}",
        names.join(", ")
    )
}

/// First file path named in a patch document.
pub fn patch_file(patch: &str) -> Option<&str> {
    patch.lines().find_map(|line| {
        ["*** Update File:", "*** Add File:", "*** Delete File:"]
            .iter()
            .find_map(|marker| line.trim().strip_prefix(marker))
            .map(str::trim)
            .filter(|p| !p.is_empty())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(reason: FeedbackReason, tool: &'static str) -> FeedbackInput<'static> {
        FeedbackInput {
            reason,
            tool,
            raw_name: tool,
            path: Some("src/lib.rs"),
            patch_failures: 1,
        }
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            FeedbackReason::classify("anything", ToolErrorKind::UnknownTool, ""),
            Some(FeedbackReason::UnknownToolName)
        );
        assert_eq!(
            FeedbackReason::classify("apply_patch", ToolErrorKind::RepeatedPatch, ""),
            Some(FeedbackReason::PatchRepeated)
        );
        assert_eq!(
            FeedbackReason::classify("edit", ToolErrorKind::MustReadFirst, ""),
            Some(FeedbackReason::MustReadBeforeEditing)
        );
        assert_eq!(
            FeedbackReason::classify(
                "write",
                ToolErrorKind::MissingParameter,
                "error: missing required parameter(s) for tool 'write': content"
            ),
            Some(FeedbackReason::WriteMissingContent)
        );
        assert_eq!(
            FeedbackReason::classify("shell", ToolErrorKind::CommandFailed, ""),
            None
        );
    }

    #[test]
    fn test_builtin_message_and_second_failure() {
        let registry = ToolRegistry::with_builtin_tools();
        let mut inp = input(FeedbackReason::PatchContextNotFound, "apply_patch");
        let text = build_feedback(&registry, &inp);
        assert!(text.starts_with("FORMAT ERROR: apply_patch failed: patch context not found."));
        assert!(text.contains("the SAME path you attempted to patch: src/lib.rs"));
        assert!(!text.contains("SECOND FAILURE"));

        inp.patch_failures = 2;
        let text = build_feedback(&registry, &inp);
        assert!(text.contains("SECOND FAILURE on same file (src/lib.rs)"));
    }

    #[test]
    fn test_definition_template_wins() {
        let registry = ToolRegistry::with_builtin_tools();
        let text = build_feedback(&registry, &input(FeedbackReason::ReadFileNotFound, "read"));
        assert!(text.starts_with("FORMAT ERROR: read failed: file not found."));
        assert!(text.contains("the SAME path you attempted to read: src/lib.rs does not exist"));
        assert!(text.contains("Use ls or glob"));
    }

    #[test]
    fn test_with_attempt() {
        assert_eq!(with_attempt("one line", 2), "one line (attempt 2)");
        assert_eq!(with_attempt("first\nsecond", 3), "first (attempt 3)\nsecond");
    }

    #[test]
    fn test_strict_suffix_lists_tools() {
        let registry = ToolRegistry::with_builtin_tools();
        let suffix = strict_unknown_tool_suffix(&registry);
        assert!(suffix.contains("Allowed tools: apply_patch, batch_read, edit"));
    }

    #[test]
    fn test_patch_file() {
        let patch = "*** Begin Patch\n*** Update File: src/a.rs\n@@\n-x\n+y\n*** End Patch";
        assert_eq!(patch_file(patch), Some("src/a.rs"));
        assert_eq!(patch_file("*** Begin Patch\n*** End Patch"), None);
    }
}
