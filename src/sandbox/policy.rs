//! Shell command policy: dangerous patterns, chaining, allowlist and token checks.
//!
//! The tables here are an extensible, best-effort list. Commands that pass are
//! still executed without a shell (direct argv), which is what actually keeps
//! operators like `|` and `;` inert.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

use super::SandboxError;

/// Patterns that are always rejected, sandboxed or not.
const DANGEROUS_PATTERNS: &[&str] = &[
    r"rm\s+(-[rf]+\s+)*(/|~|\$HOME|/\*)",
    r"rm\s+.*\s+(/etc|/usr|/bin|/lib|/boot|/var|/sys|/proc)",
    r"(mv|cp)\s+.*\s+(/etc|/usr|/bin|/lib|/boot)/",
    r"dd\s+.*of=/dev/",
    r"mkfs\.",
    r"^\s*sudo\s+",
    r"^\s*su\s+",
    r"chmod\s+(-R\s+)?(777|666)\s+/",
    r";\s*(rm|mv|dd|mkfs|sudo|su)\s+",
    r"\|\s*(rm|mv|dd|mkfs|sudo|su)\s+",
    r":\(\)\s*\{",
    r"(curl|wget).*\|\s*(ba)?sh",
    r"(?:\d\s*)?>{1,2}\s*/(?:etc|usr|bin|lib|boot|var|sys|proc)/",
    r"tee\b.*\s+/(?:etc|usr|bin|lib|boot)/",
];

/// Binaries permitted as the first command token in sandbox mode.
const ALLOWED_COMMANDS: &[&str] = &[
    // Language runtimes (inline code flags are checked separately)
    "python", "python3", "python3.8", "python3.9", "python3.10", "python3.11", "python3.12",
    "python3.13", "python3.14", "node",
    // Core utilities
    "ls", "cat", "head", "tail", "wc", "sort", "uniq", "tr", "cut", "tee", "echo", "printf",
    "true", "false", "test", "expr", "cp", "mv", "mkdir", "touch", "chmod", "dirname",
    "basename", "realpath", "find", "xargs",
    // Search / diff
    "grep", "egrep", "fgrep", "rg", "ag", "sed", "awk", "diff", "patch",
    // Build / package
    "git", "npm", "npx", "yarn", "pnpm", "pip", "pip3", "cargo", "make", "go", "rustc", "javac",
    "java", "gcc", "g++", "clang", "clang++",
    // Other common
    "env", "which", "file", "stat", "du", "df", "uname", "date", "whoami",
];

fn chaining_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(;|&&|\|\||`|\n|\r|\$\(|(^|\s)\.\./)").expect("valid chaining regex")
    })
}

fn leading_cd_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*cd\b").expect("valid cd regex"))
}

fn inline_code_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(concat!(
            r"(?i)(?:^|\s)(?:",
            r"python[0-9.]*\s+-[a-zA-Z]*c",
            r"|node\s+(?:-e|--eval|-p|--print)",
            r"|perl\s+-[a-zA-Z]*e",
            r"|ruby\s+-[a-zA-Z]*e",
            r"|(?:sh|bash|zsh)\s+-c",
            r")"
        ))
        .expect("valid inline code regex")
    })
}

fn env_assignment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*=").expect("valid env assignment regex"))
}

fn default_dangerous() -> &'static [Regex] {
    static RES: OnceLock<Vec<Regex>> = OnceLock::new();
    RES.get_or_init(|| {
        DANGEROUS_PATTERNS
            .iter()
            .map(|p| Regex::new(&format!("(?i){p}")).expect("valid dangerous pattern"))
            .collect()
    })
}

/// Ordered command checks. The first failing check determines the error.
#[derive(Debug, Clone)]
pub struct CommandPolicy {
    dangerous: Vec<Regex>,
    allowed: HashSet<String>,
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self {
            dangerous: default_dangerous().to_vec(),
            allowed: ALLOWED_COMMANDS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl CommandPolicy {
    /// Permit an extra binary in sandbox mode.
    pub fn with_allowed_command(mut self, name: impl Into<String>) -> Self {
        self.allowed.insert(name.into());
        self
    }

    /// Add a case-insensitive dangerous pattern.
    pub fn with_dangerous_pattern(mut self, pattern: &str) -> Result<Self, regex::Error> {
        self.dangerous.push(Regex::new(&format!("(?i){pattern}"))?);
        Ok(self)
    }

    pub fn is_allowed(&self, binary: &str) -> bool {
        self.allowed.contains(binary)
    }

    /// Return the first dangerous pattern matching `command`.
    pub fn dangerous_match(&self, command: &str) -> Option<&str> {
        self.dangerous
            .iter()
            .find(|re| re.is_match(command))
            .map(|re| re.as_str().trim_start_matches("(?i)"))
    }

    /// Validate `command`.
    ///
    /// Order: dangerous patterns, chaining operators, leading `cd`, allowlist,
    /// inline-code flags, standalone pipe token. Chaining, `cd` and the
    /// allowlist only apply when `sandboxed`.
    pub fn check(&self, command: &str, sandboxed: bool) -> Result<(), SandboxError> {
        if command.trim().is_empty() {
            return Err(SandboxError::EmptyCommand);
        }

        if let Some(pattern) = self.dangerous_match(command) {
            return Err(SandboxError::DangerousCommand {
                pattern: pattern.to_string(),
            });
        }

        let tokens = shlex::split(command)
            .unwrap_or_else(|| command.split_whitespace().map(str::to_string).collect());

        if sandboxed {
            if chaining_re().is_match(command) {
                return Err(SandboxError::ChainingOperator);
            }
            if leading_cd_re().is_match(command) {
                return Err(SandboxError::ChangeDirectory);
            }
            self.check_allowlist(&tokens)?;
        }

        if inline_code_re().is_match(command) {
            return Err(SandboxError::InlineCode);
        }

        // "a|b" inside quotes stays one token; only a bare "|" is an operator.
        if tokens.iter().any(|t| t == "|") {
            return Err(SandboxError::PipeOperator);
        }
        Ok(())
    }

    fn check_allowlist(&self, tokens: &[String]) -> Result<(), SandboxError> {
        let Some(command) = tokens.iter().find(|t| !env_assignment_re().is_match(t)) else {
            return Err(SandboxError::AssignmentsOnly);
        };
        if command.contains('/') {
            return Err(SandboxError::QualifiedCommandPath(command.clone()));
        }
        if !self.allowed.contains(command.as_str()) {
            return Err(SandboxError::NotAllowlisted(command.clone()));
        }
        Ok(())
    }
}

/// Split leading `VAR=value` tokens off an argv.
pub fn split_env_assignments(tokens: Vec<String>) -> (Vec<(String, String)>, Vec<String>) {
    let mut env = Vec::new();
    let mut rest = tokens.into_iter().peekable();
    while let Some(token) = rest.peek() {
        if !env_assignment_re().is_match(token) {
            break;
        }
        if let Some((key, value)) = token.split_once('=') {
            env.push((key.to_string(), value.to_string()));
        }
        rest.next();
    }
    (env, rest.collect())
}
