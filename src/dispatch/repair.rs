//! Recovery of malformed tool-call arguments.
//!
//! Models routinely wrap arguments in markdown fences, leave trailing
//! commas, use single quotes, stop mid-object or spell numbers out. Each
//! repair here is a pure string transform; the dispatcher tries them in
//! order and keeps the first that parses into a JSON object.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

const PATCH_BEGIN: &str = "*** Begin Patch";
const PATCH_END: &str = "*** End Patch";

fn fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"```(?:json|JSON)?\s*\n?([\s\S]*?)\n?```").expect("static regex"))
}

fn number_word_value(word: &str) -> Option<i64> {
    Some(match word {
        "zero" => 0,
        "a" | "one" => 1,
        "two" => 2,
        "three" => 3,
        "four" => 4,
        "five" => 5,
        "six" => 6,
        "seven" => 7,
        "eight" => 8,
        "nine" => 9,
        "ten" => 10,
        "eleven" => 11,
        "twelve" => 12,
        "thirteen" => 13,
        "fourteen" => 14,
        "fifteen" => 15,
        "sixteen" => 16,
        "seventeen" => 17,
        "eighteen" => 18,
        "nineteen" => 19,
        "twenty" => 20,
        "thirty" => 30,
        "forty" => 40,
        "fifty" => 50,
        "sixty" => 60,
        "seventy" => 70,
        "eighty" => 80,
        "ninety" => 90,
        "hundred" => 100,
        _ => return None,
    })
}

/// Parse an English number phrase: `"fifty"`, `"twenty one"`,
/// `"one hundred and five"`. Hyphens are treated as spaces.
pub fn parse_number_words(text: &str) -> Option<i64> {
    let lowered = text.trim().to_lowercase().replace('-', " ");
    let words: Vec<&str> = lowered
        .split_whitespace()
        .filter(|w| *w != "and")
        .collect();
    parse_words(&words)
}

fn parse_words(words: &[&str]) -> Option<i64> {
    match words {
        [] => None,
        [single] => number_word_value(single),
        [base, "hundred"] => number_word_value(base).map(|b| b * 100),
        [base, "hundred", rest @ ..] => {
            let base = number_word_value(base)?;
            Some(base * 100 + parse_words(rest)?)
        }
        [tens, unit] => Some(number_word_value(tens)? + number_word_value(unit)?),
        _ => None,
    }
}

/// Replace bare number words after the given keys (`"limit": fifty`) with
/// digits. Unrecognized phrases are left alone.
pub fn repair_number_words(raw: &str, fields: &[&str]) -> String {
    if raw.is_empty() || fields.is_empty() {
        return raw.to_string();
    }
    let alternatives: Vec<String> = fields.iter().map(|f| regex::escape(f)).collect();
    let pattern = format!(
        r#""({})"\s*:\s*([A-Za-z_-]+(?:\s+[A-Za-z_-]+)*)"#,
        alternatives.join("|")
    );
    let Ok(re) = Regex::new(&pattern) else {
        return raw.to_string();
    };
    re.replace_all(raw, |caps: &regex::Captures| match parse_number_words(&caps[2]) {
        Some(n) => format!("\"{}\": {n}", &caps[1]),
        None => caps[0].to_string(),
    })
    .into_owned()
}

/// The first embedded `*** Begin Patch` .. `*** End Patch` block.
pub fn extract_patch_block(text: &str) -> Option<&str> {
    let start = text.find(PATCH_BEGIN)?;
    let end = text[start..].find(PATCH_END)? + start + PATCH_END.len();
    Some(&text[start..end])
}

/// Generic JSON repair. Returns the object when any combination of the
/// fixes below makes the text parse.
pub fn repair_json(raw: &str) -> Option<Map<String, Value>> {
    let mut text = strip_fences(raw).trim().to_string();
    match text.find('{') {
        Some(0) => {}
        Some(start) => text = text[start..].to_string(),
        None => return None,
    }

    let mut candidates = Vec::new();
    let closed = auto_close(&text);
    candidates.push(strip_trailing_commas(&closed));
    let requoted = normalize_single_quotes(&text);
    candidates.push(strip_trailing_commas(&auto_close(&requoted)));

    candidates.into_iter().find_map(|candidate| {
        match serde_json::from_str::<Value>(&candidate) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        }
    })
}

fn strip_fences(raw: &str) -> &str {
    fence_re()
        .captures(raw)
        .and_then(|c| c.get(1))
        .map_or(raw, |m| m.as_str())
}

/// Drop commas directly followed (after whitespace) by `}` or `]`.
fn strip_trailing_commas(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escape_next = false;

    for (i, &c) in chars.iter().enumerate() {
        if escape_next {
            escape_next = false;
            out.push(c);
            continue;
        }
        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            ',' if !in_string => {
                let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
                if matches!(next, Some('}') | Some(']')) {
                    continue;
                }
            }
            _ => {}
        }
        out.push(c);
    }
    out
}

/// Rewrite single-quoted strings as double-quoted ones.
fn normalize_single_quotes(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_double = false;
    let mut in_single = false;
    let mut escape_next = false;

    for c in text.chars() {
        if escape_next {
            escape_next = false;
            if in_single && c == '\'' {
                out.push('\'');
            } else {
                out.push('\\');
                out.push(c);
            }
            continue;
        }
        match c {
            '\\' if in_double || in_single => escape_next = true,
            '"' if in_single => out.push_str("\\\""),
            '"' => {
                in_double = !in_double;
                out.push(c);
            }
            '\'' if !in_double => {
                in_single = !in_single;
                out.push('"');
            }
            _ => out.push(c),
        }
    }
    out
}

/// Close an unterminated string and any open braces or brackets, innermost
/// first.
fn auto_close(text: &str) -> String {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escape_next = false;

    for c in text.chars() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => stack.push('}'),
            '[' if !in_string => stack.push(']'),
            '}' | ']' if !in_string => {
                stack.pop();
            }
            _ => {}
        }
    }

    if stack.is_empty() && !in_string {
        return text.to_string();
    }
    let mut out = text.to_string();
    if in_string {
        out.push('"');
    }
    while let Some(close) = stack.pop() {
        out.push(close);
    }
    out
}
