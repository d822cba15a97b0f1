//! Parser for the patch grammar.
//!
//! ```text
//! *** Begin Patch
//! *** Update File: src/lib.rs
//! *** Move to: src/core.rs
//! @@
//!  context
//! -removed
//! +added
//! *** Add File: NOTES.md
//! +hello
//! *** Delete File: old.txt
//! *** End Patch
//! ```
//!
//! The whole document is parsed before anything touches the filesystem, so a
//! grammar error never leaves a half-applied patch behind.

use super::PatchError;

pub const BEGIN_PATCH: &str = "*** Begin Patch";
pub const END_PATCH: &str = "*** End Patch";
const UPDATE_FILE: &str = "*** Update File: ";
const ADD_FILE: &str = "*** Add File: ";
const DELETE_FILE: &str = "*** Delete File: ";
const MOVE_TO: &str = "*** Move to: ";
const END_OF_FILE: &str = "*** End of File";

/// A parsed apply_patch request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchDocument {
    pub operations: Vec<FileOperation>,
}

/// One per-file block of a patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOperation {
    /// Path exactly as written in the header.
    pub path: String,
    pub kind: OperationKind,
    /// Raw header and body text, used for repeat detection.
    pub block: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationKind {
    Update {
        hunks: Vec<Hunk>,
        move_to: Option<String>,
    },
    Add {
        lines: Vec<String>,
    },
    Delete,
}

/// One context-anchored change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    /// Context and removed lines, in file order.
    pub before: Vec<String>,
    /// Context and added lines, in file order.
    pub after: Vec<String>,
    pub added: usize,
    pub removed: usize,
}

impl FileOperation {
    /// Lines added by this operation.
    pub fn additions(&self) -> usize {
        match &self.kind {
            OperationKind::Update { hunks, .. } => hunks.iter().map(|h| h.added).sum(),
            OperationKind::Add { lines } => lines.len(),
            OperationKind::Delete => 0,
        }
    }

    /// Lines removed by this operation (deletes are counted when applied).
    pub fn removals(&self) -> usize {
        match &self.kind {
            OperationKind::Update { hunks, .. } => hunks.iter().map(|h| h.removed).sum(),
            _ => 0,
        }
    }
}

/// Parse a patch document.
pub fn parse_patch(text: &str) -> Result<PatchDocument, PatchError> {
    let lines: Vec<&str> = text.lines().collect();

    let begin = lines
        .iter()
        .position(|l| !l.trim().is_empty())
        .filter(|&i| lines[i].trim() == BEGIN_PATCH)
        .ok_or(PatchError::MissingBegin)?;
    let end = lines
        .iter()
        .skip(begin + 1)
        .position(|l| l.trim() == END_PATCH)
        .map(|i| i + begin + 1)
        .ok_or(PatchError::MissingEnd)?;

    let body = &lines[begin + 1..end];
    let mut operations = Vec::new();
    let mut idx = 0;

    while idx < body.len() {
        let line = body[idx];

        if let Some(path) = line.strip_prefix(UPDATE_FILE) {
            let mut block = vec![line];
            idx += 1;
            let mut move_to = None;
            if let Some(target) = body.get(idx).and_then(|l| l.strip_prefix(MOVE_TO)) {
                block.push(body[idx]);
                move_to = Some(target.trim().to_string());
                idx += 1;
            }
            let start = idx;
            idx = next_header(body, idx);
            block.extend_from_slice(&body[start..idx]);

            let path = path.trim().to_string();
            let hunks = parse_hunks(&body[start..idx], &path)?;
            operations.push(FileOperation {
                path,
                kind: OperationKind::Update { hunks, move_to },
                block: block.join("\n"),
            });
            continue;
        }

        if let Some(path) = line.strip_prefix(ADD_FILE) {
            let start = idx + 1;
            idx = next_header(body, start);
            let lines = parse_add_lines(&body[start..idx])?;
            operations.push(FileOperation {
                path: path.trim().to_string(),
                kind: OperationKind::Add { lines },
                block: body[start - 1..idx].join("\n"),
            });
            continue;
        }

        if let Some(path) = line.strip_prefix(DELETE_FILE) {
            let start = idx + 1;
            idx = next_header(body, start);
            if let Some(stray) = body[start..idx].iter().find(|l| !l.trim().is_empty()) {
                return Err(PatchError::UnexpectedLine(stray.to_string()));
            }
            operations.push(FileOperation {
                path: path.trim().to_string(),
                kind: OperationKind::Delete,
                block: body[start - 1..idx].join("\n"),
            });
            continue;
        }

        if line.trim().is_empty() {
            idx += 1;
            continue;
        }
        return Err(PatchError::UnexpectedLine(line.to_string()));
    }

    if operations.is_empty() {
        return Err(PatchError::NoOperations);
    }
    Ok(PatchDocument { operations })
}

/// Index of the next file header at or after `idx`.
fn next_header(lines: &[&str], mut idx: usize) -> usize {
    while idx < lines.len() {
        let line = lines[idx];
        if line.starts_with("*** ") && !line.starts_with(END_OF_FILE) {
            break;
        }
        idx += 1;
    }
    idx
}

fn trim_trailing_blank<'a>(lines: &'a [&'a str]) -> &'a [&'a str] {
    let keep = lines
        .iter()
        .rposition(|l| !l.is_empty())
        .map_or(0, |i| i + 1);
    &lines[..keep]
}

fn parse_hunks(lines: &[&str], path: &str) -> Result<Vec<Hunk>, PatchError> {
    let mut hunks = Vec::new();
    let mut current = HunkBuilder::default();

    for &line in trim_trailing_blank(lines) {
        if line.starts_with("@@") {
            current.finish_into(&mut hunks)?;
            continue;
        }
        if line.starts_with(END_OF_FILE) {
            continue;
        }
        match line.chars().next() {
            Some(' ') => current.context(&line[1..]),
            Some('-') => current.remove(&line[1..]),
            Some('+') => current.add(&line[1..]),
            // Blank lines are taken as empty context.
            None => current.context(""),
            Some(_) => return Err(PatchError::UnexpectedLine(line.to_string())),
        }
    }
    current.finish_into(&mut hunks)?;

    if hunks.is_empty() {
        return Err(PatchError::EmptyUpdate {
            path: path.to_string(),
        });
    }
    Ok(hunks)
}

fn parse_add_lines(lines: &[&str]) -> Result<Vec<String>, PatchError> {
    trim_trailing_blank(lines)
        .iter()
        .filter(|l| !l.starts_with(END_OF_FILE))
        .map(|l| {
            l.strip_prefix('+')
                .map(str::to_string)
                .ok_or_else(|| PatchError::InvalidAddLine(l.to_string()))
        })
        .collect()
}

#[derive(Default)]
struct HunkBuilder {
    before: Vec<String>,
    after: Vec<String>,
    added: usize,
    removed: usize,
}

impl HunkBuilder {
    fn context(&mut self, line: &str) {
        self.before.push(line.to_string());
        self.after.push(line.to_string());
    }

    fn remove(&mut self, line: &str) {
        self.before.push(line.to_string());
        self.removed += 1;
    }

    fn add(&mut self, line: &str) {
        self.after.push(line.to_string());
        self.added += 1;
    }

    fn finish_into(&mut self, hunks: &mut Vec<Hunk>) -> Result<(), PatchError> {
        let builder = std::mem::take(self);
        if builder.before.is_empty() && builder.after.is_empty() {
            return Ok(());
        }
        if builder.before.is_empty() {
            return Err(PatchError::NoContext);
        }
        hunks.push(Hunk {
            before: builder.before,
            after: builder.after,
            added: builder.added,
            removed: builder.removed,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_update_with_hunks() {
        let text = "*** Begin Patch\n*** Update File: src/a.rs\n@@\n ctx\n-old\n+new\n@@ fn other\n x\n+y\n*** End Patch\n";
        let doc = parse_patch(text).unwrap();
        assert_eq!(doc.operations.len(), 1);

        let op = &doc.operations[0];
        assert_eq!(op.path, "src/a.rs");
        let OperationKind::Update { hunks, move_to } = &op.kind else {
            panic!("expected update");
        };
        assert!(move_to.is_none());
        assert_eq!(hunks.len(), 2);
        assert_eq!(hunks[0].before, vec!["ctx", "old"]);
        assert_eq!(hunks[0].after, vec!["ctx", "new"]);
        assert_eq!(op.additions(), 2);
        assert_eq!(op.removals(), 1);
    }

    #[test]
    fn test_blank_line_is_context() {
        let text = "*** Begin Patch\n*** Update File: a\n a\n\n-b\n+c\n*** End Patch";
        let doc = parse_patch(text).unwrap();
        let OperationKind::Update { hunks, .. } = &doc.operations[0].kind else {
            panic!("expected update");
        };
        assert_eq!(hunks[0].before, vec!["a", "", "b"]);
    }

    #[test]
    fn test_move_and_block_text() {
        let text = "*** Begin Patch\n*** Update File: a.txt\n*** Move to: b.txt\n@@\n-x\n+y\n*** End Patch";
        let doc = parse_patch(text).unwrap();
        let op = &doc.operations[0];
        assert!(matches!(
            &op.kind,
            OperationKind::Update { move_to: Some(t), .. } if t == "b.txt"
        ));
        assert_eq!(
            op.block,
            "*** Update File: a.txt\n*** Move to: b.txt\n@@\n-x\n+y"
        );
    }

    #[test]
    fn test_add_and_delete() {
        let text = "*** Begin Patch\n*** Add File: n.txt\n+one\n+two\n*** Delete File: d.txt\n*** End Patch";
        let doc = parse_patch(text).unwrap();
        assert_eq!(doc.operations.len(), 2);
        assert_eq!(
            doc.operations[0].kind,
            OperationKind::Add {
                lines: vec!["one".to_string(), "two".to_string()]
            }
        );
        assert_eq!(doc.operations[1].kind, OperationKind::Delete);
    }

    #[test]
    fn test_grammar_errors() {
        assert!(matches!(
            parse_patch("*** Update File: a\n*** End Patch"),
            Err(PatchError::MissingBegin)
        ));
        assert!(matches!(
            parse_patch("*** Begin Patch\n*** Add File: a\n+x"),
            Err(PatchError::MissingEnd)
        ));
        assert!(matches!(
            parse_patch("*** Begin Patch\n*** End Patch"),
            Err(PatchError::NoOperations)
        ));
        assert!(matches!(
            parse_patch("*** Begin Patch\n*** Add File: a\nno plus\n*** End Patch"),
            Err(PatchError::InvalidAddLine(_))
        ));
        assert!(matches!(
            parse_patch("*** Begin Patch\n*** Update File: a\n?weird\n*** End Patch"),
            Err(PatchError::UnexpectedLine(_))
        ));
        assert!(matches!(
            parse_patch("*** Begin Patch\n*** Update File: a\n+only added\n*** End Patch"),
            Err(PatchError::NoContext)
        ));
        assert!(matches!(
            parse_patch("*** Begin Patch\ngarbage\n*** End Patch"),
            Err(PatchError::UnexpectedLine(_))
        ));
    }

    #[test]
    fn test_crlf_patch_text() {
        let text = "*** Begin Patch\r\n*** Update File: a\r\n-x\r\n+y\r\n*** End Patch\r\n";
        let doc = parse_patch(text).unwrap();
        let OperationKind::Update { hunks, .. } = &doc.operations[0].kind else {
            panic!("expected update");
        };
        assert_eq!(hunks[0].before, vec!["x"]);
    }
}
