//! Line-level patch against a desired-state document.

use serde::{Deserialize, Serialize};

use crate::errors::ComposeError;

/// Replacement of one whole line (1-based `line`, without terminator).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineEdit {
    pub line: usize,
    pub old: String,
    pub new: String,
}

/// Minimal change to one document. Empty when the document already matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentDiff {
    pub path: String,
    pub edits: Vec<LineEdit>,
}

impl DocumentDiff {
    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    /// Apply to `content`, keeping every untouched byte (including line
    /// terminators) as it was. Fails if a target line no longer matches.
    pub fn apply(&self, content: &str) -> Result<String, ComposeError> {
        let mut out = String::with_capacity(content.len() + 64);
        let mut edits = self.edits.iter().peekable();

        for (idx, raw) in content.split_inclusive('\n').enumerate() {
            let line_no = idx + 1;
            let Some(edit) = edits.next_if(|e| e.line == line_no) else {
                out.push_str(raw);
                continue;
            };
            let (body, terminator) = split_terminator(raw);
            if body != edit.old {
                return Err(ComposeError::Shape(format!(
                    "{} line {} changed since the diff was computed",
                    self.path, line_no
                )));
            }
            out.push_str(&edit.new);
            out.push_str(terminator);
        }

        if let Some(edit) = edits.next() {
            return Err(ComposeError::Shape(format!(
                "{} has no line {}",
                self.path, edit.line
            )));
        }
        Ok(out)
    }

    /// Unified-diff style rendering for logs and proposal bodies.
    pub fn render(&self) -> String {
        if self.edits.is_empty() {
            return String::new();
        }
        let mut out = format!("--- a/{}\n+++ b/{}\n", self.path, self.path);
        for edit in &self.edits {
            out.push_str(&format!("@@ -{0},1 +{0},1 @@\n", edit.line));
            out.push_str(&format!("-{}\n+{}\n", edit.old, edit.new));
        }
        out
    }
}

fn split_terminator(raw: &str) -> (&str, &str) {
    if let Some(body) = raw.strip_suffix("\r\n") {
        (body, "\r\n")
    } else if let Some(body) = raw.strip_suffix('\n') {
        (body, "\n")
    } else {
        (raw, "")
    }
}
