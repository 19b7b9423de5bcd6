//! Parsing of inference process output.

use crate::error::GrimoireError;
use std::collections::VecDeque;

/// The reply is the text after the last `delimiter`, trimmed.
pub fn extract_reply(stdout: &str, delimiter: &str) -> Result<String, GrimoireError> {
    if delimiter.is_empty() {
        return Ok(stdout.trim().to_string());
    }
    stdout
        .rfind(delimiter)
        .map(|at| stdout[at + delimiter.len()..].trim().to_string())
        .ok_or_else(|| {
            GrimoireError::malformed_output(format!(
                "reply delimiter '{delimiter}' not found in {} bytes of output",
                stdout.len()
            ))
        })
}

/// Keeps the last `max_lines` lines of a stream.
#[derive(Debug)]
pub struct LineTail {
    lines: VecDeque<String>,
    max_lines: usize,
}

impl LineTail {
    pub fn new(max_lines: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(max_lines.min(64)),
            max_lines: max_lines.max(1),
        }
    }

    pub fn push(&mut self, line: String) {
        if self.lines.len() == self.max_lines {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn into_string(self) -> String {
        Vec::from(self.lines).join("\n")
    }
}
