//! Output capture for target processes.
//!
//! Keeps the most recent lines a dev server printed so an early exit can be
//! explained, and strips ANSI codes before lines are matched against patterns.

use std::collections::VecDeque;

use strip_ansi_escapes::strip;

/// Indicates the source stream of an output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Standard Output.
    Stdout,
    /// Standard Error.
    Stderr,
}

/// A fixed-capacity ring buffer of the latest output lines.
#[derive(Debug, Clone)]
pub struct OutputTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl OutputTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    /// Pushes a line, dropping the oldest when full. Returns true if a line was dropped.
    pub fn push(&mut self, line: impl Into<String>) -> bool {
        let mut dropped = false;
        if self.lines.len() >= self.capacity {
            self.lines.pop_front();
            dropped = true;
        }
        self.lines.push_back(line.into());
        dropped
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Renders the buffered lines as an indented block for error messages.
    pub fn render(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        let mut out = String::from("\nlast output:");
        for line in &self.lines {
            out.push_str("\n  ");
            out.push_str(line);
        }
        out
    }
}

/// Removes ANSI escape codes. Invalid UTF-8 sequences are replaced.
pub fn strip_ansi(text: &str) -> String {
    let stripped = strip(text.as_bytes());
    String::from_utf8_lossy(&stripped).to_string()
}
