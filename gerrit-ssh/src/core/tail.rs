//! Bounded buffer of the most recent output lines, kept for diagnostics.

use std::collections::VecDeque;

/// Lines kept per stream when reporting a failed command.
pub const DIAGNOSTIC_LINES: usize = 5;

#[derive(Debug, Clone)]
pub struct TailBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl TailBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, line: impl Into<String>) {
        if self.capacity == 0 {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.into());
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}

impl Default for TailBuffer {
    fn default() -> Self {
        Self::new(DIAGNOSTIC_LINES)
    }
}

/// Prefer `primary`, fall back to `fallback` when it is empty.
pub fn pick_diagnostics(primary: &TailBuffer, fallback: &TailBuffer) -> Vec<String> {
    if primary.is_empty() {
        fallback.to_vec()
    } else {
        primary.to_vec()
    }
}
