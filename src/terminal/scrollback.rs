use std::collections::VecDeque;

pub const MAX_LINES: usize = 5000;
pub const MAX_LINE_LENGTH: usize = 2000;
pub const TRUNCATION_MARKER: &str = "…[truncated]";

/// Bounded line buffer of recent terminal output. Oldest lines are evicted
/// first; over-long lines are cut and marked.
#[derive(Debug, Clone)]
pub struct Scrollback {
    lines: VecDeque<String>,
    partial: String,
    partial_chars: usize,
    partial_overflowed: bool,
    max_lines: usize,
    max_line_length: usize,
}

impl Default for Scrollback {
    fn default() -> Self {
        Self::with_limits(MAX_LINES, MAX_LINE_LENGTH)
    }
}

impl Scrollback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(max_lines: usize, max_line_length: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            partial: String::new(),
            partial_chars: 0,
            partial_overflowed: false,
            max_lines: max_lines.max(1),
            max_line_length: max_line_length.max(TRUNCATION_MARKER.chars().count() + 1),
        }
    }

    /// Appends raw output. Text after the last newline stays pending until
    /// the line is completed by a later chunk.
    pub fn push(&mut self, chunk: &str) {
        let mut pieces = chunk.split('\n');
        if let Some(first) = pieces.next() {
            self.append_partial(first);
        }
        for piece in pieces {
            self.commit_partial();
            self.append_partial(piece);
        }
    }

    /// Stored lines, oldest first, including the pending line if any.
    pub fn lines(&self) -> Vec<String> {
        let mut out: Vec<String> = self.lines.iter().cloned().collect();
        if !self.partial.is_empty() {
            out.push(self.finish_line(self.partial.clone(), self.partial_overflowed));
            if out.len() > self.max_lines {
                out.remove(0);
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty() && self.partial.is_empty()
    }

    fn append_partial(&mut self, text: &str) {
        if self.partial_overflowed {
            return;
        }
        let room = self.max_line_length - self.partial_chars;
        let mut taken = 0;
        for ch in text.chars() {
            if taken == room {
                // A CR at the limit is part of the line ending, not content.
                if ch == '\r' && !self.partial.ends_with('\r') {
                    self.partial.push(ch);
                    continue;
                }
                self.partial_overflowed = true;
                break;
            }
            self.partial.push(ch);
            taken += 1;
        }
        self.partial_chars += taken;
    }

    fn commit_partial(&mut self) {
        let mut line = std::mem::take(&mut self.partial);
        let overflowed = std::mem::replace(&mut self.partial_overflowed, false);
        self.partial_chars = 0;
        if line.ends_with('\r') {
            line.pop();
        }
        let line = self.finish_line(line, overflowed);
        self.lines.push_back(line);
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
    }

    fn finish_line(&self, line: String, overflowed: bool) -> String {
        if !overflowed {
            return line;
        }
        let keep = self.max_line_length - TRUNCATION_MARKER.chars().count();
        let mut truncated: String = line.chars().take(keep).collect();
        truncated.push_str(TRUNCATION_MARKER);
        truncated
    }
}
