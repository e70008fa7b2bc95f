//! Bounded, line-aware output history for replay on re-attach.
//!
//! Output arrives in arbitrary chunks. Complete lines (terminated by `\n`,
//! terminator included) are queued; the unterminated remainder is carried as
//! a tail and completed by later chunks. Lines are evicted oldest-first so the
//! retained bytes never exceed the cap.

use std::collections::VecDeque;

/// Default history cap per session.
pub const DEFAULT_HISTORY_BYTES: usize = 256 * 1024;

#[derive(Debug)]
pub struct HistoryBuffer {
    lines: VecDeque<String>,
    tail: String,
    retained_bytes: usize,
    cap: usize,
    enabled: bool,
}

impl HistoryBuffer {
    pub const fn new(cap: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            tail: String::new(),
            retained_bytes: 0,
            cap,
            enabled: true,
        }
    }

    /// A buffer that ignores every append. Used for TTY sessions whose
    /// output is cursor-relative and cannot be replayed.
    pub const fn disabled() -> Self {
        let mut buffer = Self::new(0);
        buffer.enabled = false;
        buffer
    }

    pub fn append(&mut self, text: &str) {
        if !self.enabled || text.is_empty() {
            return;
        }

        let mut rest = text;
        while let Some(pos) = rest.find('\n') {
            let (line, remainder) = rest.split_at(pos + 1);
            let line = if self.tail.is_empty() {
                line.to_string()
            } else {
                let mut joined = std::mem::take(&mut self.tail);
                joined.push_str(line);
                joined
            };
            self.push_line(line);
            rest = remainder;
        }

        if !rest.is_empty() {
            self.tail.push_str(rest);
            self.trim_tail();
        }
    }

    /// Retained lines in order, followed by the unterminated tail.
    pub fn snapshot(&self) -> String {
        let mut out = String::with_capacity(self.retained_bytes + self.tail.len());
        for line in &self.lines {
            out.push_str(line);
        }
        out.push_str(&self.tail);
        out
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty() && self.tail.is_empty()
    }

    /// Number of retained complete lines.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub const fn retained_bytes(&self) -> usize {
        self.retained_bytes
    }

    pub const fn cap(&self) -> usize {
        self.cap
    }

    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn clear(&mut self) {
        self.lines.clear();
        self.tail.clear();
        self.retained_bytes = 0;
    }

    fn push_line(&mut self, line: String) {
        self.retained_bytes += line.len();
        self.lines.push_back(line);
        while self.retained_bytes > self.cap {
            let Some(evicted) = self.lines.pop_front() else {
                break;
            };
            self.retained_bytes -= evicted.len();
        }
    }

    // A stream that never emits `\n` (progress bars, prompts) must not grow
    // without bound; keep only the newest `cap` bytes of it.
    fn trim_tail(&mut self) {
        if self.tail.len() <= self.cap {
            return;
        }
        let mut cut = self.tail.len() - self.cap;
        while !self.tail.is_char_boundary(cut) {
            cut += 1;
        }
        self.tail.drain(..cut);
    }
}

impl Default for HistoryBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_BYTES)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn lines_are_rebuilt_across_chunk_boundaries() {
        let mut history = HistoryBuffer::default();
        history.append("ab");
        history.append("c\nde");
        history.append("f\n");

        assert_eq!(history.snapshot(), "abc\ndef\n");
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn snapshot_includes_unterminated_tail() {
        let mut history = HistoryBuffer::default();
        history.append("done\n$ ");

        assert_eq!(history.snapshot(), "done\n$ ");
        assert_eq!(history.len(), 1);
        assert!(!history.is_empty());
    }

    #[test]
    fn tail_only_history_is_not_empty() {
        let mut history = HistoryBuffer::default();
        assert!(history.is_empty());
        history.append("partial");
        assert!(!history.is_empty());
        assert_eq!(history.len(), 0);
    }

    #[test]
    fn oldest_lines_are_evicted_first() {
        let mut history = HistoryBuffer::new(10);
        history.append("aaaa\n");
        history.append("bbbb\n");
        history.append("cccc\n");

        assert_eq!(history.snapshot(), "bbbb\ncccc\n");
        assert_eq!(history.retained_bytes(), 10);
    }

    #[test]
    fn retained_bytes_never_exceed_cap() {
        let mut history = HistoryBuffer::new(64);
        for i in 0..500 {
            history.append(&format!("line {i} with some padding\npart"));
            assert!(history.retained_bytes() <= history.cap());
        }
        let expected: usize = history.snapshot().len() - "part".len();
        assert_eq!(history.retained_bytes(), expected);
    }

    #[test]
    fn oversized_line_is_dropped_entirely() {
        let mut history = HistoryBuffer::new(8);
        history.append("ok\n");
        history.append("this line is far too long\n");

        assert_eq!(history.retained_bytes(), 0);
        assert!(history.is_empty());
    }

    #[test]
    fn cap_counts_utf8_bytes() {
        let mut history = HistoryBuffer::new(8);
        history.append("ééé\n");
        assert_eq!(history.retained_bytes(), 7);
        history.append("é\n");
        assert_eq!(history.snapshot(), "é\n");
    }

    #[test]
    fn unterminated_tail_is_bounded_on_char_boundary() {
        let mut history = HistoryBuffer::new(5);
        history.append("abcdé");
        history.append("fg");

        let snapshot = history.snapshot();
        assert!(snapshot.len() <= 5);
        assert!(snapshot.ends_with("éfg"));
    }

    #[test]
    fn disabled_buffer_ignores_appends() {
        let mut history = HistoryBuffer::disabled();
        history.append("vim draws here\n\x1b[2J");

        assert!(history.is_empty());
        assert!(!history.is_enabled());
        assert_eq!(history.snapshot(), "");
    }

    #[test]
    fn clear_resets_everything() {
        let mut history = HistoryBuffer::default();
        history.append("one\ntwo");
        history.clear();

        assert!(history.is_empty());
        assert_eq!(history.retained_bytes(), 0);
    }
}
