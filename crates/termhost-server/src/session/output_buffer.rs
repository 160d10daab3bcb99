//! Line-oriented scrollback for session output.
//!
//! Stores the most recent output of a PTY as text lines so that a
//! reconnecting client can receive a snapshot without the server keeping
//! unbounded history. Two independent caps apply after every chunk: a
//! maximum line count and a maximum total size in bytes.

use std::collections::VecDeque;

/// Default maximum number of buffered lines.
pub const DEFAULT_MAX_LINES: usize = 10_000;

/// Default maximum buffered size (10 MiB).
pub const DEFAULT_MAX_BYTES: usize = 10 * 1024 * 1024;

/// Result of appending one chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Lines dropped from the front to satisfy the caps.
    pub evicted: usize,
    /// True only for the first chunk that ever exceeded a cap on this buffer.
    pub first_overflow: bool,
}

/// A bounded, append-only sequence of output lines.
#[derive(Debug)]
pub struct OutputBuffer {
    lines: VecDeque<String>,
    max_lines: usize,
    max_bytes: usize,
    /// Sum of `len()` over `lines`, separators excluded.
    content_bytes: usize,
    /// Whether the last line is still waiting for its terminating newline.
    tail_open: bool,
    overflow_warned: bool,
}

impl OutputBuffer {
    /// Create an empty buffer with the given caps.
    pub fn new(max_lines: usize, max_bytes: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            max_lines,
            max_bytes,
            content_bytes: 0,
            tail_open: false,
            overflow_warned: false,
        }
    }

    /// Append a chunk of output, then enforce both caps.
    ///
    /// The chunk is split on `\n`. If the previous chunk did not end with a
    /// newline, the first fragment continues the last buffered line.
    pub fn push(&mut self, chunk: &str) -> AppendOutcome {
        if chunk.is_empty() {
            return AppendOutcome::default();
        }

        let ends_with_newline = chunk.ends_with('\n');
        let body = if ends_with_newline {
            &chunk[..chunk.len() - 1]
        } else {
            chunk
        };

        let mut fragments = body.split('\n');
        if let Some(first) = fragments.next() {
            match self.lines.back_mut() {
                Some(last) if self.tail_open => {
                    last.push_str(first);
                    self.content_bytes += first.len();
                }
                _ => self.push_line(first),
            }
        }
        for fragment in fragments {
            self.push_line(fragment);
        }
        self.tail_open = !ends_with_newline;

        self.enforce_limits()
    }

    fn push_line(&mut self, line: &str) {
        self.content_bytes += line.len();
        self.lines.push_back(line.to_string());
    }

    fn pop_front(&mut self) {
        if let Some(line) = self.lines.pop_front() {
            self.content_bytes -= line.len();
        }
        if self.lines.is_empty() {
            self.tail_open = false;
        }
    }

    fn enforce_limits(&mut self) -> AppendOutcome {
        let mut evicted = 0;

        if self.lines.len() > self.max_lines {
            let overflow = self.lines.len() - self.max_lines;
            for _ in 0..overflow {
                self.pop_front();
            }
            evicted += overflow;
        }

        while self.size_bytes() > self.max_bytes && !self.lines.is_empty() {
            self.pop_front();
            evicted += 1;
        }

        let first_overflow = evicted > 0 && !self.overflow_warned;
        if first_overflow {
            self.overflow_warned = true;
        }

        AppendOutcome {
            evicted,
            first_overflow,
        }
    }

    /// Buffered size: line bytes plus one `\n` between consecutive lines.
    pub fn size_bytes(&self) -> usize {
        self.content_bytes + self.lines.len().saturating_sub(1)
    }

    /// Copy of all buffered lines, oldest first.
    pub fn lines(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    /// Number of buffered lines.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Whether a cap has been exceeded at least once.
    pub fn overflow_warned(&self) -> bool {
        self.overflow_warned
    }

    pub fn max_lines(&self) -> usize {
        self.max_lines
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINES, DEFAULT_MAX_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_chunk_into_lines() {
        let mut buf = OutputBuffer::new(100, 1024);
        buf.push("one\ntwo\nthree\n");
        assert_eq!(buf.lines(), vec!["one", "two", "three"]);
        assert_eq!(buf.size_bytes(), "one\ntwo\nthree".len());
    }

    #[test]
    fn partial_line_continues_across_chunks() {
        let mut buf = OutputBuffer::new(100, 1024);
        buf.push("hel");
        buf.push("lo\nwor");
        buf.push("ld\n");
        buf.push("next\n");
        assert_eq!(buf.lines(), vec!["hello", "world", "next"]);
    }

    #[test]
    fn blank_lines_are_kept() {
        let mut buf = OutputBuffer::new(100, 1024);
        buf.push("a\n\nb\n");
        assert_eq!(buf.lines(), vec!["a", "", "b"]);
        buf.push("\n");
        assert_eq!(buf.lines(), vec!["a", "", "b", ""]);
    }

    #[test]
    fn empty_chunk_is_ignored() {
        let mut buf = OutputBuffer::new(100, 1024);
        assert_eq!(buf.push(""), AppendOutcome::default());
        assert!(buf.is_empty());
    }

    #[test]
    fn line_cap_evicts_exactly_one_oldest() {
        let mut buf = OutputBuffer::new(3, 1024);
        buf.push("a\nb\nc\n");
        assert_eq!(buf.len(), 3);

        let outcome = buf.push("d\n");
        assert_eq!(outcome.evicted, 1);
        assert_eq!(buf.lines(), vec!["b", "c", "d"]);
    }

    #[test]
    fn byte_cap_evicts_from_front() {
        // "aaaa\nbbbb\ncccc" is 14 bytes
        let mut buf = OutputBuffer::new(100, 10);
        let outcome = buf.push("aaaa\nbbbb\ncccc\n");
        assert_eq!(buf.lines(), vec!["bbbb", "cccc"]);
        assert_eq!(buf.size_bytes(), 9);
        assert_eq!(outcome.evicted, 1);
    }

    #[test]
    fn oversized_single_line_is_dropped() {
        let mut buf = OutputBuffer::new(100, 4);
        buf.push("0123456789\n");
        assert!(buf.is_empty());
        assert_eq!(buf.size_bytes(), 0);

        // Tail state resets with the eviction; the next chunk starts fresh.
        buf.push("ok");
        assert_eq!(buf.lines(), vec!["ok"]);
    }

    #[test]
    fn both_caps_hold_after_every_chunk() {
        let mut buf = OutputBuffer::new(50, 200);
        for i in 0..500 {
            let chunk = format!("{}\n", "x".repeat(i % 37));
            buf.push(&chunk);
            assert!(buf.len() <= 50);
            assert!(buf.size_bytes() <= 200);
        }
    }

    #[test]
    fn twenty_thousand_lines_respect_default_cap() {
        let mut buf = OutputBuffer::default();
        let chunk = "x\n".repeat(20_000);
        buf.push(&chunk);
        assert_eq!(buf.len(), DEFAULT_MAX_LINES);
    }

    #[test]
    fn overflow_reported_once() {
        let mut buf = OutputBuffer::new(2, 1024);
        assert!(!buf.push("a\nb\n").first_overflow);
        assert!(buf.push("c\n").first_overflow);
        assert!(buf.overflow_warned());
        let again = buf.push("d\n");
        assert_eq!(again.evicted, 1);
        assert!(!again.first_overflow);
    }
}
