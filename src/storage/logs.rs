use std::collections::VecDeque;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};

/// Append-only, line-oriented output capture for one execution.
///
/// Readers always observe a prefix of the final log: lines are only ever
/// appended, and once the owning job reaches a terminal state the buffer is
/// frozen and further appends are dropped. When more than `max_lines` lines
/// arrive the oldest are evicted, but `total_lines` keeps counting.
#[derive(Debug)]
pub struct LogBuffer {
    inner: RwLock<LogInner>,
    max_lines: usize,
}

#[derive(Debug, Default)]
struct LogInner {
    lines: VecDeque<String>,
    total: usize,
    frozen: bool,
}

/// Point-in-time view of a log returned to readers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogSnapshot {
    pub lines: Vec<String>,
    /// Lines ever appended, including any evicted ones.
    pub total_lines: usize,
    /// True once the producing execution has finished.
    pub frozen: bool,
}

impl LogBuffer {
    /// `max_lines` of 0 means unbounded.
    pub fn new(max_lines: usize) -> Self {
        Self {
            inner: RwLock::new(LogInner::default()),
            max_lines,
        }
    }

    /// Append one line, stripping a trailing `\n` or `\r\n`.
    /// Returns false if the buffer is frozen and the line was dropped.
    pub fn push_line(&self, line: impl Into<String>) -> bool {
        let mut line = line.into();
        if line.ends_with('\n') {
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
        }

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.frozen {
            return false;
        }
        inner.lines.push_back(line);
        inner.total += 1;
        if self.max_lines > 0 {
            while inner.lines.len() > self.max_lines {
                inner.lines.pop_front();
            }
        }
        true
    }

    pub fn freeze(&self) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .frozen
    }

    pub fn total_lines(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .total
    }

    /// Last `n` retained lines, oldest first. `n == 0` returns everything retained.
    pub fn tail_lines(&self, n: usize) -> Vec<String> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let skip = if n == 0 {
            0
        } else {
            inner.lines.len().saturating_sub(n)
        };
        inner.lines.iter().skip(skip).cloned().collect()
    }

    pub fn snapshot(&self, tail: usize) -> LogSnapshot {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let skip = if tail == 0 {
            0
        } else {
            inner.lines.len().saturating_sub(tail)
        };
        LogSnapshot {
            lines: inner.lines.iter().skip(skip).cloned().collect(),
            total_lines: inner.total,
            frozen: inner.frozen,
        }
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_tail() {
        let log = LogBuffer::new(0);
        for i in 1..=5 {
            assert!(log.push_line(format!("line {}", i)));
        }
        assert_eq!(log.total_lines(), 5);
        assert_eq!(log.tail_lines(2), vec!["line 4", "line 5"]);
        assert_eq!(log.tail_lines(0).len(), 5);
        assert_eq!(log.tail_lines(100).len(), 5);
    }

    #[test]
    fn test_strips_line_endings() {
        let log = LogBuffer::new(0);
        log.push_line("unix\n");
        log.push_line("windows\r\n");
        log.push_line("bare");
        assert_eq!(log.tail_lines(0), vec!["unix", "windows", "bare"]);
    }

    #[test]
    fn test_frozen_buffer_drops_appends() {
        let log = LogBuffer::new(0);
        log.push_line("before");
        log.freeze();
        assert!(log.is_frozen());
        assert!(!log.push_line("after"));
        assert_eq!(log.tail_lines(0), vec!["before"]);
        assert_eq!(log.total_lines(), 1);
    }

    #[test]
    fn test_eviction_keeps_newest_lines() {
        let log = LogBuffer::new(3);
        for i in 0..10 {
            log.push_line(i.to_string());
        }
        assert_eq!(log.tail_lines(0), vec!["7", "8", "9"]);
        assert_eq!(log.total_lines(), 10);
    }

    #[test]
    fn test_snapshot_is_a_prefix_of_later_snapshots() {
        let log = LogBuffer::new(0);
        log.push_line("a");
        log.push_line("b");
        let early = log.snapshot(0);
        log.push_line("c");
        log.freeze();
        let late = log.snapshot(0);

        assert!(!early.frozen);
        assert!(late.frozen);
        assert_eq!(late.total_lines, 3);
        assert_eq!(&late.lines[..early.lines.len()], &early.lines[..]);
    }

    #[test]
    fn test_snapshot_tail() {
        let log = LogBuffer::new(0);
        for i in 0..60 {
            log.push_line(format!("{}", i));
        }
        let snap = log.snapshot(50);
        assert_eq!(snap.lines.len(), 50);
        assert_eq!(snap.lines.first().map(String::as_str), Some("10"));
        assert_eq!(snap.total_lines, 60);
    }
}
