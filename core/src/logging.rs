//! Captured output of supervised subprocesses
//!
//! Each subprocess runner relays the child's stdout/stderr into the
//! launcher's log and keeps the most recent lines in a bounded ring so the
//! launcher's `stats` RPC can hand them out. When the ring overflows, the
//! oldest entries are dropped and counted; sequence numbers stay monotonic
//! so a consumer can resume tailing from the last entry it saw.

use schema::Utc7;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Which stream a captured line came from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    /// Child's standard output
    Stdout,
    /// Child's standard error
    Stderr,
}

/// One captured line
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct LogEntry {
    /// Monotonic sequence number assigned on push
    pub seq: u64,
    /// Stream the line came from
    pub stream: LogStream,
    /// Line content without the trailing newline
    pub content: String,
    /// Capture time (UTC)
    pub timestamp: Utc7,
}

impl LogEntry {
    /// Create an entry stamped now; the sequence is assigned by the ring
    #[must_use]
    pub fn now(stream: LogStream, content: impl Into<String>) -> Self {
        Self {
            seq: 0,
            stream,
            content: content.into(),
            timestamp: Utc7::now(),
        }
    }
}

/// Bounded ring of recent log entries with a drop counter
#[derive(Debug)]
pub struct LogRing {
    capacity: usize,
    total_dropped: u64,
    next_seq: u64,
    entries: VecDeque<LogEntry>,
}

impl LogRing {
    /// Create a ring holding at most `capacity` entries (must be > 0)
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "LogRing capacity must be > 0");
        Self {
            capacity,
            total_dropped: 0,
            next_seq: 0,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    /// Push an entry, assigning it the next sequence number
    ///
    /// Evicts the oldest entry and bumps the drop counter when full.
    pub fn push(&mut self, mut entry: LogEntry) {
        entry.seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);

        if self.entries.len() == self.capacity {
            self.entries.pop_front();
            self.total_dropped = self.total_dropped.saturating_add(1);
        }
        self.entries.push_back(entry);
    }

    /// Number of retained entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the ring holds no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries ever evicted due to capacity
    #[must_use]
    pub fn total_dropped(&self) -> u64 {
        self.total_dropped
    }

    /// Snapshot of the current entries together with the next sequence value
    #[must_use]
    pub fn snapshot(&self) -> (u64, Vec<LogEntry>) {
        (self.next_seq, self.entries.iter().cloned().collect())
    }

    /// Entries with a sequence strictly greater than `after_seq`
    #[must_use]
    pub fn iter_after(&self, after_seq: u64) -> Vec<LogEntry> {
        self.entries
            .iter()
            .filter(|e| e.seq > after_seq)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eviction_and_drop_count() {
        let mut ring = LogRing::new(3);
        for line in ["a", "b", "c", "d", "e"] {
            ring.push(LogEntry::now(LogStream::Stdout, line));
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.total_dropped(), 2);

        let (next, entries) = ring.snapshot();
        assert_eq!(next, 5);
        let contents: Vec<_> = entries.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, ["c", "d", "e"]);
        let seqs: Vec<_> = entries.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, [2, 3, 4]);
    }

    #[test]
    fn test_tail_resumes_after_sequence() {
        let mut ring = LogRing::new(4);
        for line in ["a", "b", "c"] {
            ring.push(LogEntry::now(LogStream::Stderr, line));
        }
        let tail = ring.iter_after(0);
        let contents: Vec<_> = tail.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, ["b", "c"]);
        assert!(ring.iter_after(2).is_empty());
    }
}
