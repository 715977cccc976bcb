//! Bounded in-memory log ring buffer.
//!
//! [`LogBuffer`] retains the most recent structured records for the
//! service-manager snapshot while mirroring every record onto the `log`
//! facade, so embedders see runtime events through their own logger
//! without any extra wiring.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

/// Severity of a log record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// Fine-grained tracing.
    Trace,
    /// Debug detail.
    Debug,
    /// Routine events.
    Info,
    /// Recoverable problems (rejected writes, failed commits).
    Warn,
    /// Failures that lost work.
    Error,
}

impl LogLevel {
    fn facade(self) -> log::Level {
        match self {
            Self::Trace => log::Level::Trace,
            Self::Debug => log::Level::Debug,
            Self::Info => log::Level::Info,
            Self::Warn => log::Level::Warn,
            Self::Error => log::Level::Error,
        }
    }
}

/// A single structured log record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Monotonic sequence number within this buffer.
    pub seq: u64,
    /// Severity.
    pub level: LogLevel,
    /// Optional operation id (entity id, machine id, task name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op: Option<String>,
    /// The message.
    pub message: String,
}

struct Inner {
    records: VecDeque<LogRecord>,
    capacity: usize,
    next_seq: u64,
}

/// Append-only bounded log buffer, cheap to clone and share.
///
/// Oldest records are evicted once `capacity` is reached. Every push is
/// also forwarded to the `log` facade under the `drover` target.
#[derive(Clone)]
pub struct LogBuffer {
    inner: Rc<RefCell<Inner>>,
}

impl LogBuffer {
    /// Create a buffer retaining at most `capacity` records.
    ///
    /// A zero capacity is bumped to 1 so the most recent record is
    /// always observable.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                records: VecDeque::with_capacity(capacity.max(1)),
                capacity: capacity.max(1),
                next_seq: 0,
            })),
        }
    }

    /// Append a record, evicting the oldest if at capacity.
    pub fn push(&self, level: LogLevel, op: Option<&str>, message: impl Into<String>) {
        let message = message.into();
        match op {
            Some(op) => log::log!(target: "drover", level.facade(), "[{op}] {message}"),
            None => log::log!(target: "drover", level.facade(), "{message}"),
        }

        let mut inner = self.inner.borrow_mut();
        if inner.records.len() == inner.capacity {
            inner.records.pop_front();
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.records.push_back(LogRecord {
            seq,
            level,
            op: op.map(str::to_string),
            message,
        });
    }

    /// Append a warn-level record.
    pub fn warn(&self, op: Option<&str>, message: impl Into<String>) {
        self.push(LogLevel::Warn, op, message);
    }

    /// Append an error-level record.
    pub fn error(&self, op: Option<&str>, message: impl Into<String>) {
        self.push(LogLevel::Error, op, message);
    }

    /// Append an info-level record.
    pub fn info(&self, op: Option<&str>, message: impl Into<String>) {
        self.push(LogLevel::Info, op, message);
    }

    /// Append a debug-level record.
    pub fn debug(&self, op: Option<&str>, message: impl Into<String>) {
        self.push(LogLevel::Debug, op, message);
    }

    /// Number of retained records.
    pub fn len(&self) -> usize {
        self.inner.borrow().records.len()
    }

    /// Whether the buffer holds no records.
    pub fn is_empty(&self) -> bool {
        self.inner.borrow().records.is_empty()
    }

    /// Copy out the retained records, oldest first.
    pub fn snapshot(&self) -> Vec<LogRecord> {
        self.inner.borrow().records.iter().cloned().collect()
    }

    /// Discard all retained records. Sequence numbers keep advancing.
    pub fn clear(&self) {
        self.inner.borrow_mut().records.clear();
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(512)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eviction_keeps_newest_records() {
        let buf = LogBuffer::new(3);
        for i in 0..5 {
            buf.info(None, format!("msg {i}"));
        }
        let snap = buf.snapshot();
        assert_eq!(snap.len(), 3);
        assert_eq!(snap[0].message, "msg 2");
        assert_eq!(snap[2].message, "msg 4");
        // Sequence numbers survive eviction.
        assert_eq!(snap[0].seq, 2);
    }

    #[test]
    fn op_id_is_recorded() {
        let buf = LogBuffer::new(8);
        buf.warn(Some("door_7"), "write rejected");
        let snap = buf.snapshot();
        assert_eq!(snap[0].op.as_deref(), Some("door_7"));
        assert_eq!(snap[0].level, LogLevel::Warn);
    }

    #[test]
    fn clear_preserves_sequence_counter() {
        let buf = LogBuffer::new(8);
        buf.info(None, "a");
        buf.clear();
        buf.info(None, "b");
        let snap = buf.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].seq, 1);
    }

    #[test]
    fn zero_capacity_is_bumped_to_one() {
        let buf = LogBuffer::new(0);
        buf.info(None, "only");
        assert_eq!(buf.len(), 1);
    }
}
