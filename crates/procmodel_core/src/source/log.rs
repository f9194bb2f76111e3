//! Ordered command log contract.
//!
//! # Responsibility
//! - Describe the partitioned append-only log the write pipeline runs on.
//! - Keep the pipeline independent of the concrete log backend.
//!
//! # Invariants
//! - Records with the same key land on the same partition, in append order.
//! - A reader only advances its group's committed position through `commit`.
//! - Uncommitted records are redelivered to the next reader of the group.

use async_trait::async_trait;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// One record fetched from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl LogRecord {
    pub fn position(&self) -> RecordPosition {
        RecordPosition {
            partition: self.partition,
            offset: self.offset,
        }
    }

    /// Lossy key rendering for log lines.
    pub fn key_str(&self) -> String {
        String::from_utf8_lossy(&self.key).into_owned()
    }
}

/// Where an appended record was stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordPosition {
    pub partition: i32,
    pub offset: i64,
}

pub type LogResult<T> = Result<T, LogError>;

/// Command log backend failure.
#[derive(Debug)]
pub enum LogError {
    Closed,
    UnknownPartition { topic: String, partition: i32 },
    Backend(String),
    LockPoisoned,
}

impl Display for LogError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "command log is closed"),
            Self::UnknownPartition { topic, partition } => {
                write!(f, "topic `{topic}` has no partition {partition}")
            }
            Self::Backend(message) => write!(f, "command log backend error: {message}"),
            Self::LockPoisoned => write!(f, "command log state lock poisoned"),
        }
    }
}

impl Error for LogError {}

/// Partitioned, ordered, at-least-once log.
#[async_trait]
pub trait CommandLog: Send + Sync {
    /// Appends one record; returns once the backend acknowledged it.
    async fn append(&self, topic: &str, key: &[u8], value: &[u8]) -> LogResult<RecordPosition>;

    /// Opens a reader for `topic` under consumer group `group_id`.
    async fn subscribe(&self, group_id: &str, topic: &str) -> LogResult<Box<dyn LogReader>>;

    /// Flushes pending appends and wakes readers so they can observe closure.
    async fn close(&self) -> LogResult<()>;
}

/// Sequential reader bound to one (group, topic).
#[async_trait]
pub trait LogReader: Send {
    /// Waits for the next record. `Ok(None)` means the log was closed.
    ///
    /// Must be cancel-safe: dropping the future loses no record.
    async fn fetch(&mut self) -> LogResult<Option<LogRecord>>;

    /// Marks `record` and everything before it on its partition as consumed.
    async fn commit(&mut self, record: &LogRecord) -> LogResult<()>;
}
