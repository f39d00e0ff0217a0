//! Event log transport.
//!
//! The pipeline needs an append-only log with consumer-group semantics:
//! idempotent group creation, blocking group reads that hand out entries
//! to exactly one consumer, explicit acknowledgement, reclaim of entries
//! left pending by dead consumers, ownership refresh for entries still
//! being worked on, and plain appends for the dead-letter
//! stream. [`EventLog`] captures exactly that surface.
//!
//! ## Implementations
//!
//! - [`RedisEventLog`]: Redis Streams (`XREADGROUP`, `XACK`, `XAUTOCLAIM`, ...)
//! - [`MemoryLog`]: in-process log for tests and local development

pub mod memory;
pub mod redis_streams;

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

pub use self::memory::MemoryLog;
pub use self::redis_streams::RedisEventLog;

/// Errors raised by the log transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Could not obtain a connection
    #[error("log connection error: {0}")]
    Connection(String),

    /// The log rejected or failed a command
    #[error("log command error: {0}")]
    Command(String),
}

/// One raw entry of a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    /// Entry id, also the delivery handle used for acknowledgement
    pub id: String,

    pub fields: HashMap<String, String>,
}

impl LogEntry {
    pub fn new(id: impl Into<String>, fields: HashMap<String, String>) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }
}

/// Outcome of [`EventLog::create_group`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupInit {
    Created,
    AlreadyExists,
}

/// An append-only log with consumer groups.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Create `group` on `stream` (creating the stream if needed).
    ///
    /// Creating a group that already exists is not an error.
    async fn create_group(&self, stream: &str, group: &str) -> Result<GroupInit, TransportError>;

    /// Read up to `count` never-delivered entries for `consumer`, blocking
    /// at most `block`. A timeout yields an empty vector.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogEntry>, TransportError>;

    /// Acknowledge entries, removing them from the group's pending list.
    /// Returns how many were actually pending.
    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, TransportError>;

    /// Append an entry, optionally trimming the stream to roughly `max_len`.
    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
        max_len: Option<usize>,
    ) -> Result<String, TransportError>;

    /// Transfer up to `count` entries pending for longer than `min_idle`
    /// (on any consumer of the group) to `consumer` and return them.
    async fn autoclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<LogEntry>, TransportError>;

    /// Claim pending `ids` for `consumer` and reset their idle time, so
    /// [`autoclaim`](Self::autoclaim) on other consumers passes them over.
    /// Ids that are no longer pending are ignored. Returns how many were
    /// claimed.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        ids: &[String],
    ) -> Result<u64, TransportError>;

    /// Number of entries in the stream.
    async fn len(&self, stream: &str) -> Result<u64, TransportError>;

    /// The first `count` entries of the stream, oldest first.
    async fn range(&self, stream: &str, count: usize) -> Result<Vec<LogEntry>, TransportError>;
}
