//! In-memory implementation of [`EventLog`] for testing and development.
//!
//! Mirrors the Redis Streams consumer-group model closely enough for the
//! pipeline's guarantees to be exercised without a server:
//!
//! - each group keeps a delivery cursor; `read_group` only hands out entries
//!   past it, so two consumers of one group never see the same new entry
//! - delivered entries stay in the group's pending list, owned by the
//!   consumer that read them, until acknowledged
//! - `autoclaim` moves entries idle for at least `min_idle` to the caller
//! - `claim` resets the idle time of entries the caller is still working on
//!
//! Idle time is measured on the tokio clock, so paused-time tests can step
//! past `min_idle` without sleeping.
//!
//! Reads block on a [`Notify`] until an append or the timeout.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{EventLog, GroupInit, LogEntry, TransportError};

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Sequence number of the last entry handed out by `read_group`
    last_delivered: u64,
    /// Pending entries keyed by sequence number
    pending: BTreeMap<u64, PendingEntry>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: BTreeMap<u64, LogEntry>,
    next_seq: u64,
    groups: HashMap<String, GroupState>,
}

impl StreamState {
    fn append(&mut self, fields: &[(String, String)]) -> String {
        self.next_seq += 1;
        let seq = self.next_seq;
        let id = format!("{}-0", seq);
        let fields: HashMap<String, String> = fields.iter().cloned().collect();
        self.entries.insert(seq, LogEntry::new(id.clone(), fields));
        id
    }

    fn trim(&mut self, max_len: usize) {
        while self.entries.len() > max_len {
            self.entries.pop_first();
        }
    }
}

fn parse_seq(id: &str) -> Option<u64> {
    id.split('-').next().and_then(|ms| ms.parse().ok())
}

/// Event log held entirely in process memory.
#[derive(Debug, Default)]
pub struct MemoryLog {
    streams: Mutex<HashMap<String, StreamState>>,
    appended: Notify,
    unavailable: AtomicBool,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing the connection: every call fails until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of entries pending (delivered, not acknowledged) in a group.
    pub fn pending_count(&self, stream: &str, group: &str) -> usize {
        self.lock()
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len())
            .unwrap_or(0)
    }

    /// Delivery count of a pending entry, `None` if it is not pending.
    pub fn delivery_count(&self, stream: &str, group: &str, id: &str) -> Option<u32> {
        let seq = parse_seq(id)?;
        self.lock()
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .and_then(|g| g.pending.get(&seq))
            .map(|p| p.deliveries)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, StreamState>> {
        // A panic while holding the lock cannot leave the maps half-updated
        // in a way that matters for tests, so recover the guard.
        self.streams
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_available(&self) -> Result<(), TransportError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(TransportError::Connection("memory log unavailable".to_string()))
        } else {
            Ok(())
        }
    }

    fn take_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<LogEntry>, TransportError> {
        let mut streams = self.lock();
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| TransportError::Command(format!("NOGROUP no such key '{}'", stream)))?;
        let StreamState {
            entries, groups, ..
        } = state;
        let group_state = groups.get_mut(group).ok_or_else(|| {
            TransportError::Command(format!("NOGROUP no such consumer group '{}'", group))
        })?;

        let now = Instant::now();
        let mut taken = Vec::new();
        for (seq, entry) in entries.range(group_state.last_delivered + 1..).take(count) {
            group_state.last_delivered = *seq;
            group_state.pending.insert(
                *seq,
                PendingEntry {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    deliveries: 1,
                },
            );
            taken.push(entry.clone());
        }
        Ok(taken)
    }
}

#[async_trait]
impl EventLog for MemoryLog {
    async fn create_group(&self, stream: &str, group: &str) -> Result<GroupInit, TransportError> {
        self.check_available()?;
        let mut streams = self.lock();
        let state = streams.entry(stream.to_string()).or_default();
        if state.groups.contains_key(group) {
            return Ok(GroupInit::AlreadyExists);
        }
        state.groups.insert(group.to_string(), GroupState::default());
        Ok(GroupInit::Created)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogEntry>, TransportError> {
        self.check_available()?;

        // Register interest before checking so an append in between is not missed.
        let notified = self.appended.notified();
        let entries = self.take_new(stream, group, consumer, count)?;
        if !entries.is_empty() || block.is_zero() {
            return Ok(entries);
        }

        if tokio::time::timeout(block, notified).await.is_err() {
            return Ok(Vec::new());
        }
        self.take_new(stream, group, consumer, count)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, TransportError> {
        self.check_available()?;
        let mut streams = self.lock();
        let Some(group_state) = streams.get_mut(stream).and_then(|s| s.groups.get_mut(group))
        else {
            return Ok(0);
        };

        let acked = ids
            .iter()
            .filter_map(|id| parse_seq(id))
            .filter(|seq| group_state.pending.remove(seq).is_some())
            .count();
        Ok(acked as u64)
    }

    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
        max_len: Option<usize>,
    ) -> Result<String, TransportError> {
        self.check_available()?;
        let id = {
            let mut streams = self.lock();
            let state = streams.entry(stream.to_string()).or_default();
            let id = state.append(fields);
            if let Some(max_len) = max_len {
                state.trim(max_len);
            }
            id
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn autoclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<LogEntry>, TransportError> {
        self.check_available()?;
        let mut streams = self.lock();
        let Some(state) = streams.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let StreamState {
            entries, groups, ..
        } = state;
        let Some(group_state) = groups.get_mut(group) else {
            return Err(TransportError::Command(format!(
                "NOGROUP no such consumer group '{}'",
                group
            )));
        };

        let now = Instant::now();
        let mut claimed = Vec::new();
        let mut deleted = Vec::new();
        for (seq, pending) in group_state.pending.iter_mut() {
            if claimed.len() >= count {
                break;
            }
            if now.duration_since(pending.delivered_at) < min_idle {
                continue;
            }
            match entries.get(seq) {
                Some(entry) => {
                    pending.consumer = consumer.to_string();
                    pending.delivered_at = now;
                    pending.deliveries += 1;
                    claimed.push(entry.clone());
                }
                None => deleted.push(*seq),
            }
        }
        // Trimmed entries cannot be redelivered; drop them like Redis does.
        for seq in deleted {
            group_state.pending.remove(&seq);
        }
        Ok(claimed)
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        ids: &[String],
    ) -> Result<u64, TransportError> {
        self.check_available()?;
        let mut streams = self.lock();
        let Some(group_state) = streams.get_mut(stream).and_then(|s| s.groups.get_mut(group))
        else {
            return Ok(0);
        };

        let now = Instant::now();
        let mut claimed = 0;
        for seq in ids.iter().filter_map(|id| parse_seq(id)) {
            if let Some(pending) = group_state.pending.get_mut(&seq) {
                pending.consumer = consumer.to_string();
                pending.delivered_at = now;
                claimed += 1;
            }
        }
        Ok(claimed)
    }

    async fn len(&self, stream: &str) -> Result<u64, TransportError> {
        self.check_available()?;
        Ok(self
            .lock()
            .get(stream)
            .map(|s| s.entries.len() as u64)
            .unwrap_or(0))
    }

    async fn range(&self, stream: &str, count: usize) -> Result<Vec<LogEntry>, TransportError> {
        self.check_available()?;
        Ok(self
            .lock()
            .get(stream)
            .map(|s| s.entries.values().take(count).cloned().collect())
            .unwrap_or_default())
    }
}
