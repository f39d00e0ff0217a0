//! Partitioning and idempotent bulk writes.
//!
//! A flushed batch is split by event type into one write-set per table.
//! Each write-set is a single bulk upsert keyed on
//! `(context_id, transaction_id)`, so persisting a batch again after a
//! crash or a failed attempt leaves the tables unchanged.
//!
//! The batch is one unit of work: if any write-set fails, the whole batch
//! is reported failed and nothing is acknowledged. Write-sets that did
//! succeed are harmless to write again on retry.
//!
//! When the store refuses a write-set outright (a permanent error), one bad
//! row has failed the statement for every row in it. [`Persister::isolate`]
//! then writes the write-sets again, falling back to one row per statement,
//! so only the rows the store refuses on their own are reported.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, warn};

use crate::event::{Delivery, EventEnvelope, EventType};
use crate::metrics::PipelineMetrics;
use crate::store::{
    ChatMessageRecord, EventStore, GiftRecord, RecordError, StoreError, CHAT_TABLE, GIFT_TABLE,
};

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("write to {table} failed: {source}")]
    Store {
        table: &'static str,
        #[source]
        source: StoreError,
    },
}

impl PersistError {
    /// Permanent errors skip the retry budget and go straight to the DLQ.
    pub fn is_permanent(&self) -> bool {
        match self {
            PersistError::Store { source, .. } => source.is_permanent(),
        }
    }
}

/// Rows to write, one vector per destination table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteSets {
    pub chats: Vec<ChatMessageRecord>,
    pub gifts: Vec<GiftRecord>,
}

impl WriteSets {
    pub fn is_empty(&self) -> bool {
        self.chats.is_empty() && self.gifts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chats.len() + self.gifts.len()
    }
}

/// A batch split into write-sets.
#[derive(Debug, Default)]
pub struct Partitioned {
    pub write_sets: WriteSets,
    /// Deliveries to acknowledge once the write-sets are persisted
    pub accepted: Vec<Delivery>,
    /// Accepted deliveries whose type has no destination table
    pub skipped: usize,
    /// Deliveries whose data cannot form a row; permanent
    pub rejected: Vec<(Delivery, RecordError)>,
}

/// Rows newly inserted by one successful persist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistReport {
    pub chats_inserted: u64,
    pub gifts_inserted: u64,
}

/// A destination row: table plus conflict key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RowKey {
    pub table: &'static str,
    pub context_id: String,
    pub transaction_id: String,
}

impl RowKey {
    fn new(table: &'static str, context_id: &str, transaction_id: &str) -> Self {
        Self {
            table,
            context_id: context_id.to_string(),
            transaction_id: transaction_id.to_string(),
        }
    }

    /// The row `envelope` is written to, `None` for types without a table.
    pub fn of(envelope: &EventEnvelope) -> Option<Self> {
        let table = match envelope.event_type {
            EventType::Chat => CHAT_TABLE,
            EventType::Gift => GIFT_TABLE,
            EventType::Other(_) => return None,
        };
        Some(Self::new(table, &envelope.context_id, &envelope.transaction_id))
    }
}

trait Row {
    fn key(&self, table: &'static str) -> RowKey;
}

impl Row for ChatMessageRecord {
    fn key(&self, table: &'static str) -> RowKey {
        RowKey::new(table, &self.context_id, &self.transaction_id)
    }
}

impl Row for GiftRecord {
    fn key(&self, table: &'static str) -> RowKey {
        RowKey::new(table, &self.context_id, &self.transaction_id)
    }
}

/// Outcome of [`Persister::isolate`].
#[derive(Debug, Default)]
pub struct Isolated {
    pub report: PersistReport,
    /// Rows the store refused on their own
    pub refused: Vec<(RowKey, StoreError)>,
    /// Rows not written because of a transient error
    pub deferred: Vec<RowKey>,
}

pub struct Persister {
    store: Arc<dyn EventStore>,
    metrics: Arc<PipelineMetrics>,
}

impl Persister {
    pub fn new(store: Arc<dyn EventStore>, metrics: Arc<PipelineMetrics>) -> Self {
        Self { store, metrics }
    }

    /// Split `batch` by event type.
    ///
    /// Repeated `(context_id, transaction_id)` keys within the batch keep
    /// their first row only, so one statement never conflicts with itself.
    pub fn partition(batch: Vec<Delivery>) -> Partitioned {
        let mut partitioned = Partitioned::default();
        let mut seen_chats = HashSet::new();
        let mut seen_gifts = HashSet::new();

        for delivery in batch {
            let envelope = &delivery.envelope;
            let key = (envelope.context_id.clone(), envelope.transaction_id.clone());

            let outcome = match &envelope.event_type {
                EventType::Chat => ChatMessageRecord::try_from(envelope).map(|record| {
                    if seen_chats.insert(key) {
                        partitioned.write_sets.chats.push(record);
                    }
                }),
                EventType::Gift => GiftRecord::try_from(envelope).map(|record| {
                    if seen_gifts.insert(key) {
                        partitioned.write_sets.gifts.push(record);
                    }
                }),
                EventType::Other(kind) => {
                    debug!(event_type = %kind, id = %delivery.id, "No destination table, skipping");
                    partitioned.skipped += 1;
                    Ok(())
                }
            };

            match outcome {
                Ok(()) => partitioned.accepted.push(delivery),
                Err(error) => partitioned.rejected.push((delivery, error)),
            }
        }

        partitioned
    }

    /// Write every write-set. Fails as a whole if any write-set fails.
    pub async fn persist(&self, sets: &WriteSets) -> Result<PersistReport, PersistError> {
        let started = Instant::now();
        let result = self.write(sets).await;
        self.metrics.record_write(started.elapsed());

        if let Err(e) = &result {
            warn!(rows = sets.len(), error = %e, "Batch write failed");
        }
        result
    }

    async fn write(&self, sets: &WriteSets) -> Result<PersistReport, PersistError> {
        let mut report = PersistReport::default();

        if !sets.chats.is_empty() {
            report.chats_inserted = self
                .store
                .upsert_chat_messages(&sets.chats)
                .await
                .map_err(|source| PersistError::Store {
                    table: CHAT_TABLE,
                    source,
                })?;
        }

        if !sets.gifts.is_empty() {
            report.gifts_inserted = self
                .store
                .upsert_gifts(&sets.gifts)
                .await
                .map_err(|source| PersistError::Store {
                    table: GIFT_TABLE,
                    source,
                })?;
        }

        debug!(
            chats = sets.chats.len(),
            gifts = sets.gifts.len(),
            chats_inserted = report.chats_inserted,
            gifts_inserted = report.gifts_inserted,
            "Persisted batch"
        );
        Ok(report)
    }

    /// Write `sets` after a permanent failure, narrowing down to single rows
    /// for any write-set the store refuses.
    pub async fn isolate(&self, sets: &WriteSets) -> Isolated {
        let started = Instant::now();
        let mut isolated = Isolated::default();

        let chats_inserted = isolate_rows(
            CHAT_TABLE,
            &sets.chats,
            |rows| self.store.upsert_chat_messages(rows),
            &mut isolated,
        )
        .await;
        let gifts_inserted = isolate_rows(
            GIFT_TABLE,
            &sets.gifts,
            |rows| self.store.upsert_gifts(rows),
            &mut isolated,
        )
        .await;
        isolated.report = PersistReport {
            chats_inserted,
            gifts_inserted,
        };

        self.metrics.record_write(started.elapsed());
        debug!(
            refused = isolated.refused.len(),
            deferred = isolated.deferred.len(),
            "Isolated refused rows"
        );
        isolated
    }
}

async fn isolate_rows<'a, R, F, Fut>(
    table: &'static str,
    rows: &'a [R],
    write: F,
    isolated: &mut Isolated,
) -> u64
where
    R: Row,
    F: Fn(&'a [R]) -> Fut,
    Fut: Future<Output = Result<u64, StoreError>>,
{
    if rows.is_empty() {
        return 0;
    }

    match write(rows).await {
        Ok(inserted) => return inserted,
        Err(e) if !e.is_permanent() => {
            warn!(table = table, error = %e, rows = rows.len(), "Write-set failed, leaving it pending");
            isolated.deferred.extend(rows.iter().map(|row| row.key(table)));
            return 0;
        }
        Err(e) => debug!(table = table, error = %e, rows = rows.len(), "Write-set refused, writing rows singly"),
    }

    let mut inserted = 0;
    for row in rows {
        match write(std::slice::from_ref(row)).await {
            Ok(n) => inserted += n,
            Err(e) if e.is_permanent() => {
                let key = row.key(table);
                warn!(table = table, transaction_id = %key.transaction_id, error = %e, "Row refused");
                isolated.refused.push((key, e));
            }
            Err(e) => {
                warn!(table = table, error = %e, "Row write failed, leaving it pending");
                isolated.deferred.push(row.key(table));
            }
        }
    }
    inserted
}
