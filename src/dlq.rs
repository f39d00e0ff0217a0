//! Dead Letter Queue for events that cannot be persisted.
//!
//! Batches that exhaust their retries, records whose data cannot form a
//! row, and stream entries that do not decode are copied to a separate
//! stream for manual investigation. Each dead-letter entry carries the
//! original entry's fields, as read from the stream, plus:
//!
//! ```text
//! failure_reason  error of the last failed attempt
//! failed_at       RFC 3339 timestamp
//! original_id     entry id in the source stream
//! attempts        persist attempts made (0 when never attempted)
//! ```
//!
//! After every entry of a call is appended, the originals are acknowledged
//! on the source stream so they are never redelivered. If an append fails
//! nothing is acknowledged; the originals stay pending and are reclaimed.
//!
//! # Example
//!
//! ```rust,ignore
//! let sink = DeadLetterSink::new(log, DEFAULT_DLQ_STREAM, EVENT_STREAM_NAME, group, metrics);
//! sink.reject(&batch, "stream_messages: connection refused", 6).await?;
//!
//! // Later, inspect
//! let failed = sink.list(10, 0).await?;
//! ```

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::event::{Delivery, EventEnvelope, MalformedEntry};
use crate::metrics::PipelineMetrics;
use crate::store::RecordError;
use crate::transport::{EventLog, LogEntry, TransportError};

pub const DEFAULT_DLQ_STREAM: &str = "tc_events_v1:dlq";

/// Entries to keep in the DLQ (older entries are trimmed)
pub const DEFAULT_DLQ_MAX_LEN: usize = 10_000;

pub const FIELD_FAILURE_REASON: &str = "failure_reason";
pub const FIELD_FAILED_AT: &str = "failed_at";
pub const FIELD_ORIGINAL_ID: &str = "original_id";
pub const FIELD_ATTEMPTS: &str = "attempts";

/// Errors that can occur when working with the Dead Letter Queue.
#[derive(Debug, Error)]
pub enum DlqError {
    #[error("failed to dead-letter {original_id}: {source}")]
    Append {
        original_id: String,
        #[source]
        source: TransportError,
    },

    #[error("dead-lettered entries could not be acknowledged: {0}")]
    Ack(#[source] TransportError),

    #[error("failed to read dead-letter stream: {0}")]
    Read(#[from] TransportError),
}

/// An entry read back from the DLQ.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetter {
    /// Id within the DLQ stream
    pub id: String,
    pub original_id: Option<String>,
    pub failure_reason: String,
    pub failed_at: String,
    pub attempts: Option<u32>,
    /// The original entry's fields
    pub fields: HashMap<String, String>,
}

impl DeadLetter {
    fn from_entry(entry: LogEntry) -> Self {
        let mut fields = entry.fields;
        let failure_reason = fields.remove(FIELD_FAILURE_REASON).unwrap_or_default();
        let failed_at = fields.remove(FIELD_FAILED_AT).unwrap_or_default();
        let original_id = fields.remove(FIELD_ORIGINAL_ID);
        let attempts = fields
            .remove(FIELD_ATTEMPTS)
            .and_then(|n| n.parse().ok());

        Self {
            id: entry.id,
            original_id,
            failure_reason,
            failed_at,
            attempts,
            fields,
        }
    }

    /// Decode the original event, if it was well-formed.
    pub fn envelope(&self) -> Option<EventEnvelope> {
        EventEnvelope::from_fields(&self.fields).ok()
    }
}

/// One entry about to be dead-lettered.
struct Rejection {
    original_id: String,
    fields: Vec<(String, String)>,
    reason: String,
    attempts: u32,
}

fn sorted_fields(fields: &HashMap<String, String>) -> Vec<(String, String)> {
    let mut fields: Vec<(String, String)> = fields
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    fields.sort();
    fields
}

/// Writes failed entries to the DLQ stream and acknowledges the originals.
pub struct DeadLetterSink {
    log: Arc<dyn EventLog>,
    stream: String,
    source_stream: String,
    group: String,
    max_len: usize,
    metrics: Arc<PipelineMetrics>,
}

impl DeadLetterSink {
    pub fn new(
        log: Arc<dyn EventLog>,
        stream: impl Into<String>,
        source_stream: impl Into<String>,
        group: impl Into<String>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            log,
            stream: stream.into(),
            source_stream: source_stream.into(),
            group: group.into(),
            max_len: DEFAULT_DLQ_MAX_LEN,
            metrics,
        }
    }

    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Dead-letter a whole batch that failed with `reason` after `attempts`.
    pub async fn reject(
        &self,
        batch: &[Delivery],
        reason: &str,
        attempts: u32,
    ) -> Result<usize, DlqError> {
        let rejections = batch
            .iter()
            .map(|delivery| Rejection {
                original_id: delivery.id.clone(),
                fields: sorted_fields(&delivery.fields),
                reason: reason.to_string(),
                attempts,
            })
            .collect();
        self.dead_letter(rejections).await
    }

    /// Dead-letter deliveries that each failed for their own reason.
    pub async fn reject_each(
        &self,
        failed: &[(Delivery, String)],
        attempts: u32,
    ) -> Result<usize, DlqError> {
        let rejections = failed
            .iter()
            .map(|(delivery, reason)| Rejection {
                original_id: delivery.id.clone(),
                fields: sorted_fields(&delivery.fields),
                reason: reason.clone(),
                attempts,
            })
            .collect();
        self.dead_letter(rejections).await
    }

    /// Dead-letter deliveries whose data cannot form a row.
    pub async fn reject_records(
        &self,
        rejected: &[(Delivery, RecordError)],
    ) -> Result<usize, DlqError> {
        let failed: Vec<(Delivery, String)> = rejected
            .iter()
            .map(|(delivery, error)| (delivery.clone(), error.to_string()))
            .collect();
        self.reject_each(&failed, 0).await
    }

    /// Dead-letter stream entries that did not decode.
    pub async fn reject_malformed(&self, entries: &[MalformedEntry]) -> Result<usize, DlqError> {
        let rejections = entries
            .iter()
            .map(|entry| Rejection {
                original_id: entry.id.clone(),
                fields: sorted_fields(&entry.fields),
                reason: entry.error.to_string(),
                attempts: 0,
            })
            .collect();

        let count = self.dead_letter(rejections).await?;
        self.metrics.record_malformed(count);
        Ok(count)
    }

    async fn dead_letter(&self, rejections: Vec<Rejection>) -> Result<usize, DlqError> {
        if rejections.is_empty() {
            return Ok(0);
        }

        let failed_at = chrono::Utc::now().to_rfc3339();
        let mut ids = Vec::with_capacity(rejections.len());

        for rejection in rejections {
            let mut fields = rejection.fields;
            fields.push((FIELD_FAILURE_REASON.to_string(), rejection.reason));
            fields.push((FIELD_FAILED_AT.to_string(), failed_at.clone()));
            fields.push((FIELD_ORIGINAL_ID.to_string(), rejection.original_id.clone()));
            fields.push((FIELD_ATTEMPTS.to_string(), rejection.attempts.to_string()));

            let dlq_id = self
                .log
                .append(&self.stream, &fields, Some(self.max_len))
                .await
                .map_err(|source| {
                    error!(
                        original_id = %rejection.original_id,
                        error = %source,
                        "Failed to add entry to DLQ, leaving batch pending"
                    );
                    DlqError::Append {
                        original_id: rejection.original_id.clone(),
                        source,
                    }
                })?;

            debug!(dlq_id = %dlq_id, original_id = %rejection.original_id, "Entry moved to DLQ");
            ids.push(rejection.original_id);
        }

        self.log
            .ack(&self.source_stream, &self.group, &ids)
            .await
            .map_err(|e| {
                error!(error = %e, count = ids.len(), "Failed to acknowledge dead-lettered entries");
                DlqError::Ack(e)
            })?;

        self.metrics.record_dead_lettered(ids.len());
        info!(
            count = ids.len(),
            dlq_stream = %self.stream,
            "Entries moved to Dead Letter Queue"
        );
        Ok(ids.len())
    }

    /// Number of entries in the DLQ.
    pub async fn count(&self) -> Result<u64, DlqError> {
        Ok(self.log.len(&self.stream).await?)
    }

    /// List DLQ entries, oldest first.
    pub async fn list(&self, count: usize, offset: usize) -> Result<Vec<DeadLetter>, DlqError> {
        let entries = self
            .log
            .range(&self.stream, count.saturating_add(offset))
            .await?;
        let result: Vec<DeadLetter> = entries
            .into_iter()
            .skip(offset)
            .take(count)
            .map(DeadLetter::from_entry)
            .collect();

        debug!(count = result.len(), "Retrieved DLQ entries");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::DecodeError;
    use crate::transport::MemoryLog;
    use serde_json::json;
    use std::time::Duration;

    const SOURCE: &str = "events";
    const GROUP: &str = "persisters";

    async fn setup() -> (Arc<MemoryLog>, DeadLetterSink, Arc<PipelineMetrics>) {
        let log = Arc::new(MemoryLog::new());
        log.create_group(SOURCE, GROUP).await.unwrap();
        let metrics = Arc::new(PipelineMetrics::new());
        let sink = DeadLetterSink::new(log.clone(), "events:dlq", SOURCE, GROUP, metrics.clone());
        (log, sink, metrics)
    }

    /// Produce and deliver `n` chat events.
    async fn delivered(log: &MemoryLog, n: usize) -> Vec<Delivery> {
        for i in 0..n {
            let envelope = EventEnvelope::new(
                format!("txn-{}", i),
                "b-1",
                "chat",
                1_000,
                "u-1",
                json!({"d": {"content": "hi"}}),
            );
            log.append(SOURCE, &envelope.to_fields(), None).await.unwrap();
        }
        log.read_group(SOURCE, GROUP, "w1", n, Duration::ZERO)
            .await
            .unwrap()
            .into_iter()
            .map(|entry| {
                let envelope = EventEnvelope::from_fields(&entry.fields).unwrap();
                Delivery::with_fields(entry.id, envelope, entry.fields)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_reject_appends_and_acks() {
        let (log, sink, metrics) = setup().await;
        let batch = delivered(&log, 2).await;
        assert_eq!(log.pending_count(SOURCE, GROUP), 2);

        let count = sink.reject(&batch, "connection refused", 6).await.unwrap();
        assert_eq!(count, 2);
        assert_eq!(log.pending_count(SOURCE, GROUP), 0);
        assert_eq!(sink.count().await.unwrap(), 2);
        assert_eq!(metrics.dead_lettered_total(), 2);

        let listed = sink.list(10, 0).await.unwrap();
        assert_eq!(listed[0].original_id.as_deref(), Some(batch[0].id.as_str()));
        assert_eq!(listed[0].failure_reason, "connection refused");
        assert_eq!(listed[0].attempts, Some(6));
        assert!(chrono::DateTime::parse_from_rfc3339(&listed[0].failed_at).is_ok());
        assert_eq!(listed[0].envelope(), Some(batch[0].envelope.clone()));
    }

    #[tokio::test]
    async fn test_append_failure_leaves_entries_pending() {
        let (log, sink, metrics) = setup().await;
        let batch = delivered(&log, 1).await;

        log.set_unavailable(true);
        let err = sink.reject(&batch, "boom", 6).await.unwrap_err();
        assert!(matches!(err, DlqError::Append { .. }));
        log.set_unavailable(false);

        assert_eq!(log.pending_count(SOURCE, GROUP), 1);
        assert_eq!(sink.count().await.unwrap(), 0);
        assert_eq!(metrics.dead_lettered_total(), 0);
    }

    #[tokio::test]
    async fn test_reject_malformed_keeps_raw_fields() {
        let (log, sink, metrics) = setup().await;
        log.append(SOURCE, &[("t".to_string(), "chat".to_string())], None)
            .await
            .unwrap();
        let entry = log
            .read_group(SOURCE, GROUP, "w1", 1, Duration::ZERO)
            .await
            .unwrap()
            .remove(0);
        let malformed = MalformedEntry {
            id: entry.id,
            fields: entry.fields,
            error: DecodeError::MissingField("txn_id"),
        };

        sink.reject_malformed(&[malformed]).await.unwrap();

        let listed = sink.list(1, 0).await.unwrap();
        assert_eq!(listed[0].fields.get("t").map(String::as_str), Some("chat"));
        assert_eq!(listed[0].failure_reason, "missing required field 'txn_id'");
        assert_eq!(listed[0].attempts, Some(0));
        assert_eq!(listed[0].envelope(), None);
        assert_eq!(log.pending_count(SOURCE, GROUP), 0);
        assert_eq!(metrics.snapshot(Duration::from_secs(1)).malformed_total, 1);
    }

    #[tokio::test]
    async fn test_list_with_offset() {
        let (log, sink, _) = setup().await;
        let batch = delivered(&log, 5).await;
        sink.reject(&batch, "boom", 1).await.unwrap();

        let page = sink.list(2, 3).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].original_id.as_deref(), Some(batch[3].id.as_str()));
        assert!(sink.list(10, 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reject_copies_entry_verbatim() {
        let (log, sink, _) = setup().await;
        let payload = r#"{"v": 1, "t": "chat", "d": {"content": "hi"}}"#;
        let produced: Vec<(String, String)> = [
            ("txn_id", "txn-raw"),
            ("stream_id", "b-1"),
            ("t", "chat"),
            ("ts", "1000"),
            ("s", "u-1"),
            ("v", "1"),
            ("kid", "k1"),
            ("payload", payload),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        log.append(SOURCE, &produced, None).await.unwrap();
        let entry = log
            .read_group(SOURCE, GROUP, "w1", 1, Duration::ZERO)
            .await
            .unwrap()
            .remove(0);
        let envelope = EventEnvelope::from_fields(&entry.fields).unwrap();
        let delivery = Delivery::with_fields(entry.id, envelope, entry.fields);

        sink.reject(&[delivery], "boom", 6).await.unwrap();

        let listed = sink.list(1, 0).await.unwrap();
        let expected: HashMap<String, String> = produced.into_iter().collect();
        assert_eq!(listed[0].fields, expected);
        assert_eq!(listed[0].fields["payload"], payload);
    }

    #[tokio::test]
    async fn test_reject_each_keeps_own_reason() {
        let (log, sink, metrics) = setup().await;
        let batch = delivered(&log, 2).await;
        let failed = vec![
            (batch[0].clone(), "value too long".to_string()),
            (batch[1].clone(), "invalid byte sequence".to_string()),
        ];

        assert_eq!(sink.reject_each(&failed, 1).await.unwrap(), 2);

        let listed = sink.list(10, 0).await.unwrap();
        assert_eq!(listed[0].failure_reason, "value too long");
        assert_eq!(listed[1].failure_reason, "invalid byte sequence");
        assert_eq!(listed[1].attempts, Some(1));
        assert_eq!(log.pending_count(SOURCE, GROUP), 0);
        assert_eq!(metrics.dead_lettered_total(), 2);
    }

    #[tokio::test]
    async fn test_list_with_huge_count() {
        let (log, sink, _) = setup().await;
        let batch = delivered(&log, 3).await;
        sink.reject(&batch, "boom", 1).await.unwrap();

        let page = sink.list(usize::MAX, 1).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].original_id.as_deref(), Some(batch[1].id.as_str()));
    }

    #[tokio::test]
    async fn test_empty_reject_is_noop() {
        let (_, sink, _) = setup().await;
        assert_eq!(sink.reject(&[], "boom", 1).await.unwrap(), 0);
        assert_eq!(sink.count().await.unwrap(), 0);
    }
}
