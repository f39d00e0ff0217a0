//! Consumer-group reads from the event stream.
//!
//! A [`StreamConsumer`] is one named member of a consumer group. Workers
//! sharing a group name divide the stream between them; each entry is
//! delivered to one member and stays pending until acknowledged.
//!
//! Entries that fail to decode are returned separately as
//! [`MalformedEntry`] so they can be dead-lettered without going through
//! the retry path.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::event::{Delivery, EventEnvelope, MalformedEntry};
use crate::metrics::PipelineMetrics;
use crate::transport::{EventLog, GroupInit, LogEntry, TransportError};

/// Result of a poll or reclaim.
#[derive(Debug, Default)]
pub struct Polled {
    pub deliveries: Vec<Delivery>,
    pub malformed: Vec<MalformedEntry>,
}

impl Polled {
    pub fn is_empty(&self) -> bool {
        self.deliveries.is_empty() && self.malformed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.deliveries.len() + self.malformed.len()
    }
}

pub struct StreamConsumer {
    log: Arc<dyn EventLog>,
    stream: String,
    group: String,
    name: String,
    metrics: Arc<PipelineMetrics>,
}

impl StreamConsumer {
    pub fn new(
        log: Arc<dyn EventLog>,
        stream: impl Into<String>,
        group: impl Into<String>,
        name: impl Into<String>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            log,
            stream: stream.into(),
            group: group.into(),
            name: name.into(),
            metrics,
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create the consumer group if needed. Safe to call on every start.
    pub async fn init(&self) -> Result<(), TransportError> {
        match self.log.create_group(&self.stream, &self.group).await? {
            GroupInit::Created => info!(
                stream = %self.stream,
                consumer_group = %self.group,
                "Created consumer group"
            ),
            GroupInit::AlreadyExists => info!(
                stream = %self.stream,
                consumer_group = %self.group,
                "Consumer group already exists"
            ),
        }
        Ok(())
    }

    /// Read up to `max_count` new entries, blocking at most `block`.
    ///
    /// A timeout is an empty result, not an error.
    pub async fn poll(&self, max_count: usize, block: Duration) -> Result<Polled, TransportError> {
        let entries = self
            .log
            .read_group(&self.stream, &self.group, &self.name, max_count, block)
            .await?;
        Ok(self.decode(entries))
    }

    /// Take over entries other consumers left pending for at least `min_idle`.
    pub async fn reclaim(&self, min_idle: Duration, count: usize) -> Result<Polled, TransportError> {
        let entries = self
            .log
            .autoclaim(&self.stream, &self.group, &self.name, min_idle, count)
            .await?;

        if !entries.is_empty() {
            info!(
                count = entries.len(),
                consumer = %self.name,
                "Claimed pending entries from idle consumers"
            );
        }
        Ok(self.decode(entries))
    }

    /// Acknowledge delivered entries in one call.
    pub async fn ack(&self, ids: &[String]) -> Result<u64, TransportError> {
        self.log.ack(&self.stream, &self.group, ids).await
    }

    /// Re-claim `ids` for this consumer so their idle time starts over.
    ///
    /// Called while a batch waits between retries. A failure only risks a
    /// peer reclaiming the entries, so it is logged and not returned.
    pub async fn refresh(&self, ids: &[String]) {
        match self
            .log
            .claim(&self.stream, &self.group, &self.name, ids)
            .await
        {
            Ok(claimed) => debug!(claimed = claimed, requested = ids.len(), "Refreshed pending entries"),
            Err(e) => warn!(error = %e, count = ids.len(), "Failed to refresh pending entries"),
        }
    }

    fn decode(&self, entries: Vec<LogEntry>) -> Polled {
        if entries.is_empty() {
            return Polled::default();
        }

        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut polled = Polled::default();
        for entry in entries {
            match EventEnvelope::from_fields(&entry.fields) {
                Ok(envelope) => {
                    self.metrics.record_queue_lag(envelope.lag_ms(now_ms));
                    polled
                        .deliveries
                        .push(Delivery::with_fields(entry.id, envelope, entry.fields));
                }
                Err(error) => {
                    warn!(id = %entry.id, error = %error, "Unparseable stream entry");
                    polled.malformed.push(MalformedEntry {
                        id: entry.id,
                        fields: entry.fields,
                        error,
                    });
                }
            }
        }

        self.metrics.record_read(polled.len());
        debug!(
            delivered = polled.deliveries.len(),
            malformed = polled.malformed.len(),
            "Decoded stream entries"
        );
        polled
    }
}
