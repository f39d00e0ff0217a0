//! The worker loop: poll, accumulate, flush.
//!
//! ```text
//!          +--------------------------- loop ---------------------------+
//!          |                                                            |
//! shutdown? -- no --> reclaim due? --> poll (block) --> buffer --> flush due?
//!    |                                    |                          |
//!   yes                             transport error            persist + retry
//!    |                              backoff 100ms..5s          ack | dead-letter
//!    v
//! flush remaining buffer, return
//! ```
//!
//! The loop is sequential: a batch is fully persisted (or dead-lettered)
//! before the next poll. Shutdown is only observed between iterations, so a
//! batch is never abandoned half-way.
//!
//! While a batch waits between retries its entries are re-claimed before
//! every wait, so peers reclaiming idle entries leave them alone. A batch
//! the store refuses outright is narrowed down to the refused rows; only
//! those are dead-lettered.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::batch::BatchAccumulator;
use crate::config::SluiceConfig;
use crate::consumer::{Polled, StreamConsumer};
use crate::dlq::DeadLetterSink;
use crate::event::Delivery;
use crate::metrics::PipelineMetrics;
use crate::persister::{Isolated, Partitioned, Persister, RowKey};
use crate::retry::{RetryManager, RetryOutcome};
use crate::shutdown::ShutdownSignal;
use crate::store::EventStore;
use crate::transport::{EventLog, TransportError};

/// Loop timings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub poll_block: Duration,
    pub claim_idle: Duration,
    pub claim_interval: Duration,
    pub claim_count: usize,
    /// First wait after a transport error; doubles per consecutive error
    pub transport_backoff_base: Duration,
    pub transport_backoff_max: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            batch_size: 200,
            flush_interval: Duration::from_millis(250),
            poll_block: Duration::from_millis(100),
            claim_idle: Duration::from_secs(120),
            claim_interval: Duration::from_secs(30),
            claim_count: 100,
            transport_backoff_base: Duration::from_millis(100),
            transport_backoff_max: Duration::from_secs(5),
        }
    }
}

impl From<&SluiceConfig> for PipelineSettings {
    fn from(config: &SluiceConfig) -> Self {
        Self {
            batch_size: config.worker.batch_size,
            flush_interval: Duration::from_millis(config.worker.flush_interval_ms),
            poll_block: Duration::from_millis(config.worker.poll_block_ms),
            claim_idle: Duration::from_millis(config.recovery.claim_idle_ms),
            claim_interval: Duration::from_millis(config.recovery.claim_interval_ms),
            claim_count: config.recovery.claim_count,
            ..Self::default()
        }
    }
}

impl PipelineSettings {
    /// Wait after `failures` consecutive transport errors.
    pub fn transport_backoff(&self, failures: u32) -> Duration {
        let factor = 2u32
            .checked_pow(failures.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.transport_backoff_base
            .checked_mul(factor)
            .unwrap_or(self.transport_backoff_max)
            .min(self.transport_backoff_max)
    }
}

/// What happened to one flushed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Deliveries in the batch
    pub events: usize,
    /// Deliveries written and acknowledged
    pub persisted: usize,
    /// Rows that did not exist before
    pub inserted: u64,
    /// Deliveries with no destination table
    pub skipped: usize,
    pub dead_lettered: usize,
    pub retries: u32,
}

pub struct Pipeline {
    consumer: StreamConsumer,
    accumulator: BatchAccumulator<Delivery>,
    persister: Persister,
    retry: RetryManager,
    dlq: DeadLetterSink,
    metrics: Arc<PipelineMetrics>,
    settings: PipelineSettings,
    last_claim: Instant,
}

impl Pipeline {
    pub fn new(
        consumer: StreamConsumer,
        persister: Persister,
        retry: RetryManager,
        dlq: DeadLetterSink,
        metrics: Arc<PipelineMetrics>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            consumer,
            accumulator: BatchAccumulator::new(settings.batch_size, settings.flush_interval),
            persister,
            retry,
            dlq,
            metrics,
            settings,
            last_claim: Instant::now(),
        }
    }

    /// Wire a pipeline from configuration.
    pub fn from_config(
        config: &SluiceConfig,
        log: Arc<dyn EventLog>,
        store: Arc<dyn EventStore>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        let consumer = StreamConsumer::new(
            log.clone(),
            config.worker.stream.clone(),
            config.worker.consumer_group.clone(),
            config.worker_name(),
            metrics.clone(),
        );
        let dlq = DeadLetterSink::new(
            log,
            config.dead_letter.stream.clone(),
            config.worker.stream.clone(),
            config.worker.consumer_group.clone(),
            metrics.clone(),
        )
        .with_max_len(config.dead_letter.max_len);

        Self::new(
            consumer,
            Persister::new(store, metrics.clone()),
            RetryManager::new(config.retry.policy(), metrics.clone()),
            dlq,
            metrics,
            PipelineSettings::from(config),
        )
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn buffered(&self) -> usize {
        self.accumulator.len()
    }

    /// Run until `shutdown` fires, then flush what is buffered and return.
    pub async fn run(mut self, shutdown: ShutdownSignal) {
        info!(
            stream = %self.consumer.stream(),
            consumer_group = %self.consumer.group(),
            consumer = %self.consumer.name(),
            batch_size = self.settings.batch_size,
            "Pipeline starting"
        );

        if !self.init(&shutdown).await {
            info!("Shutdown before the consumer group was ready");
            return;
        }

        if let Err(e) = self.reclaim_stale().await {
            warn!(error = %e, "Initial reclaim of pending entries failed");
        }

        let mut failures: u32 = 0;
        while !shutdown.is_shutdown() {
            match self.tick().await {
                Ok(_) => failures = 0,
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = self.settings.transport_backoff(failures);
                    warn!(
                        error = %e,
                        consecutive_failures = failures,
                        backoff_ms = delay.as_millis() as u64,
                        "Stream read failed, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.cancelled() => {}
                    }
                }
            }
        }

        if !self.accumulator.is_empty() {
            info!(buffered = self.accumulator.len(), "Flushing buffered events before exit");
            self.flush().await;
        }
        info!("Pipeline stopped");
    }

    /// Create the consumer group, retrying transport errors until shutdown.
    async fn init(&self, shutdown: &ShutdownSignal) -> bool {
        let mut failures: u32 = 0;
        loop {
            if shutdown.is_shutdown() {
                return false;
            }
            match self.consumer.init().await {
                Ok(()) => return true,
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = self.settings.transport_backoff(failures);
                    error!(error = %e, backoff_ms = delay.as_millis() as u64, "Failed to create consumer group");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.cancelled() => {}
                    }
                }
            }
        }
    }

    /// One loop iteration: reclaim if due, poll, flush if due.
    ///
    /// Returns the number of entries taken from the log.
    pub async fn tick(&mut self) -> Result<usize, TransportError> {
        if self.last_claim.elapsed() >= self.settings.claim_interval {
            self.reclaim_stale().await?;
        }

        let taken = self.poll_once().await?;
        self.flush_if_due().await;
        Ok(taken)
    }

    /// Poll for as many entries as the buffer has room for.
    pub async fn poll_once(&mut self) -> Result<usize, TransportError> {
        let polled = self
            .consumer
            .poll(self.accumulator.remaining_capacity(), self.settings.poll_block)
            .await?;
        Ok(self.absorb(polled).await)
    }

    /// Claim entries abandoned by other consumers into the buffer.
    pub async fn reclaim_stale(&mut self) -> Result<usize, TransportError> {
        self.last_claim = Instant::now();
        let polled = self
            .consumer
            .reclaim(self.settings.claim_idle, self.settings.claim_count)
            .await?;
        Ok(self.absorb(polled).await)
    }

    async fn absorb(&mut self, polled: Polled) -> usize {
        let taken = polled.len();
        if !polled.malformed.is_empty() {
            if let Err(e) = self.dlq.reject_malformed(&polled.malformed).await {
                error!(error = %e, count = polled.malformed.len(), "Failed to dead-letter malformed entries");
            }
        }
        self.accumulator.extend(polled.deliveries);
        taken
    }

    /// Flush if the size or interval trigger fired.
    pub async fn flush_if_due(&mut self) -> Option<FlushReport> {
        let trigger = self.accumulator.should_flush()?;
        debug!(trigger = ?trigger, buffered = self.accumulator.len(), "Flushing batch");
        Some(self.flush().await)
    }

    /// Persist everything buffered, retrying and dead-lettering as needed.
    pub async fn flush(&mut self) -> FlushReport {
        let batch = self.accumulator.drain();
        let mut report = FlushReport {
            events: batch.len(),
            ..FlushReport::default()
        };
        if batch.is_empty() {
            return report;
        }
        self.metrics.record_batch(batch.len());

        let Partitioned {
            write_sets,
            accepted,
            skipped,
            rejected,
        } = Persister::partition(batch);
        self.metrics.record_skipped(skipped);
        report.skipped = skipped;

        if !rejected.is_empty() {
            match self.dlq.reject_records(&rejected).await {
                Ok(count) => report.dead_lettered += count,
                Err(e) => error!(error = %e, count = rejected.len(), "Failed to dead-letter invalid records"),
            }
        }
        if accepted.is_empty() {
            return report;
        }

        let ids: Vec<String> = accepted.iter().map(|d| d.id.clone()).collect();
        let persister = &self.persister;
        let consumer = &self.consumer;
        let sets = &write_sets;
        let pending = &ids;
        let outcome = self
            .retry
            .run_with_keepalive(|| persister.persist(sets), || consumer.refresh(pending))
            .await;

        match outcome {
            RetryOutcome::Succeeded { value, retries } => {
                report.retries = retries;
                report.inserted = value.chats_inserted + value.gifts_inserted;
                report.persisted = self.ack_persisted(&ids, accepted.len() - skipped).await;
            }
            RetryOutcome::Exhausted { error, attempts } if error.is_permanent() => {
                report.retries = attempts.saturating_sub(1);
                warn!(error = %error, events = accepted.len(), "Store refused batch, isolating rows");
                let isolated = self.persister.isolate(&write_sets).await;
                self.settle_isolated(accepted, isolated, attempts, &mut report)
                    .await;
            }
            RetryOutcome::Exhausted { error, attempts } => {
                report.retries = attempts.saturating_sub(1);
                match self.dlq.reject(&accepted, &error.to_string(), attempts).await {
                    Ok(count) => report.dead_lettered += count,
                    Err(e) => error!(error = %e, count = accepted.len(), "Failed to dead-letter exhausted batch"),
                }
            }
        }

        debug!(
            events = report.events,
            persisted = report.persisted,
            inserted = report.inserted,
            dead_lettered = report.dead_lettered,
            retries = report.retries,
            "Batch complete"
        );
        report
    }

    /// Acknowledge written entries. Returns `persisted` once acknowledged.
    async fn ack_persisted(&self, ids: &[String], persisted: usize) -> usize {
        if ids.is_empty() {
            return 0;
        }
        match self.consumer.ack(ids).await {
            Ok(_) => {
                self.metrics.record_persisted(persisted);
                persisted
            }
            // Rows are written; the entries stay pending and are reclaimed
            // later, which the upsert absorbs.
            Err(e) => {
                error!(error = %e, count = ids.len(), "Failed to acknowledge persisted batch");
                0
            }
        }
    }

    /// Ack what `isolate` wrote, dead-letter what it refused and leave
    /// deferred rows pending for a later reclaim.
    async fn settle_isolated(
        &self,
        accepted: Vec<Delivery>,
        isolated: Isolated,
        attempts: u32,
        report: &mut FlushReport,
    ) {
        report.inserted = isolated.report.chats_inserted + isolated.report.gifts_inserted;
        let refused: HashMap<RowKey, String> = isolated
            .refused
            .into_iter()
            .map(|(key, e)| {
                let reason = format!("write to {} failed: {}", key.table, e);
                (key, reason)
            })
            .collect();
        let deferred: HashSet<RowKey> = isolated.deferred.into_iter().collect();

        let mut written = Vec::new();
        let mut persisted = 0;
        let mut dead = Vec::new();
        let mut left_pending = 0;
        for delivery in accepted {
            let key = RowKey::of(&delivery.envelope);
            if let Some(reason) = key.as_ref().and_then(|k| refused.get(k)) {
                dead.push((delivery, reason.clone()));
            } else if key.as_ref().is_some_and(|k| deferred.contains(k)) {
                left_pending += 1;
            } else {
                if key.is_some() {
                    persisted += 1;
                }
                written.push(delivery.id);
            }
        }

        report.persisted = self.ack_persisted(&written, persisted).await;
        if !dead.is_empty() {
            match self.dlq.reject_each(&dead, attempts).await {
                Ok(count) => report.dead_lettered += count,
                Err(e) => error!(error = %e, count = dead.len(), "Failed to dead-letter refused rows"),
            }
        }
        if left_pending > 0 {
            warn!(count = left_pending, "Rows left pending after a transient failure");
        }
    }
}
