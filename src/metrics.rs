//! Pipeline metrics and the periodic reporter.
//!
//! [`PipelineMetrics`] is written by the pipeline loop and read by the
//! [`MetricsReporter`] on its own timer. Counters are atomics; latency
//! samples live in bounded, mutex-guarded windows.
//!
//! Two kinds of values are kept:
//!
//! - interval-scoped (events read/persisted, batches, batch size sum, latency
//!   samples): reset every time a snapshot is taken
//! - cumulative (retries, dead-lettered, malformed, skipped): never reset

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::info;

use crate::shutdown::ShutdownSignal;

/// Samples kept per window; later samples in the same window are dropped.
pub const MAX_SAMPLES: usize = 10_000;

/// Linear-interpolated percentile of `samples`, `p` in `0.0..=100.0`.
///
/// Sorts ascending and interpolates at rank `p / 100 * (n - 1)` between the
/// two adjacent order statistics. Returns `None` for an empty sample set.
///
/// This is the R-7 estimator used by numpy and spreadsheet `PERCENTILE`, so
/// p95 of `[10, 20, 30, 40]` is 38.5 (37 is the p90). Nearest-rank
/// estimators report 40 for the same samples.
pub fn percentile(samples: &[f64], p: f64) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let rank = (p.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f64;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * weight)
}

#[derive(Debug, Default)]
struct SampleWindow {
    samples: Mutex<Vec<f64>>,
}

impl SampleWindow {
    fn record(&self, value: f64) {
        let mut samples = self.samples.lock().unwrap_or_else(|p| p.into_inner());
        if samples.len() < MAX_SAMPLES {
            samples.push(value);
        }
    }

    fn take(&self) -> Vec<f64> {
        std::mem::take(&mut *self.samples.lock().unwrap_or_else(|p| p.into_inner()))
    }
}

/// Counters and latency windows shared between the loop and the reporter.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    events_read: AtomicU64,
    events_persisted: AtomicU64,
    batches: AtomicU64,
    batch_size_sum: AtomicU64,
    write_latency_ms: SampleWindow,
    queue_lag_ms: SampleWindow,

    retries_total: AtomicU64,
    dead_lettered_total: AtomicU64,
    malformed_total: AtomicU64,
    skipped_total: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_read(&self, count: usize) {
        self.events_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_queue_lag(&self, lag_ms: u64) {
        self.queue_lag_ms.record(lag_ms as f64);
    }

    pub fn record_write(&self, duration: Duration) {
        self.write_latency_ms.record(duration.as_secs_f64() * 1000.0);
    }

    /// A batch left the accumulator with `size` events.
    pub fn record_batch(&self, size: usize) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.batch_size_sum.fetch_add(size as u64, Ordering::Relaxed);
    }

    pub fn record_persisted(&self, count: usize) {
        self.events_persisted.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_lettered(&self, count: usize) {
        self.dead_lettered_total.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_malformed(&self, count: usize) {
        self.malformed_total.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_skipped(&self, count: usize) {
        self.skipped_total.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn retries_total(&self) -> u64 {
        self.retries_total.load(Ordering::Relaxed)
    }

    pub fn dead_lettered_total(&self) -> u64 {
        self.dead_lettered_total.load(Ordering::Relaxed)
    }

    /// Aggregate the current window over `elapsed` and start a new one.
    pub fn snapshot(&self, elapsed: Duration) -> MetricsSnapshot {
        let events_read = self.events_read.swap(0, Ordering::Relaxed);
        let events_persisted = self.events_persisted.swap(0, Ordering::Relaxed);
        let batches = self.batches.swap(0, Ordering::Relaxed);
        let batch_size_sum = self.batch_size_sum.swap(0, Ordering::Relaxed);
        let write_samples = self.write_latency_ms.take();
        let lag_samples = self.queue_lag_ms.take();

        let secs = elapsed.as_secs_f64();
        let rate = |count: u64| if secs > 0.0 { count as f64 / secs } else { 0.0 };

        MetricsSnapshot {
            interval: elapsed,
            events_read,
            events_persisted,
            batches,
            read_per_sec: rate(events_read),
            persisted_per_sec: rate(events_persisted),
            avg_batch_size: if batches > 0 {
                batch_size_sum as f64 / batches as f64
            } else {
                0.0
            },
            p95_write_ms: percentile(&write_samples, 95.0),
            p95_queue_lag_ms: percentile(&lag_samples, 95.0),
            retries_total: self.retries_total.load(Ordering::Relaxed),
            dead_lettered_total: self.dead_lettered_total.load(Ordering::Relaxed),
            malformed_total: self.malformed_total.load(Ordering::Relaxed),
            skipped_total: self.skipped_total.load(Ordering::Relaxed),
        }
    }
}

/// One reporting interval's aggregate.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub interval: Duration,
    pub events_read: u64,
    pub events_persisted: u64,
    pub batches: u64,
    pub read_per_sec: f64,
    pub persisted_per_sec: f64,
    pub avg_batch_size: f64,
    pub p95_write_ms: Option<f64>,
    pub p95_queue_lag_ms: Option<f64>,
    pub retries_total: u64,
    pub dead_lettered_total: u64,
    pub malformed_total: u64,
    pub skipped_total: u64,
}

fn fmt_ms(value: Option<f64>) -> String {
    value
        .map(|ms| format!("{:.1}ms", ms))
        .unwrap_or_else(|| "n/a".to_string())
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "read {:.1}/s, persisted {:.1}/s, {} batches (avg {:.1}), \
             p95 write {}, p95 lag {}, retries {}, dead-lettered {}, malformed {}, skipped {}",
            self.read_per_sec,
            self.persisted_per_sec,
            self.batches,
            self.avg_batch_size,
            fmt_ms(self.p95_write_ms),
            fmt_ms(self.p95_queue_lag_ms),
            self.retries_total,
            self.dead_lettered_total,
            self.malformed_total,
            self.skipped_total
        )
    }
}

/// Emits a [`MetricsSnapshot`] every `interval`, independent of the loop.
pub struct MetricsReporter {
    metrics: Arc<PipelineMetrics>,
    interval: Duration,
}

impl MetricsReporter {
    pub fn new(metrics: Arc<PipelineMetrics>, interval: Duration) -> Self {
        Self { metrics, interval }
    }

    /// Take a snapshot of the window that started at `since` and log it.
    pub fn report(&self, since: Instant) -> MetricsSnapshot {
        let snapshot = self.metrics.snapshot(since.elapsed());
        info!(
            read_per_sec = snapshot.read_per_sec,
            persisted_per_sec = snapshot.persisted_per_sec,
            batches = snapshot.batches,
            avg_batch_size = snapshot.avg_batch_size,
            p95_write_ms = ?snapshot.p95_write_ms,
            p95_queue_lag_ms = ?snapshot.p95_queue_lag_ms,
            retries_total = snapshot.retries_total,
            dead_lettered_total = snapshot.dead_lettered_total,
            "Pipeline metrics: {}",
            snapshot
        );
        snapshot
    }

    /// Run until `shutdown` fires, then emit one last snapshot.
    pub fn spawn(self, shutdown: ShutdownSignal) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            // The first tick completes immediately.
            ticker.tick().await;
            let mut window_start = Instant::now();

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        self.report(window_start);
                        break;
                    }
                    _ = ticker.tick() => {
                        self.report(window_start);
                        window_start = Instant::now();
                    }
                }
            }
        })
    }
}
