//! End-to-end runs of the pipeline over the in-memory log and store.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use sluice::consumer::StreamConsumer;
use sluice::dlq::DeadLetterSink;
use sluice::metrics::PipelineMetrics;
use sluice::persister::Persister;
use sluice::pipeline::{Pipeline, PipelineSettings};
use sluice::retry::{RetryManager, RetryPolicy};
use sluice::shutdown::ShutdownSignal;
use sluice::store::MemoryStore;
use sluice::transport::{EventLog, MemoryLog};
use sluice::EventEnvelope;

const STREAM: &str = "tc_events_v1";
const GROUP: &str = "tc_persisters";
const DLQ: &str = "tc_events_v1:dlq";

struct World {
    log: Arc<MemoryLog>,
    store: Arc<MemoryStore>,
    metrics: Arc<PipelineMetrics>,
}

impl World {
    fn new() -> Self {
        Self {
            log: Arc::new(MemoryLog::new()),
            store: Arc::new(MemoryStore::new()),
            metrics: Arc::new(PipelineMetrics::new()),
        }
    }

    fn pipeline(&self, worker: &str, settings: PipelineSettings) -> Pipeline {
        let consumer = StreamConsumer::new(
            self.log.clone(),
            STREAM,
            GROUP,
            worker,
            self.metrics.clone(),
        );
        let dlq = DeadLetterSink::new(self.log.clone(), DLQ, STREAM, GROUP, self.metrics.clone());
        Pipeline::new(
            consumer,
            Persister::new(self.store.clone(), self.metrics.clone()),
            RetryManager::new(RetryPolicy::default(), self.metrics.clone()),
            dlq,
            self.metrics.clone(),
            settings,
        )
    }

    fn sink(&self) -> DeadLetterSink {
        DeadLetterSink::new(self.log.clone(), DLQ, STREAM, GROUP, self.metrics.clone())
    }

    async fn produce(&self, txn: &str, event_type: &str, data: Value) -> String {
        let envelope = EventEnvelope::new(
            txn,
            "broadcast-1",
            event_type,
            chrono::Utc::now().timestamp_millis(),
            "user-1",
            json!({"v": 1, "t": event_type, "d": data}),
        );
        self.log
            .append(STREAM, &envelope.to_fields(), None)
            .await
            .unwrap()
    }

    async fn produce_sample(&self) {
        self.produce("txn-a", "chat", json!({"content": "hello"})).await;
        self.produce("txn-b", "chat", json!({"content": "gg"})).await;
        self.produce(
            "txn-c",
            "gift",
            json!({"receiver_id": "user-2", "gift_id": "rose", "coins_spent": 10}),
        )
        .await;
    }
}

fn settings() -> PipelineSettings {
    PipelineSettings {
        poll_block: Duration::ZERO,
        flush_interval: Duration::from_secs(3600),
        claim_interval: Duration::from_secs(3600),
        ..PipelineSettings::default()
    }
}

#[tokio::test]
async fn persists_chats_and_gifts_once() {
    let world = World::new();
    world.log.create_group(STREAM, GROUP).await.unwrap();
    world.produce_sample().await;

    let mut pipeline = world.pipeline("w1", settings());
    pipeline.poll_once().await.unwrap();
    let report = pipeline.flush().await;

    assert_eq!(report.persisted, 3);
    assert_eq!(report.inserted, 3);
    assert_eq!(world.store.chat_messages().len(), 2);
    assert_eq!(world.store.gifts().len(), 1);
    assert_eq!(world.store.gifts()[0].amount, 10);
    assert_eq!(world.log.pending_count(STREAM, GROUP), 0);

    // Producers retrying the same transactions add no rows.
    world.produce_sample().await;
    pipeline.poll_once().await.unwrap();
    let report = pipeline.flush().await;

    assert_eq!(report.persisted, 3);
    assert_eq!(report.inserted, 0);
    assert_eq!(world.store.chat_messages().len(), 2);
    assert_eq!(world.store.gifts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn exhausted_batch_is_dead_lettered_once() {
    let world = World::new();
    world.log.create_group(STREAM, GROUP).await.unwrap();
    world.produce_sample().await;
    world.store.fail_always();

    let mut pipeline = world.pipeline("w1", settings());
    pipeline.poll_once().await.unwrap();
    let started = tokio::time::Instant::now();
    let report = pipeline.flush().await;

    assert_eq!(report.retries, 5);
    assert_eq!(report.dead_lettered, 3);
    assert!(started.elapsed() >= Duration::from_secs(62));
    assert_eq!(world.metrics.retries_total(), 5);
    assert_eq!(world.metrics.dead_lettered_total(), 3);

    let dead = world.sink().list(10, 0).await.unwrap();
    assert_eq!(dead.len(), 3);
    assert!(dead.iter().all(|d| d.attempts == Some(6)));
    assert!(dead[0].failure_reason.contains("stream_messages"));
    let txns: Vec<String> = dead
        .iter()
        .filter_map(|d| d.envelope())
        .map(|e| e.transaction_id)
        .collect();
    assert_eq!(txns, vec!["txn-a", "txn-b", "txn-c"]);

    // Acknowledged: neither a new read nor a reclaim hands them out again.
    assert_eq!(world.log.pending_count(STREAM, GROUP), 0);
    assert_eq!(pipeline.poll_once().await.unwrap(), 0);
    assert_eq!(pipeline.reclaim_stale().await.unwrap(), 0);
    assert_eq!(world.sink().count().await.unwrap(), 3);
}

#[tokio::test(start_paused = true)]
async fn malformed_entries_skip_retries() {
    let world = World::new();
    world.log.create_group(STREAM, GROUP).await.unwrap();
    world.produce("txn-a", "chat", json!({"content": "hello"})).await;
    world
        .log
        .append(
            STREAM,
            &[
                ("txn_id".to_string(), "txn-broken".to_string()),
                ("t".to_string(), "chat".to_string()),
            ],
            None,
        )
        .await
        .unwrap();

    let mut pipeline = world.pipeline("w1", settings());
    assert_eq!(pipeline.poll_once().await.unwrap(), 2);
    // Only the well-formed entry reaches the buffer.
    assert_eq!(pipeline.buffered(), 1);

    let report = pipeline.flush().await;
    assert_eq!(report.persisted, 1);
    assert_eq!(report.retries, 0);
    assert_eq!(world.metrics.retries_total(), 0);

    let dead = world.sink().list(10, 0).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempts, Some(0));
    assert_eq!(dead[0].fields.get("txn_id").map(String::as_str), Some("txn-broken"));
    assert_eq!(world.log.pending_count(STREAM, GROUP), 0);
}

#[tokio::test]
async fn peer_reclaims_entries_of_crashed_worker() {
    let world = World::new();
    world.log.create_group(STREAM, GROUP).await.unwrap();
    world.produce_sample().await;

    // The first worker buffers the entries and dies before flushing.
    let mut crashed = world.pipeline("crashed", settings());
    crashed.poll_once().await.unwrap();
    drop(crashed);
    assert_eq!(world.log.pending_count(STREAM, GROUP), 3);

    let mut peer = world.pipeline(
        "peer",
        PipelineSettings {
            claim_idle: Duration::ZERO,
            ..settings()
        },
    );
    assert_eq!(peer.poll_once().await.unwrap(), 0);
    assert_eq!(peer.reclaim_stale().await.unwrap(), 3);
    peer.flush().await;

    assert_eq!(world.store.chat_messages().len(), 2);
    assert_eq!(world.store.gifts().len(), 1);
    assert_eq!(world.log.pending_count(STREAM, GROUP), 0);
}

#[tokio::test(start_paused = true)]
async fn retrying_worker_keeps_its_batch_from_peers() {
    let world = World::new();
    world.log.create_group(STREAM, GROUP).await.unwrap();
    world.produce_sample().await;
    world.store.fail_always();

    let mut owner = world.pipeline("owner", settings());
    owner.poll_once().await.unwrap();
    // Backoff waits are 2, 4, 8, 16 and 32s; the batch is exhausted at 62s.
    let flushing = tokio::spawn(async move { owner.flush().await });

    // Idle limit above the longest single wait but below the whole budget.
    let mut peer = world.pipeline(
        "peer",
        PipelineSettings {
            claim_idle: Duration::from_secs(40),
            ..settings()
        },
    );
    tokio::time::sleep(Duration::from_secs(45)).await;
    assert_eq!(peer.reclaim_stale().await.unwrap(), 0);
    assert_eq!(peer.buffered(), 0);

    let report = flushing.await.unwrap();
    assert_eq!(report.dead_lettered, 3);

    assert_eq!(peer.reclaim_stale().await.unwrap(), 0);
    assert_eq!(peer.flush().await.dead_lettered, 0);
    assert_eq!(world.sink().count().await.unwrap(), 3);
    assert_eq!(world.metrics.dead_lettered_total(), 3);
}

#[tokio::test(start_paused = true)]
async fn refused_gifts_leave_chats_out_of_dead_letters() {
    let world = World::new();
    world.log.create_group(STREAM, GROUP).await.unwrap();
    world.produce_sample().await;
    world.store.reject_gift_writes(true);

    let mut pipeline = world.pipeline("w1", settings());
    pipeline.poll_once().await.unwrap();
    let report = pipeline.flush().await;

    assert_eq!(report.retries, 0);
    assert_eq!(report.persisted, 2);
    assert_eq!(report.dead_lettered, 1);
    assert_eq!(world.store.chat_messages().len(), 2);
    assert!(world.store.gifts().is_empty());
    assert_eq!(world.log.pending_count(STREAM, GROUP), 0);

    let dead = world.sink().list(10, 0).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].fields.get("txn_id").map(String::as_str), Some("txn-c"));
    assert_eq!(dead[0].attempts, Some(1));
}

#[tokio::test]
async fn transient_failure_recovers_without_dead_letter() {
    let world = World::new();
    world.log.create_group(STREAM, GROUP).await.unwrap();
    world.produce_sample().await;
    world.store.fail_chat_writes(1);

    let mut pipeline = world.pipeline("w1", settings());
    pipeline.poll_once().await.unwrap();

    tokio::time::pause();
    let report = pipeline.flush().await;

    assert_eq!(report.retries, 1);
    assert_eq!(report.persisted, 3);
    assert_eq!(report.dead_lettered, 0);
    assert_eq!(world.sink().count().await.unwrap(), 0);
}

#[tokio::test]
async fn shutdown_flushes_buffered_batch() {
    let world = World::new();
    world.produce_sample().await;

    let pipeline = world.pipeline(
        "w1",
        PipelineSettings {
            poll_block: Duration::from_millis(10),
            ..settings()
        },
    );
    let shutdown = ShutdownSignal::new();
    let handle = tokio::spawn(pipeline.run(shutdown.clone()));

    for _ in 0..200 {
        if world.log.pending_count(STREAM, GROUP) == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    shutdown.trigger();
    handle.await.unwrap();

    assert_eq!(world.store.chat_messages().len(), 2);
    assert_eq!(world.store.gifts().len(), 1);
    assert_eq!(world.log.pending_count(STREAM, GROUP), 0);

    let snapshot = world.metrics.snapshot(Duration::from_secs(1));
    assert_eq!(snapshot.events_read, 3);
    assert_eq!(snapshot.events_persisted, 3);
    assert_eq!(snapshot.batches, 1);
}
