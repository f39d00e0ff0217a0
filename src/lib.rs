//! # Sluice
//!
//! Batched, idempotent persistence of broadcast events.
//!
//! Chat messages and gift sends are appended by the producers to a Redis
//! stream. Sluice workers drain that stream through a consumer group,
//! buffer entries into batches, upsert them into Postgres keyed by
//! `(stream_id, txn_id)` and acknowledge them. Failed batches are retried
//! with exponential backoff and, once retries run out, moved to a
//! dead-letter stream.
//!
//! ## Architecture
//!
//! ```text
//! Redis Stream -> StreamConsumer -> BatchAccumulator -> Persister -> Postgres
//!                                                          |
//!                                          RetryManager -> DeadLetterSink
//! ```
//!
//! ## Modules
//!
//! - [`event`]: Envelope types decoded from stream entries
//! - [`transport`]: Event log abstraction (Redis Streams, in-memory)
//! - [`store`]: Destination records and store abstraction (Postgres, in-memory)
//! - [`consumer`]: Consumer-group reads and stale entry reclaim
//! - [`batch`]: Size/time flush triggers
//! - [`persister`]: Partitioning and idempotent bulk writes
//! - [`retry`]: Exponential backoff state machine
//! - [`dlq`]: Dead-letter sink
//! - [`metrics`]: Counters, latency windows and the periodic reporter
//! - [`pipeline`]: The poll -> accumulate -> flush loop

pub mod batch;
pub mod config;
pub mod consumer;
pub mod dlq;
pub mod event;
pub mod metrics;
pub mod persister;
pub mod pipeline;
pub mod retry;
pub mod shutdown;
pub mod store;
pub mod transport;

// Re-export commonly used types at crate root
pub use event::{Delivery, EventEnvelope, EventType};
pub use pipeline::Pipeline;
pub use store::EventStore;
pub use transport::EventLog;

/// Redis stream the producers append to
pub const EVENT_STREAM_NAME: &str = "tc_events_v1";

/// Default consumer group name
pub const DEFAULT_CONSUMER_GROUP: &str = "tc_persisters";
