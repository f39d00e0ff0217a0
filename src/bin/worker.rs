//! Sluice Worker - Event Persistence Engine
//!
//! The worker consumes chat and gift events from Redis Streams and upserts
//! them into Postgres in batches.
//!
//! ## Configuration
//!
//! `config/sluice.toml` (or `SLUICE_CONFIG`), overridden by:
//! - `REDIS_URL`, `DATABASE_URL`: connection strings
//! - `SLUICE_WORKER_NAME`: unique consumer name (default: hostname or UUID)
//! - `SLUICE_CONSUMER_GROUP`: consumer group name (default: "tc_persisters")
//! - `SLUICE_BATCH_SIZE`, `SLUICE_FLUSH_INTERVAL_MS`, `SLUICE_POLL_BLOCK_MS`
//! - `SLUICE_MAX_RETRIES`, `SLUICE_RETRY_BASE_DELAY_MS`
//! - `SLUICE_METRICS_INTERVAL_SECS`, `SLUICE_CLAIM_IDLE_MS`
//! - `RUST_LOG`: logging level (default: "info")

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use sluice::config::SluiceConfig;
use sluice::metrics::{MetricsReporter, PipelineMetrics};
use sluice::shutdown::ShutdownSignal;
use sluice::store::PgEventStore;
use sluice::transport::RedisEventLog;
use sluice::Pipeline;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = SluiceConfig::load()?;

    info!(
        worker_name = %config.worker_name(),
        stream = %config.worker.stream,
        consumer_group = %config.worker.consumer_group,
        "Sluice Worker starting"
    );

    let log = RedisEventLog::from_url(&config.redis.url)?;
    let store = PgEventStore::connect(
        &config.database.url,
        config.database.max_connections,
        Duration::from_millis(config.database.acquire_timeout_ms),
    )
    .await?;

    let metrics = Arc::new(PipelineMetrics::new());

    // Setup graceful shutdown
    let shutdown = ShutdownSignal::new();
    let signals = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = signals.listen_for_signals().await {
            error!(error = %e, "Failed to install signal handlers");
            signals.trigger();
        }
    });

    let reporter = MetricsReporter::new(
        metrics.clone(),
        Duration::from_secs(config.metrics.interval_secs),
    )
    .spawn(shutdown.clone());

    let pipeline = Pipeline::from_config(&config, Arc::new(log), Arc::new(store), metrics);
    pipeline.run(shutdown.clone()).await;

    // The pipeline only returns on shutdown; make sure the reporter sees it too.
    shutdown.trigger();
    if let Err(e) = reporter.await {
        error!(error = %e, "Metrics reporter task failed");
    }

    info!("Worker shutdown complete");
    Ok(())
}
