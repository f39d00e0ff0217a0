//! Sluice DLQ - inspect the dead-letter stream.
//!
//! ```text
//! sluice-dlq count
//! sluice-dlq list [count] [offset]
//! ```
//!
//! Uses the same configuration as the worker (`SLUICE_CONFIG`, `REDIS_URL`).
//! Entries are printed one JSON object per line.

use std::env;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::EnvFilter;

use sluice::config::SluiceConfig;
use sluice::dlq::DeadLetterSink;
use sluice::metrics::PipelineMetrics;
use sluice::transport::RedisEventLog;

const USAGE: &str = "usage: sluice-dlq count | list [count] [offset]";

fn parse_arg(value: Option<&String>, default: usize) -> Result<usize, String> {
    match value {
        Some(raw) => raw
            .parse()
            .map_err(|_| format!("expected a number, got '{}'", raw)),
        None => Ok(default),
    }
}

async fn run(args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let config = SluiceConfig::load()?;
    let log = RedisEventLog::from_url(&config.redis.url)?;
    let sink = DeadLetterSink::new(
        Arc::new(log),
        config.dead_letter.stream.clone(),
        config.worker.stream.clone(),
        config.worker.consumer_group.clone(),
        Arc::new(PipelineMetrics::new()),
    );

    match args.first().map(String::as_str) {
        Some("count") => {
            println!("{}", sink.count().await?);
        }
        Some("list") => {
            let count = parse_arg(args.get(1), 10)?;
            let offset = parse_arg(args.get(2), 0)?;
            for entry in sink.list(count, offset).await? {
                println!("{}", serde_json::to_string(&entry)?);
            }
        }
        _ => return Err(USAGE.into()),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    match run(&args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "sluice-dlq failed");
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}
