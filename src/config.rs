//! Configuration module for Sluice.
//!
//! Loads configuration from a TOML file with environment variable
//! substitution, then applies a fixed set of environment overrides.
//!
//! # Example
//!
//! ```toml
//! [redis]
//! url = "${REDIS_URL}"
//!
//! [worker]
//! consumer_group = "tc_persisters"
//! batch_size = 200
//! flush_interval_ms = 250
//!
//! [retry]
//! max_attempts = 5
//! base_delay_ms = 1000
//!
//! [dead_letter]
//! stream = "tc_events_v1:dlq"
//! ```

use regex::Regex;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::dlq::{DEFAULT_DLQ_MAX_LEN, DEFAULT_DLQ_STREAM};
use crate::retry::RetryPolicy;
use crate::{DEFAULT_CONSUMER_GROUP, EVENT_STREAM_NAME};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid substitution pattern: {0}")]
    PatternError(#[from] regex::Error),

    #[error("Invalid value for {var}: '{value}'")]
    InvalidEnv { var: &'static str, value: String },

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct SluiceConfig {
    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub recovery: RecoveryConfig,

    #[serde(default)]
    pub dead_letter: DeadLetterConfig,
}

/// Redis configuration
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

/// Postgres configuration
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
        }
    }
}

fn default_database_url() -> String {
    "postgres://localhost:5432/sluice".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_acquire_timeout_ms() -> u64 {
    5000
}

/// Worker loop configuration
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct WorkerConfig {
    /// Consumer name within the group; derived from the host when unset
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default = "default_stream")]
    pub stream: String,

    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    #[serde(default = "default_poll_block_ms")]
    pub poll_block_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: None,
            stream: default_stream(),
            consumer_group: default_consumer_group(),
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            poll_block_ms: default_poll_block_ms(),
        }
    }
}

fn default_stream() -> String {
    EVENT_STREAM_NAME.to_string()
}

fn default_consumer_group() -> String {
    DEFAULT_CONSUMER_GROUP.to_string()
}

fn default_batch_size() -> usize {
    200
}

fn default_flush_interval_ms() -> u64 {
    250
}

fn default_poll_block_ms() -> u64 {
    100
}

/// Retry configuration
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries after the initial attempt
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

/// Metrics reporter configuration
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval_secs")]
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_metrics_interval_secs(),
        }
    }
}

fn default_metrics_interval_secs() -> u64 {
    60
}

/// Reclaim of entries abandoned by crashed consumers
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RecoveryConfig {
    /// Minimum idle time before a pending entry may be claimed. Must exceed
    /// the retry budget so a batch still in backoff is not taken over.
    #[serde(default = "default_claim_idle_ms")]
    pub claim_idle_ms: u64,

    #[serde(default = "default_claim_interval_ms")]
    pub claim_interval_ms: u64,

    #[serde(default = "default_claim_count")]
    pub claim_count: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            claim_idle_ms: default_claim_idle_ms(),
            claim_interval_ms: default_claim_interval_ms(),
            claim_count: default_claim_count(),
        }
    }
}

fn default_claim_idle_ms() -> u64 {
    120_000
}

fn default_claim_interval_ms() -> u64 {
    30_000
}

fn default_claim_count() -> usize {
    100
}

/// Dead Letter Queue configuration
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct DeadLetterConfig {
    #[serde(default = "default_dlq_stream")]
    pub stream: String,

    #[serde(default = "default_dlq_max_len")]
    pub max_len: usize,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            stream: default_dlq_stream(),
            max_len: default_dlq_max_len(),
        }
    }
}

fn default_dlq_stream() -> String {
    DEFAULT_DLQ_STREAM.to_string()
}

fn default_dlq_max_len() -> usize {
    DEFAULT_DLQ_MAX_LEN
}

impl SluiceConfig {
    /// Load configuration from the default path or SLUICE_CONFIG env var,
    /// then apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            env::var("SLUICE_CONFIG").unwrap_or_else(|_| "config/sluice.toml".to_string());

        let mut config = Self::read(&config_path)?;
        config.apply_env_overrides_from(|var| env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate configuration from a specific path, without
    /// environment overrides. A missing file yields defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::read(path)?;
        config.validate()?;
        Ok(config)
    }

    fn read<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            info!(
                path = %path.display(),
                "Config file not found, using defaults"
            );
            return Ok(Self::default());
        }

        info!(path = %path.display(), "Loading configuration");

        let content = fs::read_to_string(path)?;
        let content = substitute_env_vars(&content)?;

        debug!("Parsing TOML configuration");
        let config: SluiceConfig = toml::from_str(&content)?;

        info!(
            stream = %config.worker.stream,
            consumer_group = %config.worker.consumer_group,
            batch_size = config.worker.batch_size,
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Apply overrides looked up through `lookup` (normally the process
    /// environment).
    pub fn apply_env_overrides_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("REDIS_URL") {
            self.redis.url = url;
        }
        if let Some(url) = lookup("DATABASE_URL") {
            self.database.url = url;
        }
        if let Some(name) = lookup("SLUICE_WORKER_NAME") {
            self.worker.name = Some(name);
        }
        if let Some(group) = lookup("SLUICE_CONSUMER_GROUP") {
            self.worker.consumer_group = group;
        }

        override_parsed(&lookup, "SLUICE_BATCH_SIZE", &mut self.worker.batch_size)?;
        override_parsed(
            &lookup,
            "SLUICE_FLUSH_INTERVAL_MS",
            &mut self.worker.flush_interval_ms,
        )?;
        override_parsed(&lookup, "SLUICE_POLL_BLOCK_MS", &mut self.worker.poll_block_ms)?;
        override_parsed(&lookup, "SLUICE_MAX_RETRIES", &mut self.retry.max_attempts)?;
        override_parsed(
            &lookup,
            "SLUICE_RETRY_BASE_DELAY_MS",
            &mut self.retry.base_delay_ms,
        )?;
        override_parsed(
            &lookup,
            "SLUICE_METRICS_INTERVAL_SECS",
            &mut self.metrics.interval_secs,
        )?;
        override_parsed(
            &lookup,
            "SLUICE_CLAIM_IDLE_MS",
            &mut self.recovery.claim_idle_ms,
        )?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.redis.url.starts_with("redis://") && !self.redis.url.starts_with("rediss://") {
            return Err(ConfigError::ValidationError(
                "Redis URL must start with redis:// or rediss://".to_string(),
            ));
        }

        if !self.database.url.starts_with("postgres://")
            && !self.database.url.starts_with("postgresql://")
        {
            return Err(ConfigError::ValidationError(
                "Database URL must start with postgres:// or postgresql://".to_string(),
            ));
        }

        if self.database.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "database.max_connections must be at least 1".to_string(),
            ));
        }

        if self.worker.batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "worker.batch_size must be at least 1".to_string(),
            ));
        }

        if self.worker.flush_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "worker.flush_interval_ms must be positive".to_string(),
            ));
        }

        if self.retry.base_delay_ms == 0 || self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(ConfigError::ValidationError(
                "retry delays must satisfy 0 < base_delay_ms <= max_delay_ms".to_string(),
            ));
        }

        if self.metrics.interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "metrics.interval_secs must be positive".to_string(),
            ));
        }

        let retry_budget = self.retry.policy().total_backoff();
        if Duration::from_millis(self.recovery.claim_idle_ms) <= retry_budget {
            return Err(ConfigError::ValidationError(format!(
                "recovery.claim_idle_ms ({}) must exceed the retry backoff budget ({} ms)",
                self.recovery.claim_idle_ms,
                retry_budget.as_millis()
            )));
        }

        if self.recovery.claim_count == 0 {
            return Err(ConfigError::ValidationError(
                "recovery.claim_count must be at least 1".to_string(),
            ));
        }

        if self.dead_letter.stream.is_empty() || self.dead_letter.stream == self.worker.stream {
            return Err(ConfigError::ValidationError(format!(
                "dead_letter.stream must be set and differ from '{}'",
                self.worker.stream
            )));
        }

        if self.redis.url.contains("${") || self.database.url.contains("${") {
            warn!("Connection URL contains unsubstituted environment variable");
        }

        Ok(())
    }

    /// Consumer name: configured, else `worker-<hostname>`, else `worker-<uuid>`.
    pub fn worker_name(&self) -> String {
        if let Some(name) = self.worker.name.as_ref().filter(|n| !n.is_empty()) {
            return name.clone();
        }

        match hostname::get() {
            Ok(host) if !host.is_empty() => format!("worker-{}", host.to_string_lossy()),
            _ => format!("worker-{}", uuid::Uuid::new_v4()),
        }
    }
}

fn override_parsed<F, T>(lookup: &F, var: &'static str, target: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    if let Some(value) = lookup(var) {
        *target = value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidEnv { var, value })?;
    }
    Ok(())
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")?;

    Ok(re
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            match env::var(var_name) {
                Ok(value) => value,
                Err(_) => {
                    debug!(var = %var_name, "Environment variable not set, keeping placeholder");
                    caps[0].to_string()
                }
            }
        })
        .to_string())
}
