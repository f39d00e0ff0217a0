//! Postgres implementation of [`EventStore`].
//!
//! Each write-set becomes a single `INSERT ... SELECT FROM UNNEST(...)`
//! statement with `ON CONFLICT (stream_id, txn_id) DO NOTHING`, so a batch
//! of any size costs one round trip per table.
//!
//! Expected tables (created outside this crate):
//!
//! ```text
//! stream_messages (stream_id text, user_id text, content text,
//!                  txn_id text, created_at timestamptz,
//!                  UNIQUE (stream_id, txn_id))
//! stream_gifts    (stream_id text, sender_id text, receiver_id text,
//!                  gift_id text, coins_spent bigint, txn_id text,
//!                  created_at timestamptz, UNIQUE (stream_id, txn_id))
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{debug, info};

use super::{ChatMessageRecord, EventStore, GiftRecord, StoreError};

const UPSERT_CHAT_SQL: &str = r#"
    INSERT INTO stream_messages (stream_id, user_id, content, txn_id, created_at)
    SELECT * FROM UNNEST($1::text[], $2::text[], $3::text[], $4::text[], $5::timestamptz[])
    ON CONFLICT (stream_id, txn_id) DO NOTHING
"#;

const UPSERT_GIFT_SQL: &str = r#"
    INSERT INTO stream_gifts (stream_id, sender_id, receiver_id, gift_id, coins_spent, txn_id, created_at)
    SELECT * FROM UNNEST($1::text[], $2::text[], $3::text[], $4::text[], $5::bigint[], $6::text[], $7::timestamptz[])
    ON CONFLICT (stream_id, txn_id) DO NOTHING
"#;

/// Store writing into Postgres through a shared `sqlx` pool.
#[derive(Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a pool of at most `max_connections`.
    pub async fn connect(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await?;

        info!(max_connections, "Connected to Postgres");
        Ok(Self::new(pool))
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn upsert_chat_messages(&self, rows: &[ChatMessageRecord]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut stream_ids = Vec::with_capacity(rows.len());
        let mut user_ids = Vec::with_capacity(rows.len());
        let mut contents = Vec::with_capacity(rows.len());
        let mut txn_ids = Vec::with_capacity(rows.len());
        let mut created: Vec<DateTime<Utc>> = Vec::with_capacity(rows.len());
        for row in rows {
            stream_ids.push(row.context_id.clone());
            user_ids.push(row.actor_id.clone());
            contents.push(row.content.clone());
            txn_ids.push(row.transaction_id.clone());
            created.push(row.created_at);
        }

        let result = sqlx::query(UPSERT_CHAT_SQL)
            .bind(&stream_ids)
            .bind(&user_ids)
            .bind(&contents)
            .bind(&txn_ids)
            .bind(&created)
            .execute(&self.pool)
            .await?;

        debug!(
            rows = rows.len(),
            inserted = result.rows_affected(),
            "Upserted chat messages"
        );
        Ok(result.rows_affected())
    }

    async fn upsert_gifts(&self, rows: &[GiftRecord]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut stream_ids = Vec::with_capacity(rows.len());
        let mut sender_ids = Vec::with_capacity(rows.len());
        let mut receiver_ids = Vec::with_capacity(rows.len());
        let mut gift_ids = Vec::with_capacity(rows.len());
        let mut amounts: Vec<i64> = Vec::with_capacity(rows.len());
        let mut txn_ids = Vec::with_capacity(rows.len());
        let mut created: Vec<DateTime<Utc>> = Vec::with_capacity(rows.len());
        for row in rows {
            stream_ids.push(row.context_id.clone());
            sender_ids.push(row.sender_id.clone());
            receiver_ids.push(row.recipient_id.clone());
            gift_ids.push(row.gift_id.clone());
            amounts.push(row.amount);
            txn_ids.push(row.transaction_id.clone());
            created.push(row.created_at);
        }

        let result = sqlx::query(UPSERT_GIFT_SQL)
            .bind(&stream_ids)
            .bind(&sender_ids)
            .bind(&receiver_ids)
            .bind(&gift_ids)
            .bind(&amounts)
            .bind(&txn_ids)
            .bind(&created)
            .execute(&self.pool)
            .await?;

        debug!(
            rows = rows.len(),
            inserted = result.rows_affected(),
            "Upserted gifts"
        );
        Ok(result.rows_affected())
    }
}
