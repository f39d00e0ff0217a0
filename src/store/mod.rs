//! Destination records and the durable store abstraction.
//!
//! Two tables receive events, both keyed for idempotency on
//! `(stream_id, txn_id)`:
//!
//! - `stream_messages` ← [`ChatMessageRecord`] (event type `chat`)
//! - `stream_gifts` ← [`GiftRecord`] (event type `gift`)
//!
//! Upserting a record whose key already exists is a no-op, so redelivered
//! events never produce a second row.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::event::EventEnvelope;

pub use self::memory::MemoryStore;
pub use self::postgres::PgEventStore;

pub const CHAT_TABLE: &str = "stream_messages";
pub const GIFT_TABLE: &str = "stream_gifts";

/// Errors returned by a store write.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Store could not be reached (used by non-SQL stores)
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Store refused the rows themselves (used by non-SQL stores)
    #[error("rows rejected: {0}")]
    Rejected(String),
}

impl StoreError {
    /// True when retrying the same write cannot succeed.
    ///
    /// Postgres SQLSTATE classes 22 (data exception) and 23 (integrity
    /// constraint violation) are properties of the rows themselves.
    pub fn is_permanent(&self) -> bool {
        match self {
            StoreError::Database(sqlx::Error::Database(db)) => db
                .code()
                .map(|code| code.starts_with("22") || code.starts_with("23"))
                .unwrap_or(false),
            StoreError::Rejected(_) => true,
            _ => false,
        }
    }
}

/// A chat/gift envelope whose data lacks what its table needs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("{event_type} event missing '{field}'")]
    MissingField {
        event_type: &'static str,
        field: &'static str,
    },

    #[error("{event_type} event has invalid '{field}'")]
    InvalidField {
        event_type: &'static str,
        field: &'static str,
    },

    #[error("timestamp {0} out of range")]
    InvalidTimestamp(i64),
}

/// Row of `stream_messages`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessageRecord {
    pub context_id: String,
    pub actor_id: String,
    pub content: String,
    pub transaction_id: String,
    pub created_at: DateTime<Utc>,
}

/// Row of `stream_gifts`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GiftRecord {
    pub context_id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub gift_id: String,
    pub amount: i64,
    pub transaction_id: String,
    pub created_at: DateTime<Utc>,
}

fn created_at(envelope: &EventEnvelope) -> Result<DateTime<Utc>, RecordError> {
    Utc.timestamp_millis_opt(envelope.emitted_at)
        .single()
        .ok_or(RecordError::InvalidTimestamp(envelope.emitted_at))
}

/// First present string among `keys`. Numbers are accepted and rendered.
///
/// Postgres text cannot hold NUL, so a value containing one is invalid
/// here rather than failing the whole statement later.
fn text_field(
    data: &Value,
    keys: &[&str],
    event_type: &'static str,
    field: &'static str,
) -> Result<String, RecordError> {
    let value = keys
        .iter()
        .find_map(|key| match data.get(*key) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
        .ok_or(RecordError::MissingField { event_type, field })?;
    storable(value, event_type, field)
}

fn storable(
    value: String,
    event_type: &'static str,
    field: &'static str,
) -> Result<String, RecordError> {
    if value.contains('\0') {
        return Err(RecordError::InvalidField { event_type, field });
    }
    Ok(value)
}

impl TryFrom<&EventEnvelope> for ChatMessageRecord {
    type Error = RecordError;

    fn try_from(envelope: &EventEnvelope) -> Result<Self, Self::Error> {
        let data = envelope.data();
        let content = text_field(data, &["content", "message"], "chat", "content")?;

        Ok(Self {
            context_id: storable(envelope.context_id.clone(), "chat", "stream_id")?,
            actor_id: storable(envelope.actor_id.clone(), "chat", "s")?,
            content,
            transaction_id: storable(envelope.transaction_id.clone(), "chat", "txn_id")?,
            created_at: created_at(envelope)?,
        })
    }
}

impl TryFrom<&EventEnvelope> for GiftRecord {
    type Error = RecordError;

    fn try_from(envelope: &EventEnvelope) -> Result<Self, Self::Error> {
        let data = envelope.data();

        let recipient_id = text_field(data, &["receiver_id", "recipient_id"], "gift", "receiver_id")?;
        let gift_id = text_field(data, &["gift_id"], "gift", "gift_id")?;

        let amount_value = ["coins_spent", "amount"]
            .iter()
            .find_map(|key| data.get(*key))
            .ok_or(RecordError::MissingField {
                event_type: "gift",
                field: "coins_spent",
            })?;
        let amount = amount_value
            .as_i64()
            .or_else(|| amount_value.as_str().and_then(|s| s.parse().ok()))
            .filter(|amount| *amount >= 0)
            .ok_or(RecordError::InvalidField {
                event_type: "gift",
                field: "coins_spent",
            })?;

        Ok(Self {
            context_id: storable(envelope.context_id.clone(), "gift", "stream_id")?,
            sender_id: storable(envelope.actor_id.clone(), "gift", "s")?,
            recipient_id,
            gift_id,
            amount,
            transaction_id: storable(envelope.transaction_id.clone(), "gift", "txn_id")?,
            created_at: created_at(envelope)?,
        })
    }
}

/// A durable store accepting idempotent bulk upserts.
///
/// Both methods return the number of rows actually inserted; rows whose
/// `(context_id, transaction_id)` already exists are ignored.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn upsert_chat_messages(&self, rows: &[ChatMessageRecord]) -> Result<u64, StoreError>;

    async fn upsert_gifts(&self, rows: &[GiftRecord]) -> Result<u64, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chat_record_from_envelope() {
        let envelope = EventEnvelope::new(
            "txn-1",
            "b-1",
            "chat",
            1_700_000_000_000,
            "u-1",
            json!({"d": {"content": "gg"}}),
        );
        let record = ChatMessageRecord::try_from(&envelope).unwrap();
        assert_eq!(record.content, "gg");
        assert_eq!(record.actor_id, "u-1");
        assert_eq!(record.created_at.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_chat_record_accepts_message_alias() {
        let envelope = EventEnvelope::new("t", "b", "chat", 0, "u", json!({"message": "hi"}));
        assert_eq!(ChatMessageRecord::try_from(&envelope).unwrap().content, "hi");
    }

    #[test]
    fn test_chat_record_requires_content() {
        let envelope = EventEnvelope::new("t", "b", "chat", 0, "u", json!({"d": {}}));
        assert_eq!(
            ChatMessageRecord::try_from(&envelope),
            Err(RecordError::MissingField {
                event_type: "chat",
                field: "content"
            })
        );
    }

    #[test]
    fn test_gift_record_from_envelope() {
        let envelope = EventEnvelope::new(
            "txn-2",
            "b-1",
            "gift",
            1_700_000_000_000,
            "u-1",
            json!({"d": {"receiver_id": "u-2", "gift_id": "rose", "coins_spent": 50}}),
        );
        let record = GiftRecord::try_from(&envelope).unwrap();
        assert_eq!(record.sender_id, "u-1");
        assert_eq!(record.recipient_id, "u-2");
        assert_eq!(record.gift_id, "rose");
        assert_eq!(record.amount, 50);
    }

    #[test]
    fn test_gift_record_aliases_and_string_amount() {
        let envelope = EventEnvelope::new(
            "t",
            "b",
            "gift",
            0,
            "u",
            json!({"recipient_id": "u-9", "gift_id": 7, "amount": "120"}),
        );
        let record = GiftRecord::try_from(&envelope).unwrap();
        assert_eq!(record.recipient_id, "u-9");
        assert_eq!(record.gift_id, "7");
        assert_eq!(record.amount, 120);
    }

    #[test]
    fn test_gift_record_rejects_bad_amount() {
        let envelope = EventEnvelope::new(
            "t",
            "b",
            "gift",
            0,
            "u",
            json!({"receiver_id": "u-2", "gift_id": "rose", "coins_spent": -5}),
        );
        assert!(matches!(
            GiftRecord::try_from(&envelope),
            Err(RecordError::InvalidField { .. })
        ));

        let envelope = EventEnvelope::new("t", "b", "gift", 0, "u", json!({"gift_id": "rose"}));
        assert!(matches!(
            GiftRecord::try_from(&envelope),
            Err(RecordError::MissingField {
                field: "receiver_id",
                ..
            })
        ));
    }

    #[test]
    fn test_nul_bytes_are_invalid() {
        let envelope = EventEnvelope::new("t", "b", "chat", 0, "u", json!({"content": "a\0b"}));
        assert_eq!(
            ChatMessageRecord::try_from(&envelope),
            Err(RecordError::InvalidField {
                event_type: "chat",
                field: "content"
            })
        );

        let envelope = EventEnvelope::new(
            "t\0",
            "b",
            "gift",
            0,
            "u",
            json!({"receiver_id": "u-2", "gift_id": "rose", "coins_spent": 1}),
        );
        assert_eq!(
            GiftRecord::try_from(&envelope),
            Err(RecordError::InvalidField {
                event_type: "gift",
                field: "txn_id"
            })
        );
    }

    #[test]
    fn test_unavailable_is_transient() {
        assert!(!StoreError::Unavailable("down".into()).is_permanent());
        assert!(!StoreError::Database(sqlx::Error::PoolTimedOut).is_permanent());
        assert!(StoreError::Rejected("bad row".into()).is_permanent());
    }
}
