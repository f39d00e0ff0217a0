//! Event envelope types read from the event log.
//!
//! Producers (chat send, gift send) append one entry per event to the
//! `tc_events_v1` stream. Each entry is a flat field map:
//!
//! ```text
//! txn_id     globally unique idempotency key
//! stream_id  broadcast the event belongs to
//! t          event type ("chat", "gift", "mod", ...)
//! ts         producer timestamp, epoch milliseconds
//! s          sender user id
//! v, kid     protocol version / signing key id
//! payload    JSON text of the full signed envelope (data under "d")
//! ```
//!
//! [`EventEnvelope::from_fields`] turns that map into a typed envelope and
//! [`EventEnvelope::to_fields`] produces it again for tests that play the
//! producer role. The dead-letter sink copies the raw map kept on
//! [`Delivery`] instead, so fields the envelope does not model (`v`, `kid`)
//! and the exact payload text survive.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

pub const FIELD_TXN_ID: &str = "txn_id";
pub const FIELD_STREAM_ID: &str = "stream_id";
pub const FIELD_TYPE: &str = "t";
pub const FIELD_TS: &str = "ts";
pub const FIELD_SENDER: &str = "s";
pub const FIELD_PAYLOAD: &str = "payload";

/// Reasons a raw stream entry cannot be turned into an [`EventEnvelope`].
///
/// These are permanent: redelivering the same entry yields the same error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("invalid timestamp '{0}'")]
    InvalidTimestamp(String),

    #[error("payload is not valid JSON: {0}")]
    InvalidPayload(String),
}

/// Discriminator of an event. `Chat` and `Gift` have destination tables;
/// anything else the producers emit is carried as `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    Chat,
    Gift,
    Other(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::Chat => "chat",
            EventType::Gift => "gift",
            EventType::Other(other) => other,
        }
    }
}

impl From<&str> for EventType {
    fn from(value: &str) -> Self {
        match value {
            "chat" => EventType::Chat,
            "gift" => EventType::Gift,
            other => EventType::Other(other.to_string()),
        }
    }
}

impl From<String> for EventType {
    fn from(value: String) -> Self {
        EventType::from(value.as_str())
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One produced event. Immutable once decoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Idempotency key, unique per event
    pub transaction_id: String,

    /// Broadcast / room the event belongs to
    pub context_id: String,

    pub event_type: EventType,

    /// Producer-side timestamp in epoch milliseconds
    pub emitted_at: i64,

    /// User who generated the event
    pub actor_id: String,

    /// Type-specific data, interpreted by the persister only
    pub payload: Value,
}

impl EventEnvelope {
    pub fn new(
        transaction_id: impl Into<String>,
        context_id: impl Into<String>,
        event_type: impl Into<EventType>,
        emitted_at: i64,
        actor_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            context_id: context_id.into(),
            event_type: event_type.into(),
            emitted_at,
            actor_id: actor_id.into(),
            payload,
        }
    }

    /// Decode a stream entry's field map.
    ///
    /// `s` (sender) may be absent for system events and defaults to an
    /// empty string; every other field is required.
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, DecodeError> {
        let transaction_id = required(fields, FIELD_TXN_ID)?;
        let context_id = required(fields, FIELD_STREAM_ID)?;
        let event_type = required(fields, FIELD_TYPE)?;
        let ts = required(fields, FIELD_TS)?;
        let payload_str = required(fields, FIELD_PAYLOAD)?;

        let emitted_at = ts
            .trim()
            .parse::<i64>()
            .map_err(|_| DecodeError::InvalidTimestamp(ts.to_string()))?;

        let payload: Value = serde_json::from_str(payload_str)
            .map_err(|e| DecodeError::InvalidPayload(e.to_string()))?;

        Ok(Self {
            transaction_id: transaction_id.to_string(),
            context_id: context_id.to_string(),
            event_type: EventType::from(event_type),
            emitted_at,
            actor_id: fields.get(FIELD_SENDER).cloned().unwrap_or_default(),
            payload,
        })
    }

    /// Encode back into the producer's field layout.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            (FIELD_TXN_ID.to_string(), self.transaction_id.clone()),
            (FIELD_STREAM_ID.to_string(), self.context_id.clone()),
            (FIELD_TYPE.to_string(), self.event_type.to_string()),
            (FIELD_TS.to_string(), self.emitted_at.to_string()),
            (FIELD_SENDER.to_string(), self.actor_id.clone()),
            (FIELD_PAYLOAD.to_string(), self.payload.to_string()),
        ]
    }

    /// The type-specific data object.
    ///
    /// Producers publish the whole signed envelope as `payload`, with the
    /// event data nested under `d`. Payloads without `d` are used as-is.
    pub fn data(&self) -> &Value {
        match self.payload.get("d") {
            Some(d) if d.is_object() => d,
            _ => &self.payload,
        }
    }

    /// Queue lag relative to `now_ms`, clamped at zero for producer clock skew.
    pub fn lag_ms(&self, now_ms: i64) -> u64 {
        now_ms.saturating_sub(self.emitted_at).max(0) as u64
    }
}

fn required<'a>(
    fields: &'a HashMap<String, String>,
    key: &'static str,
) -> Result<&'a str, DecodeError> {
    match fields.get(key) {
        Some(value) if !value.is_empty() => Ok(value.as_str()),
        _ => Err(DecodeError::MissingField(key)),
    }
}

/// A decoded event together with its delivery handle (the stream entry id).
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Stream entry id (e.g., "1700000000000-0"), used to acknowledge
    pub id: String,

    pub envelope: EventEnvelope,

    /// The entry's fields exactly as read from the stream
    pub fields: HashMap<String, String>,
}

impl Delivery {
    /// A delivery whose raw fields are re-encoded from `envelope`.
    pub fn new(id: impl Into<String>, envelope: EventEnvelope) -> Self {
        let fields = envelope.to_fields().into_iter().collect();
        Self::with_fields(id, envelope, fields)
    }

    /// A delivery decoded from `fields`.
    pub fn with_fields(
        id: impl Into<String>,
        envelope: EventEnvelope,
        fields: HashMap<String, String>,
    ) -> Self {
        Self {
            id: id.into(),
            envelope,
            fields,
        }
    }
}

/// A stream entry that could not be decoded.
#[derive(Debug, Clone)]
pub struct MalformedEntry {
    pub id: String,
    pub fields: HashMap<String, String>,
    pub error: DecodeError,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chat_fields() -> HashMap<String, String> {
        HashMap::from([
            ("txn_id".to_string(), "txn-1".to_string()),
            ("stream_id".to_string(), "broadcast-9".to_string()),
            ("t".to_string(), "chat".to_string()),
            ("ts".to_string(), "1700000000000".to_string()),
            ("s".to_string(), "user-3".to_string()),
            ("v".to_string(), "1".to_string()),
            ("kid".to_string(), "k1".to_string()),
            (
                "payload".to_string(),
                json!({"v": 1, "t": "chat", "d": {"content": "hello"}}).to_string(),
            ),
        ])
    }

    #[test]
    fn test_decode_producer_fields() {
        let envelope = EventEnvelope::from_fields(&chat_fields()).unwrap();
        assert_eq!(envelope.transaction_id, "txn-1");
        assert_eq!(envelope.context_id, "broadcast-9");
        assert_eq!(envelope.event_type, EventType::Chat);
        assert_eq!(envelope.emitted_at, 1_700_000_000_000);
        assert_eq!(envelope.actor_id, "user-3");
        assert_eq!(envelope.data()["content"], "hello");
    }

    #[test]
    fn test_decode_missing_field() {
        let mut fields = chat_fields();
        fields.remove("txn_id");
        assert_eq!(
            EventEnvelope::from_fields(&fields),
            Err(DecodeError::MissingField("txn_id"))
        );

        let mut fields = chat_fields();
        fields.insert("stream_id".to_string(), String::new());
        assert_eq!(
            EventEnvelope::from_fields(&fields),
            Err(DecodeError::MissingField("stream_id"))
        );
    }

    #[test]
    fn test_decode_bad_timestamp_and_payload() {
        let mut fields = chat_fields();
        fields.insert("ts".to_string(), "yesterday".to_string());
        assert!(matches!(
            EventEnvelope::from_fields(&fields),
            Err(DecodeError::InvalidTimestamp(_))
        ));

        let mut fields = chat_fields();
        fields.insert("payload".to_string(), "{not json".to_string());
        assert!(matches!(
            EventEnvelope::from_fields(&fields),
            Err(DecodeError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_missing_sender_defaults_to_empty() {
        let mut fields = chat_fields();
        fields.remove("s");
        let envelope = EventEnvelope::from_fields(&fields).unwrap();
        assert_eq!(envelope.actor_id, "");
    }

    #[test]
    fn test_fields_survive_reencoding() {
        let envelope = EventEnvelope::from_fields(&chat_fields()).unwrap();
        let fields: HashMap<String, String> = envelope.to_fields().into_iter().collect();
        assert_eq!(EventEnvelope::from_fields(&fields).unwrap(), envelope);
    }

    #[test]
    fn test_event_type_extensible() {
        assert_eq!(EventType::from("gift"), EventType::Gift);
        assert_eq!(EventType::from("battle"), EventType::Other("battle".into()));
        assert_eq!(EventType::from("battle").to_string(), "battle");

        let json_str = serde_json::to_string(&EventType::Gift).unwrap();
        assert_eq!(json_str, "\"gift\"");
    }

    #[test]
    fn test_data_without_envelope_nesting() {
        let envelope = EventEnvelope::new("t", "c", "gift", 0, "a", json!({"gift_id": "rose"}));
        assert_eq!(envelope.data()["gift_id"], "rose");
    }

    #[test]
    fn test_lag_clamped() {
        let envelope = EventEnvelope::new("t", "c", "chat", 1_000, "a", json!({}));
        assert_eq!(envelope.lag_ms(1_250), 250);
        assert_eq!(envelope.lag_ms(500), 0);
    }
}
