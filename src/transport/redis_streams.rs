//! Redis Streams implementation of [`EventLog`].
//!
//! Uses a `deadpool-redis` pool; every call checks out its own connection so
//! a blocking `XREADGROUP` never stalls acknowledgements or dead-letter
//! appends issued from the same worker.

use async_trait::async_trait;
use deadpool_redis::redis::streams::{
    StreamAutoClaimOptions, StreamAutoClaimReply, StreamClaimOptions, StreamId, StreamRangeReply,
    StreamReadOptions, StreamReadReply,
};
use deadpool_redis::redis::{cmd, AsyncCommands, RedisError, Value as RedisValue};
use deadpool_redis::{Config, Connection, Pool, Runtime};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error};

use super::{EventLog, GroupInit, LogEntry, TransportError};

/// Event log backed by Redis Streams.
#[derive(Clone)]
pub struct RedisEventLog {
    pool: Pool,
}

impl RedisEventLog {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Build a pool for `url` (e.g. `redis://localhost:6379`).
    pub fn from_url(url: &str) -> Result<Self, TransportError> {
        let pool = Config::from_url(url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        Ok(Self::new(pool))
    }

    async fn conn(&self) -> Result<Connection, TransportError> {
        self.pool.get().await.map_err(|e| {
            error!(error = %e, "Failed to get Redis connection");
            TransportError::Connection(e.to_string())
        })
    }
}

fn command_error(e: RedisError) -> TransportError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
        TransportError::Connection(e.to_string())
    } else {
        TransportError::Command(e.to_string())
    }
}

/// Render a stream field value as text.
fn value_to_string(value: &RedisValue) -> Option<String> {
    match value {
        RedisValue::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).to_string()),
        RedisValue::SimpleString(s) => Some(s.clone()),
        RedisValue::Int(i) => Some(i.to_string()),
        _ => None,
    }
}

fn to_entry(stream_id: StreamId) -> LogEntry {
    let fields: HashMap<String, String> = stream_id
        .map
        .iter()
        .filter_map(|(key, value)| value_to_string(value).map(|v| (key.clone(), v)))
        .collect();
    LogEntry::new(stream_id.id, fields)
}

#[async_trait]
impl EventLog for RedisEventLog {
    async fn create_group(&self, stream: &str, group: &str) -> Result<GroupInit, TransportError> {
        let mut conn = self.conn().await?;

        // Start at "0" so a brand-new group also drains the existing backlog.
        let result: Result<(), RedisError> = cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => Ok(GroupInit::Created),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(GroupInit::AlreadyExists),
            Err(e) => Err(command_error(e)),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogEntry>, TransportError> {
        let mut conn = self.conn().await?;

        let mut opts = StreamReadOptions::default().group(group, consumer).count(count);
        // BLOCK 0 waits forever; a zero timeout means "don't block".
        if !block.is_zero() {
            opts = opts.block(block.as_millis() as usize);
        }

        // A timed-out block comes back as nil.
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[stream], &[">"], &opts)
            .await
            .map_err(command_error)?;

        let entries: Vec<LogEntry> = reply
            .map(|reply| {
                reply
                    .keys
                    .into_iter()
                    .flat_map(|key| key.ids)
                    .map(to_entry)
                    .collect()
            })
            .unwrap_or_default();

        if !entries.is_empty() {
            debug!(stream = %stream, count = entries.len(), "Read entries from stream");
        }
        Ok(entries)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, TransportError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        let acked: u64 = conn.xack(stream, group, ids).await.map_err(command_error)?;
        Ok(acked)
    }

    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
        max_len: Option<usize>,
    ) -> Result<String, TransportError> {
        let mut conn = self.conn().await?;

        let mut command = cmd("XADD");
        command.arg(stream);
        if let Some(max_len) = max_len {
            command.arg("MAXLEN").arg("~").arg(max_len);
        }
        command.arg("*");
        for (key, value) in fields {
            command.arg(key).arg(value);
        }

        let id: String = command.query_async(&mut conn).await.map_err(command_error)?;
        Ok(id)
    }

    async fn autoclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<LogEntry>, TransportError> {
        let mut conn = self.conn().await?;

        let opts = StreamAutoClaimOptions::default().count(count);
        let reply: StreamAutoClaimReply = conn
            .xautoclaim_options(
                stream,
                group,
                consumer,
                min_idle.as_millis() as u64,
                "0-0",
                opts,
            )
            .await
            .map_err(command_error)?;

        if !reply.deleted_ids.is_empty() {
            debug!(
                stream = %stream,
                deleted = reply.deleted_ids.len(),
                "Pending entries no longer exist in stream"
            );
        }

        Ok(reply.claimed.into_iter().map(to_entry).collect())
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        ids: &[String],
    ) -> Result<u64, TransportError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;

        // JUSTID resets the idle time without bumping the delivery counter.
        let opts = StreamClaimOptions::default().with_justid();
        let claimed: Vec<String> = conn
            .xclaim_options(stream, group, consumer, 0, ids, opts)
            .await
            .map_err(command_error)?;
        Ok(claimed.len() as u64)
    }

    async fn len(&self, stream: &str) -> Result<u64, TransportError> {
        let mut conn = self.conn().await?;
        let len: u64 = conn.xlen(stream).await.map_err(command_error)?;
        Ok(len)
    }

    async fn range(&self, stream: &str, count: usize) -> Result<Vec<LogEntry>, TransportError> {
        let mut conn = self.conn().await?;
        let reply: StreamRangeReply = conn
            .xrange_count(stream, "-", "+", count)
            .await
            .map_err(command_error)?;
        Ok(reply.ids.into_iter().map(to_entry).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_to_string() {
        assert_eq!(
            value_to_string(&RedisValue::BulkString(b"txn-1".to_vec())),
            Some("txn-1".to_string())
        );
        assert_eq!(
            value_to_string(&RedisValue::SimpleString("OK".to_string())),
            Some("OK".to_string())
        );
        assert_eq!(value_to_string(&RedisValue::Int(42)), Some("42".to_string()));
        assert_eq!(value_to_string(&RedisValue::Nil), None);
    }

    #[test]
    fn test_to_entry_skips_unrenderable_values() {
        let mut map = HashMap::new();
        map.insert("t".to_string(), RedisValue::BulkString(b"chat".to_vec()));
        map.insert("junk".to_string(), RedisValue::Nil);
        let stream_id = StreamId {
            id: "1-0".to_string(),
            map,
        };

        let entry = to_entry(stream_id);
        assert_eq!(entry.id, "1-0");
        assert_eq!(entry.fields.get("t").map(String::as_str), Some("chat"));
        assert!(!entry.fields.contains_key("junk"));
    }
}
