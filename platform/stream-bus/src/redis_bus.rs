//! Redis-streams implementation of the [`StreamBus`] trait.

use crate::{StreamBus, StreamBusError, StreamEntry, StreamResult};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;

/// Production stream store over Redis streams.
///
/// A single multiplexed connection is shared by all callers; command-level
/// concurrency is safe. Consumer groups map one-to-one onto Redis consumer
/// groups, and the Redis PEL provides the redelivery guarantee.
#[derive(Clone)]
pub struct RedisStreamBus {
    conn: ConnectionManager,
}

impl RedisStreamBus {
    /// Connect to the store at `redis_url` (e.g. `redis://localhost:6379`).
    pub async fn connect(redis_url: &str) -> StreamResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StreamBusError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| StreamBusError::Connection(e.to_string()))?;
        Ok(Self { conn })
    }

    fn entries_from_reply(reply: StreamReadReply) -> Vec<StreamEntry> {
        let mut entries = Vec::new();
        for key in reply.keys {
            for id in key.ids {
                let mut fields = HashMap::with_capacity(id.map.len());
                for (name, value) in id.map {
                    let text: String = redis::from_redis_value(&value).unwrap_or_default();
                    fields.insert(name, text);
                }
                entries.push(StreamEntry { id: id.id, fields });
            }
        }
        entries
    }

    async fn read_with_cursor(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        cursor: &str,
        count: usize,
        block: Option<Duration>,
    ) -> StreamResult<Vec<StreamEntry>> {
        let mut opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(count);
        if let Some(block) = block {
            opts = opts.block(block.as_millis() as usize);
        }
        let mut conn = self.conn.clone();
        let reply: StreamReadReply = conn
            .xread_options(&[stream], &[cursor], &opts)
            .await
            .map_err(|e| StreamBusError::Command(format!("XREADGROUP failed: {e}")))?;
        Ok(Self::entries_from_reply(reply))
    }
}

#[async_trait]
impl StreamBus for RedisStreamBus {
    async fn publish(&self, stream: &str, fields: &[(String, String)]) -> StreamResult<String> {
        let mut conn = self.conn.clone();
        let id: String = conn
            .xadd(stream, "*", fields)
            .await
            .map_err(|e| StreamBusError::Command(format!("XADD failed: {e}")))?;
        Ok(id)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> StreamResult<()> {
        let mut conn = self.conn.clone();
        // XGROUP CREATE from "0" with MKSTREAM; BUSYGROUP means the group is
        // already in place and is not an error.
        let created: Result<String, redis::RedisError> =
            conn.xgroup_create_mkstream(stream, group, "0").await;
        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(StreamBusError::GroupCreate {
                group: group.to_string(),
                message: e.to_string(),
            }),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> StreamResult<Vec<StreamEntry>> {
        // Own pending entries first: cursor "0" returns what this consumer
        // was delivered but never acknowledged.
        let pending = self
            .read_with_cursor(stream, group, consumer, "0", count, None)
            .await?;
        if !pending.is_empty() {
            tracing::debug!(
                stream = %stream,
                group = %group,
                count = pending.len(),
                "Redelivering pending stream entries"
            );
            return Ok(pending);
        }
        // Then new entries, blocking up to the poll timeout.
        self.read_with_cursor(stream, group, consumer, ">", count, Some(block))
            .await
    }

    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> StreamResult<()> {
        let mut conn = self.conn.clone();
        let _: u64 = conn
            .xack(stream, group, &[entry_id])
            .await
            .map_err(|e| StreamBusError::Command(format!("XACK failed: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Requires a running Redis server.
    // For manual testing: docker run -p 6379:6379 redis:7-alpine
    #[tokio::test]
    #[ignore] // Requires Redis server
    async fn test_publish_read_ack_round_trip() {
        let bus = RedisStreamBus::connect("redis://localhost:6379")
            .await
            .expect("Redis must be running on localhost:6379");

        let stream = format!("test-stream-{}", std::process::id());
        bus.ensure_group(&stream, "test-group").await.unwrap();
        bus.ensure_group(&stream, "test-group").await.unwrap(); // idempotent

        let fields = vec![
            ("message_id".to_string(), "m-1".to_string()),
            ("payload".to_string(), "{}".to_string()),
        ];
        bus.publish(&stream, &fields).await.unwrap();

        let entries = bus
            .read_group(&stream, "test-group", "c-1", 10, Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].fields.get("message_id").unwrap(), "m-1");

        // Unacked entries come back on the next read.
        let again = bus
            .read_group(&stream, "test-group", "c-1", 10, Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(again.len(), 1);

        bus.ack(&stream, "test-group", &again[0].id).await.unwrap();
        let after_ack = bus
            .read_group(&stream, "test-group", "c-1", 10, Duration::from_millis(200))
            .await
            .unwrap();
        assert!(after_ack.is_empty());
    }
}
