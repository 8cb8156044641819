// Redis Streams adapter
//
// Streams are capped with `MAXLEN ~` so a dead consumer fleet cannot OOM
// the store; entries evicted past the cap while still pending are
// unrecoverable and logged as data loss when a backlog re-read finds
// them missing.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamId, StreamMaxlen, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;

use crate::{BusError, BusMessage, EventBus, MessageId, StartPosition};

/// Field under which the payload blob is stored in each stream entry.
/// A single fixed field keeps entry structure small and uniform.
const PAYLOAD_FIELD: &str = "data";

/// Redis Streams [`EventBus`] implementation.
#[derive(Clone)]
pub struct RedisEventBus {
    conn: ConnectionManager,
    maxlen: usize,
}

impl RedisEventBus {
    /// Connect and verify the server responds to PING.
    pub async fn connect(url: &str, maxlen: usize) -> Result<Self, BusError> {
        let client = redis::Client::open(url).map_err(unavailable)?;
        let mut conn = ConnectionManager::new(client).await.map_err(unavailable)?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(unavailable)?;
        tracing::info!(url, maxlen, "connected to event bus");
        Ok(Self { conn, maxlen })
    }

    fn extract(stream: &str, entry: &StreamId) -> Option<BusMessage> {
        match entry.get::<Vec<u8>>(PAYLOAD_FIELD) {
            Some(payload) => Some(BusMessage {
                id: entry.id.clone(),
                payload,
            }),
            None => {
                tracing::warn!(
                    stream,
                    message_id = %entry.id,
                    "stream entry missing payload field, skipping"
                );
                None
            }
        }
    }
}

fn unavailable(err: redis::RedisError) -> BusError {
    BusError::Unavailable(err.to_string())
}

#[async_trait]
impl EventBus for RedisEventBus {
    async fn append(&self, stream: &str, payload: &[u8]) -> Result<MessageId, BusError> {
        let mut conn = self.conn.clone();
        let id: String = conn
            .xadd_maxlen(
                stream,
                StreamMaxlen::Approx(self.maxlen),
                "*",
                &[(PAYLOAD_FIELD, payload)],
            )
            .await
            .map_err(unavailable)?;
        Ok(id)
    }

    async fn read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
        block_for: Duration,
    ) -> Result<Vec<BusMessage>, BusError> {
        let mut conn = self.conn.clone();
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(max_count)
            .block(block_for.as_millis() as usize);
        let reply: StreamReadReply = conn
            .xread_options(&[stream], &[">"], &options)
            .await
            .map_err(unavailable)?;

        let mut messages = Vec::new();
        for key in reply.keys {
            for entry in &key.ids {
                if let Some(message) = Self::extract(stream, entry) {
                    messages.push(message);
                }
            }
        }
        Ok(messages)
    }

    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
    ) -> Result<Vec<BusMessage>, BusError> {
        let mut conn = self.conn.clone();
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(max_count);
        let reply: StreamReadReply = conn
            .xread_options(&[stream], &["0"], &options)
            .await
            .map_err(unavailable)?;

        let mut messages = Vec::new();
        let mut evicted: Vec<String> = Vec::new();
        for key in reply.keys {
            for entry in &key.ids {
                // A pending id whose entry was trimmed comes back with no
                // fields; the data is gone for good.
                if entry.map.is_empty() {
                    tracing::error!(
                        stream,
                        group,
                        message_id = %entry.id,
                        "pending entry no longer in stream: data lost"
                    );
                    evicted.push(entry.id.clone());
                } else if let Some(message) = Self::extract(stream, entry) {
                    messages.push(message);
                }
            }
        }
        if !evicted.is_empty() {
            let _: i64 = conn
                .xack(stream, group, &evicted)
                .await
                .map_err(unavailable)?;
        }
        Ok(messages)
    }

    async fn acknowledge(
        &self,
        stream: &str,
        group: &str,
        ids: &[MessageId],
    ) -> Result<(), BusError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: i64 = conn.xack(stream, group, ids).await.map_err(unavailable)?;
        Ok(())
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: StartPosition,
    ) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let start_id = match start {
            StartPosition::FromOldest => "0",
            StartPosition::NewOnly => "$",
        };
        match conn
            .xgroup_create_mkstream::<_, _, _, String>(stream, group, start_id)
            .await
        {
            Ok(_) => {
                tracing::info!(stream, group, "created consumer group");
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                tracing::debug!(stream, group, "consumer group already exists");
                Ok(())
            }
            Err(e) => Err(BusError::GroupCreate(e.to_string())),
        }
    }
}
