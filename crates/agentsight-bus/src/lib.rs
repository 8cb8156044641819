// Event bus abstraction
//
// An append-only, durable, keyed stream with consumer-group semantics:
// at-least-once delivery, per-group cursor, per-consumer pending list,
// explicit bulk acknowledgment. Two adapters are provided: Redis Streams
// for production and an in-memory implementation for tests.

use std::time::Duration;

use async_trait::async_trait;

pub mod consumer;
pub mod encoding;
pub mod memory;
pub mod redis;

pub use self::consumer::{Consumer, PoisonTracker};
pub use self::encoding::{decode_alert, decode_span, encode_alert, encode_span, EncodingError};
pub use self::memory::InMemoryEventBus;
pub use self::redis::RedisEventBus;

/// Stream carrying raw spans from the ingress to the workers.
pub const SPANS_INGEST: &str = "spans.ingest";
/// Stream carrying derived alerts from the analyzer to the broadcast tier.
pub const ALERTS_LIVE: &str = "alerts.live";

/// Default cap on stream length; the backing store may evict older
/// entries past this bound regardless of pending state.
pub const DEFAULT_STREAM_MAXLEN: usize = 1_000_000;

/// Dead-letter stream for a given source stream.
pub fn dlq_stream(stream: &str) -> String {
    format!("{stream}.dlq")
}

/// Opaque, monotonically increasing message token within a stream.
pub type MessageId = String;

/// A message delivered from a stream.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub id: MessageId,
    pub payload: Vec<u8>,
}

/// Where a newly created consumer group starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    FromOldest,
    NewOnly,
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The backing store cannot be reached or is failing.
    #[error("event bus unavailable: {0}")]
    Unavailable(String),
    /// Consumer-group creation failed for a reason other than the group
    /// already existing. Fatal at startup.
    #[error("consumer group setup failed: {0}")]
    GroupCreate(String),
    /// A payload could not be encoded for appending.
    #[error(transparent)]
    Encoding(#[from] EncodingError),
}

/// Durable, ordered delivery of encoded messages to named consumer groups.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Append a payload atomically; returns the assigned message id.
    async fn append(&self, stream: &str, payload: &[u8]) -> Result<MessageId, BusError>;

    /// Read up to `max_count` new messages for this (group, consumer),
    /// waiting up to `block_for` when the stream is empty. Delivered
    /// messages join the group's pending list until acknowledged.
    async fn read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
        block_for: Duration,
    ) -> Result<Vec<BusMessage>, BusError>;

    /// Re-read this consumer's own pending (delivered, unacknowledged)
    /// messages. Used once at startup so a restarted consumer re-processes
    /// what it never acknowledged.
    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
    ) -> Result<Vec<BusMessage>, BusError>;

    /// Remove the ids from the group's pending list. Safe to call in bulk.
    async fn acknowledge(
        &self,
        stream: &str,
        group: &str,
        ids: &[MessageId],
    ) -> Result<(), BusError>;

    /// Create a consumer group. Idempotent: succeeds silently when the
    /// group already exists.
    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: StartPosition,
    ) -> Result<(), BusError>;
}
