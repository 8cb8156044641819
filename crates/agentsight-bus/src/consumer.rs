// Consumer-side plumbing shared by every stream worker
//
// Wraps an EventBus handle with the per-consumer lifecycle: group setup,
// pending-backlog drain on startup (so a restarted consumer re-processes
// what it never acknowledged), bulk acknowledgment, poison tracking and
// dead-letter forwarding.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use uuid::Uuid;

use crate::{dlq_stream, BusError, BusMessage, EventBus, MessageId, StartPosition};

/// How many times one consumer group re-attempts a message before it is
/// acknowledged and forwarded to the dead-letter stream.
pub const POISON_MAX_ATTEMPTS: u32 = 3;

/// A named consumer within a group on one stream.
pub struct Consumer {
    bus: Arc<dyn EventBus>,
    stream: String,
    group: String,
    name: String,
    backlog_drained: bool,
}

impl Consumer {
    /// `name` must be stable across restarts of the same process: pending
    /// lists are per consumer name, and a restarted consumer can only
    /// reclaim a backlog delivered to the name it presents.
    pub fn new(bus: Arc<dyn EventBus>, stream: &str, group: &str, name: &str) -> Self {
        Self {
            bus,
            stream: stream.to_string(),
            group: group.to_string(),
            name: name.to_string(),
            backlog_drained: false,
        }
    }

    /// Consumer with a random name suffix, for consumers whose backlog has
    /// no value after a restart (their group starts new-only and their
    /// output is ephemeral).
    pub fn with_random_name(bus: Arc<dyn EventBus>, stream: &str, group: &str, prefix: &str) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        let name = format!("{prefix}-{}", &suffix[..8]);
        Self::new(bus, stream, group, &name)
    }

    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.bus
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create the consumer group. Any failure other than "already exists"
    /// is fatal to the worker: running against a missing group would
    /// silently read nothing.
    pub async fn setup(&self, start: StartPosition) -> Result<(), BusError> {
        self.bus.create_group(&self.stream, &self.group, start).await
    }

    /// Next batch of messages: the consumer's own pending backlog first
    /// (crash recovery), then new deliveries.
    pub async fn next_batch(
        &mut self,
        max_count: usize,
        block_for: Duration,
    ) -> Result<Vec<BusMessage>, BusError> {
        if !self.backlog_drained {
            let backlog = self
                .bus
                .read_pending(&self.stream, &self.group, &self.name, max_count)
                .await?;
            if !backlog.is_empty() {
                tracing::info!(
                    stream = %self.stream,
                    group = %self.group,
                    count = backlog.len(),
                    "re-processing pending backlog"
                );
                return Ok(backlog);
            }
            self.backlog_drained = true;
        }
        self.bus
            .read(&self.stream, &self.group, &self.name, max_count, block_for)
            .await
    }

    pub async fn ack(&self, ids: &[MessageId]) -> Result<(), BusError> {
        self.bus.acknowledge(&self.stream, &self.group, ids).await
    }

    /// Acknowledge a poison message and forward it to `<stream>.dlq` with
    /// the failure reason.
    pub async fn dead_letter(
        &self,
        message: &BusMessage,
        reason: &str,
    ) -> Result<(), BusError> {
        let record = serde_json::json!({
            "stream": self.stream,
            "group": self.group,
            "message_id": message.id,
            "reason": reason,
            "payload": base64::engine::general_purpose::STANDARD.encode(&message.payload),
        });
        let payload = serde_json::to_vec(&record).map_err(crate::EncodingError::from)?;
        self.bus.append(&dlq_stream(&self.stream), &payload).await?;
        self.ack(std::slice::from_ref(&message.id)).await?;
        tracing::warn!(
            stream = %self.stream,
            group = %self.group,
            message_id = %message.id,
            reason,
            "message dead-lettered"
        );
        Ok(())
    }
}

/// Tracks per-message failure counts so a message that consistently fails
/// can be declared poison after [`POISON_MAX_ATTEMPTS`].
#[derive(Default)]
pub struct PoisonTracker {
    attempts: HashMap<MessageId, u32>,
}

impl PoisonTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failed attempt; returns true once the message has
    /// exhausted its attempts and should be dead-lettered.
    pub fn record_failure(&mut self, id: &MessageId) -> bool {
        let count = self.attempts.entry(id.clone()).or_insert(0);
        *count += 1;
        *count >= POISON_MAX_ATTEMPTS
    }

    /// Forget a message once it has been processed or dead-lettered.
    pub fn clear(&mut self, id: &MessageId) {
        self.attempts.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryEventBus;

    #[tokio::test]
    async fn test_backlog_drained_before_new_reads() {
        let bus = Arc::new(InMemoryEventBus::default());
        bus.create_group("s", "g", StartPosition::FromOldest)
            .await
            .unwrap();
        bus.append("s", b"m1").await.unwrap();

        // First consumer instance reads but never acks.
        {
            let mut first = Consumer::new(bus.clone(), "s", "g", "w-1");
            first.next_batch(10, Duration::ZERO).await.unwrap();
        }

        // Same stable name after the "restart": the backlog comes first.
        let mut restarted = Consumer::new(bus.clone(), "s", "g", "w-1");
        bus.append("s", b"m2").await.unwrap();

        let batch = restarted.next_batch(10, Duration::ZERO).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload, b"m1");

        restarted.ack(&[batch[0].id.clone()]).await.unwrap();
        let batch = restarted.next_batch(10, Duration::ZERO).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload, b"m2");
    }

    #[tokio::test]
    async fn test_dead_letter_acks_and_forwards() {
        let bus = Arc::new(InMemoryEventBus::default());
        bus.create_group("s", "g", StartPosition::FromOldest)
            .await
            .unwrap();
        bus.append("s", b"bad").await.unwrap();

        let mut consumer = Consumer::new(bus.clone(), "s", "g", "w-1");
        let batch = consumer.next_batch(10, Duration::ZERO).await.unwrap();
        consumer
            .dead_letter(&batch[0], "decode failed")
            .await
            .unwrap();

        assert_eq!(bus.pending_count("s", "g").await, 0);
        assert_eq!(bus.len("s.dlq").await, 1);

        let dlq = bus.payloads("s.dlq").await;
        let record: serde_json::Value = serde_json::from_slice(&dlq[0]).unwrap();
        assert_eq!(record["reason"], "decode failed");
        assert_eq!(record["stream"], "s");
    }

    #[test]
    fn test_poison_tracker_thresholds() {
        let mut tracker = PoisonTracker::new();
        let id = "5".to_string();
        assert!(!tracker.record_failure(&id));
        assert!(!tracker.record_failure(&id));
        assert!(tracker.record_failure(&id));
        tracker.clear(&id);
        assert!(!tracker.record_failure(&id));
    }

    #[test]
    fn test_random_names_unique() {
        let bus: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::default());
        let a = Consumer::with_random_name(bus.clone(), "s", "g", "w");
        let b = Consumer::with_random_name(bus, "s", "g", "w");
        assert_ne!(a.name(), b.name());
        assert!(a.name().starts_with("w-"));
    }
}
