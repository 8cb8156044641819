// Persistence writer
//
// Consumes `spans.ingest` in the writer group, accumulates decoded spans
// in memory, and bulk-inserts them into the columnar store. Messages are
// acknowledged only after their batch is durably inserted; a failed
// insert keeps the buffer intact and backs off. Past the retry budget the
// buffer spills to a local file so the stream's pending list stays
// bounded without losing data.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use agentsight_bus::{
    decode_span, BusMessage, Consumer, EventBus, MessageId, PoisonTracker, StartPosition,
    SPANS_INGEST,
};
use agentsight_contracts::Span;
use agentsight_storage::{ColumnarStore, SpanRow, StorageError};
use anyhow::Context;
use tokio::sync::watch;

use crate::config::WorkerConfig;
use crate::retry::RetryPolicy;
use crate::spill;
use crate::WRITER_GROUP;

/// How many recently flushed message ids are remembered to suppress
/// duplicates during crash-replay windows.
const RECENT_IDS_CAP: usize = 100_000;

/// Bounded insertion-ordered set of message ids.
pub(crate) struct RecentIds {
    set: HashSet<MessageId>,
    order: VecDeque<MessageId>,
    cap: usize,
}

impl RecentIds {
    fn new(cap: usize) -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
            cap,
        }
    }

    fn contains(&self, id: &MessageId) -> bool {
        self.set.contains(id)
    }

    fn insert(&mut self, id: MessageId) {
        if !self.set.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.cap {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
    }
}

pub struct PersistenceWriter {
    consumer: Consumer,
    store: Arc<dyn ColumnarStore>,
    batch_size: usize,
    flush_interval: Duration,
    poll_interval: Duration,
    retry_budget: u32,
    retry_policy: RetryPolicy,
    spill_path: PathBuf,
    hard_cap: usize,
    buffer: Vec<(MessageId, Span)>,
    last_flush: Instant,
    flush_attempts: u32,
    seen: RecentIds,
    poison: PoisonTracker,
    retry_queue: VecDeque<BusMessage>,
}

impl PersistenceWriter {
    pub fn new(bus: Arc<dyn EventBus>, store: Arc<dyn ColumnarStore>, config: &WorkerConfig) -> Self {
        Self {
            consumer: Consumer::new(
                bus,
                SPANS_INGEST,
                WRITER_GROUP,
                &format!("writer-{}", config.consumer_name),
            ),
            store,
            batch_size: config.batch_size,
            flush_interval: config.flush_interval,
            poll_interval: config.poll_interval,
            retry_budget: config.insert_retry_budget,
            retry_policy: RetryPolicy::exponential(),
            spill_path: config.spill_path.clone(),
            hard_cap: config.buffer_hard_cap,
            buffer: Vec::new(),
            last_flush: Instant::now(),
            flush_attempts: 0,
            seen: RecentIds::new(RECENT_IDS_CAP),
            poison: PoisonTracker::new(),
            retry_queue: VecDeque::new(),
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        self.consumer
            .setup(StartPosition::NewOnly)
            .await
            .context("writer consumer group setup failed")?;
        tracing::info!(consumer = %self.consumer.name(), "persistence writer started");

        while !*shutdown.borrow() {
            if self.buffer.len() >= self.hard_cap {
                tracing::warn!(
                    buffered = self.buffer.len(),
                    "buffer at hard cap, pausing reads"
                );
                self.flush_cycle(&mut shutdown).await?;
                continue;
            }

            let batch = match self.next_messages().await {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::warn!(error = %e, "event bus read failed");
                    backoff_sleep(&mut shutdown, Duration::from_secs(1)).await;
                    continue;
                }
            };

            for message in batch {
                self.accept(message).await;
            }

            if self.should_flush() {
                self.flush_cycle(&mut shutdown).await?;
            }
        }

        // Drain what is already buffered before exiting; the normal retry
        // budget applies and the spill file catches the remainder.
        tracing::info!(buffered = self.buffer.len(), "writer shutting down, final flush");
        while !self.buffer.is_empty() {
            self.flush_cycle(&mut shutdown).await?;
        }
        Ok(())
    }

    async fn next_messages(&mut self) -> Result<Vec<BusMessage>, agentsight_bus::BusError> {
        if let Some(retry) = self.retry_queue.pop_front() {
            return Ok(vec![retry]);
        }
        let want = self.batch_size.saturating_sub(self.buffer.len()).max(1);
        self.consumer.next_batch(want, self.poll_interval).await
    }

    /// Decode a delivered message into the buffer.
    async fn accept(&mut self, message: BusMessage) {
        if self.seen.contains(&message.id) {
            tracing::debug!(message_id = %message.id, "duplicate delivery suppressed");
            if let Err(e) = self.consumer.ack(std::slice::from_ref(&message.id)).await {
                tracing::warn!(error = %e, "ack of duplicate failed");
            }
            return;
        }

        match decode_span(&message.payload) {
            Ok(span) => {
                self.poison.clear(&message.id);
                self.buffer.push((message.id, span));
            }
            Err(e) => {
                if self.poison.record_failure(&message.id) {
                    self.poison.clear(&message.id);
                    if let Err(dlq_err) = self
                        .consumer
                        .dead_letter(&message, &format!("span decode failed: {e}"))
                        .await
                    {
                        tracing::error!(error = %dlq_err, "dead-letter append failed");
                    }
                } else {
                    tracing::warn!(message_id = %message.id, error = %e, "span decode failed, will retry");
                    self.retry_queue.push_back(message);
                }
            }
        }
    }

    fn should_flush(&self) -> bool {
        !self.buffer.is_empty()
            && (self.buffer.len() >= self.batch_size
                || self.last_flush.elapsed() >= self.flush_interval)
    }

    /// One flush attempt plus its failure handling (backoff or spill).
    async fn flush_cycle(&mut self, shutdown: &mut watch::Receiver<bool>) -> anyhow::Result<()> {
        match self.flush_once().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.flush_attempts += 1;
                tracing::warn!(
                    error = %e,
                    attempt = self.flush_attempts,
                    buffered = self.buffer.len(),
                    "batch insert failed, buffer retained"
                );
                if self.flush_attempts >= self.retry_budget {
                    // Spill failures are fatal: with both sinks gone there
                    // is nowhere left to put the data.
                    self.spill_buffer().await.context("spill write failed")?;
                    return Ok(());
                }
                let delay = self.retry_policy.delay_for_attempt(self.flush_attempts);
                backoff_sleep(shutdown, delay).await;
                Ok(())
            }
        }
    }

    /// Insert the buffered batch and acknowledge it as one unit.
    async fn flush_once(&mut self) -> Result<(), StorageError> {
        if self.buffer.is_empty() {
            self.last_flush = Instant::now();
            return Ok(());
        }

        let rows: Vec<SpanRow> = self
            .buffer
            .iter()
            .map(|(_, span)| SpanRow::from_span(span))
            .collect();
        self.store.insert_spans(&rows).await?;

        let ids: Vec<MessageId> = self.buffer.iter().map(|(id, _)| id.clone()).collect();
        if let Err(e) = self.consumer.ack(&ids).await {
            // The insert is durable; redelivery is handled by the dedup set.
            tracing::warn!(error = %e, "bulk ack failed after insert");
        }
        for id in ids {
            self.seen.insert(id);
        }

        tracing::info!(rows = rows.len(), "flushed spans to columnar store");
        self.buffer.clear();
        self.flush_attempts = 0;
        self.last_flush = Instant::now();
        Ok(())
    }

    /// Move the buffer to the spill file and acknowledge it: the data is
    /// locally durable and can be backfilled by an operator.
    async fn spill_buffer(&mut self) -> Result<(), spill::SpillError> {
        let spans: Vec<Span> = self.buffer.iter().map(|(_, s)| s.clone()).collect();
        let count = spill::append_spans(&self.spill_path, &spans)?;
        tracing::error!(
            count,
            path = %self.spill_path.display(),
            "retry budget exhausted, spilled buffer to disk"
        );

        let ids: Vec<MessageId> = self.buffer.iter().map(|(id, _)| id.clone()).collect();
        if let Err(e) = self.consumer.ack(&ids).await {
            tracing::warn!(error = %e, "ack failed after spill");
        }
        for id in ids {
            self.seen.insert(id);
        }
        self.buffer.clear();
        self.flush_attempts = 0;
        self.last_flush = Instant::now();
        Ok(())
    }
}

/// Sleep that wakes early on shutdown.
pub(crate) async fn backoff_sleep(shutdown: &mut watch::Receiver<bool>, delay: Duration) {
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = shutdown.changed() => {}
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use agentsight_bus::{encode_span, EventBus, InMemoryEventBus};
    use agentsight_contracts::SpanStatus;
    use agentsight_storage::MemoryColumnarStore;

    use super::*;

    fn test_config(spill_path: PathBuf) -> WorkerConfig {
        WorkerConfig {
            eventbus_url: String::new(),
            stream_maxlen: 1000,
            columnar_url: String::new(),
            consumer_name: "1".to_string(),
            batch_size: 10,
            flush_interval: Duration::from_millis(50),
            poll_interval: Duration::from_millis(10),
            insert_retry_budget: 3,
            spill_path,
            buffer_hard_cap: 100,
        }
    }

    fn span(id: &str) -> Span {
        Span {
            span_id: id.to_string(),
            trace_id: "t1".to_string(),
            parent_span_id: None,
            project_id: "p1".to_string(),
            name: "llm.chat".to_string(),
            service_name: "default".to_string(),
            status: SpanStatus::Ok,
            start_time: 1_000_000_000,
            end_time: 1_500_000_000,
            duration_ms: 500.0,
            attributes: HashMap::new(),
            events: vec![],
        }
    }

    async fn writer_with_spans(
        span_ids: &[&str],
        spill: PathBuf,
    ) -> (PersistenceWriter, Arc<InMemoryEventBus>, Arc<MemoryColumnarStore>) {
        let bus = Arc::new(InMemoryEventBus::default());
        let store = Arc::new(MemoryColumnarStore::new());
        bus.create_group(SPANS_INGEST, WRITER_GROUP, StartPosition::FromOldest)
            .await
            .unwrap();
        for id in span_ids {
            bus.append(SPANS_INGEST, &encode_span(&span(id)).unwrap())
                .await
                .unwrap();
        }
        let writer = PersistenceWriter::new(bus.clone(), store.clone(), &test_config(spill));
        (writer, bus, store)
    }

    #[tokio::test]
    async fn test_flush_inserts_and_acks_as_one_unit() {
        let dir = tempfile::tempdir().unwrap();
        let (mut writer, bus, store) =
            writer_with_spans(&["a", "b"], dir.path().join("spill.bin")).await;

        let batch = writer.next_messages().await.unwrap();
        for message in batch {
            writer.accept(message).await;
        }
        assert_eq!(writer.buffer.len(), 2);

        writer.flush_once().await.unwrap();
        assert_eq!(store.spans().await.len(), 2);
        assert_eq!(bus.pending_count(SPANS_INGEST, WRITER_GROUP).await, 0);
        assert!(writer.buffer.is_empty());
    }

    #[tokio::test]
    async fn test_failed_insert_keeps_buffer_and_pending() {
        let dir = tempfile::tempdir().unwrap();
        let (mut writer, bus, store) =
            writer_with_spans(&["a", "b"], dir.path().join("spill.bin")).await;
        store.set_failing(true);

        let batch = writer.next_messages().await.unwrap();
        for message in batch {
            writer.accept(message).await;
        }
        assert!(writer.flush_once().await.is_err());

        assert_eq!(writer.buffer.len(), 2);
        assert_eq!(bus.pending_count(SPANS_INGEST, WRITER_GROUP).await, 2);
        assert!(store.spans().await.is_empty());

        // Store recovers: the retained buffer flushes in full.
        store.set_failing(false);
        writer.flush_once().await.unwrap();
        assert_eq!(store.spans().await.len(), 2);
        assert_eq!(bus.pending_count(SPANS_INGEST, WRITER_GROUP).await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_suppressed() {
        let dir = tempfile::tempdir().unwrap();
        let (mut writer, bus, store) =
            writer_with_spans(&["a"], dir.path().join("spill.bin")).await;

        let batch = writer.next_messages().await.unwrap();
        let message = batch[0].clone();
        writer.accept(message.clone()).await;
        writer.flush_once().await.unwrap();

        // Same message id delivered again (replay): skipped, not re-inserted.
        writer.accept(message).await;
        assert!(writer.buffer.is_empty());
        writer.flush_once().await.unwrap();
        assert_eq!(store.spans().await.len(), 1);
        assert_eq!(bus.pending_count(SPANS_INGEST, WRITER_GROUP).await, 0);
    }

    #[tokio::test]
    async fn test_poison_message_dead_lettered_after_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(InMemoryEventBus::default());
        let store = Arc::new(MemoryColumnarStore::new());
        bus.create_group(SPANS_INGEST, WRITER_GROUP, StartPosition::FromOldest)
            .await
            .unwrap();
        bus.append(SPANS_INGEST, b"not msgpack").await.unwrap();

        let mut writer = PersistenceWriter::new(
            bus.clone(),
            store,
            &test_config(dir.path().join("spill.bin")),
        );

        // Three cycles: two retries, then dead-letter.
        for _ in 0..3 {
            let batch = writer.next_messages().await.unwrap();
            for message in batch {
                writer.accept(message).await;
            }
        }
        assert_eq!(bus.len("spans.ingest.dlq").await, 1);
        assert_eq!(bus.pending_count(SPANS_INGEST, WRITER_GROUP).await, 0);
        assert!(writer.buffer.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spill_after_retry_budget() {
        let dir = tempfile::tempdir().unwrap();
        let spill_path = dir.path().join("spill.bin");
        let (mut writer, bus, store) = writer_with_spans(&["a", "b"], spill_path.clone()).await;
        store.set_failing(true);

        let batch = writer.next_messages().await.unwrap();
        for message in batch {
            writer.accept(message).await;
        }

        let (_tx, mut rx) = watch::channel(false);
        // Budget is 3; the third failed cycle spills instead of sleeping.
        for _ in 0..3 {
            writer.flush_cycle(&mut rx).await.unwrap();
        }

        assert!(writer.buffer.is_empty());
        assert_eq!(bus.pending_count(SPANS_INGEST, WRITER_GROUP).await, 0);
        let spilled = spill::read_spans(&spill_path).unwrap();
        let ids: Vec<_> = spilled.iter().map(|s| s.span_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
