// Cost aggregator
//
// Consumes `spans.ingest` in its own group and derives one cost row per
// LLM span. Non-LLM spans are acknowledged and skipped. Batching follows
// the writer: buffer, flush on size or interval, bulk-ack after the
// insert lands. Rows that outlive the retry budget are dropped with an
// error log; cost rows are derived data and must not wedge the group.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use agentsight_bus::{
    decode_span, BusMessage, Consumer, EventBus, MessageId, PoisonTracker, StartPosition,
    SPANS_INGEST,
};
use agentsight_contracts::{CostMetric, Span};
use agentsight_storage::{ColumnarStore, CostMetricRow, StorageError};
use anyhow::Context;
use tokio::sync::watch;

use crate::config::WorkerConfig;
use crate::retry::RetryPolicy;
use crate::writer::backoff_sleep;
use crate::COST_GROUP;

/// USD per 1k tokens: (model, prompt, completion). Matching is by
/// substring so dated variants (`gpt-4-0613`) price as their base model;
/// longer names are tried first so `gpt-4-turbo` never prices as `gpt-4`.
pub const PRICE_TABLE: &[(&str, f64, f64)] = &[
    ("gpt-4-turbo", 0.01, 0.03),
    ("gpt-4o", 0.005, 0.015),
    ("gpt-4", 0.03, 0.06),
    ("gpt-3.5-turbo", 0.0005, 0.0015),
    ("claude-3-opus", 0.015, 0.075),
    ("claude-3-sonnet", 0.003, 0.015),
    ("claude-3-haiku", 0.00025, 0.00125),
];

/// Price lookup for a (normalized) model name.
pub fn price_for_model(model: &str) -> Option<(f64, f64)> {
    PRICE_TABLE
        .iter()
        .find(|(name, _, _)| model.contains(name))
        .map(|(_, prompt, completion)| (*prompt, *completion))
}

/// Derive a cost metric from a span, or `None` for non-LLM spans.
/// Unknown models are kept with zero cost so usage still aggregates.
pub fn derive_cost(span: &Span) -> Option<CostMetric> {
    let model = span.attributes.get("llm.model")?.to_lowercase();

    let prompt_tokens = span.attr_i64("llm.tokens.in").unwrap_or(0).max(0) as u64;
    let completion_tokens = span.attr_i64("llm.tokens.out").unwrap_or(0).max(0) as u64;

    let cost_usd = match price_for_model(&model) {
        Some((price_in, price_out)) => {
            prompt_tokens as f64 * price_in / 1000.0 + completion_tokens as f64 * price_out / 1000.0
        }
        None => 0.0,
    };

    let span_kind = if model.contains("embed") || span.name.contains("embed") {
        "embedding"
    } else {
        "llm"
    };

    Some(CostMetric {
        project_id: span.project_id.clone(),
        model,
        span_kind: span_kind.to_string(),
        timestamp: span.start_time / 1_000_000_000,
        prompt_tokens,
        completion_tokens,
        total_tokens: prompt_tokens + completion_tokens,
        cost_usd,
    })
}

pub struct CostAggregator {
    consumer: Consumer,
    store: Arc<dyn ColumnarStore>,
    batch_size: usize,
    flush_interval: Duration,
    poll_interval: Duration,
    retry_budget: u32,
    retry_policy: RetryPolicy,
    /// Message ids to acknowledge at next flush; rows only exist for LLM
    /// spans but skipped spans are acked in the same bulk call.
    buffer: Vec<(MessageId, Option<CostMetricRow>)>,
    last_flush: Instant,
    flush_attempts: u32,
    unknown_models: HashSet<String>,
    poison: PoisonTracker,
    decode_retry: VecDeque<BusMessage>,
}

impl CostAggregator {
    pub fn new(bus: Arc<dyn EventBus>, store: Arc<dyn ColumnarStore>, config: &WorkerConfig) -> Self {
        Self {
            consumer: Consumer::new(
                bus,
                SPANS_INGEST,
                COST_GROUP,
                &format!("cost-{}", config.consumer_name),
            ),
            store,
            batch_size: config.batch_size,
            flush_interval: config.flush_interval,
            poll_interval: config.poll_interval,
            retry_budget: config.insert_retry_budget,
            retry_policy: RetryPolicy::exponential(),
            buffer: Vec::new(),
            last_flush: Instant::now(),
            flush_attempts: 0,
            unknown_models: HashSet::new(),
            poison: PoisonTracker::new(),
            decode_retry: VecDeque::new(),
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        self.consumer
            .setup(StartPosition::NewOnly)
            .await
            .context("cost consumer group setup failed")?;
        tracing::info!(consumer = %self.consumer.name(), "cost aggregator started");

        while !*shutdown.borrow() {
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
                self.flush_cycle(&mut shutdown).await;
            }
        }

        while !self.buffer.is_empty() {
            self.flush_cycle(&mut shutdown).await;
        }
        tracing::info!("cost aggregator shutdown complete");
        Ok(())
    }

    async fn next_messages(&mut self) -> Result<Vec<BusMessage>, agentsight_bus::BusError> {
        if let Some(retry) = self.decode_retry.pop_front() {
            return Ok(vec![retry]);
        }
        let want = self.batch_size.saturating_sub(self.buffer.len()).max(1);
        self.consumer.next_batch(want, self.poll_interval).await
    }

    pub(crate) async fn accept(&mut self, message: BusMessage) {
        let span = match decode_span(&message.payload) {
            Ok(span) => span,
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
                    self.decode_retry.push_back(message);
                }
                return;
            }
        };

        let row = derive_cost(&span).map(|metric| {
            if metric.cost_usd == 0.0
                && metric.total_tokens > 0
                && self.unknown_models.insert(metric.model.clone())
            {
                tracing::debug!(model = %metric.model, "no price entry for model, recording zero cost");
            }
            CostMetricRow::from_metric(&metric)
        });
        self.buffer.push((message.id, row));
    }

    fn should_flush(&self) -> bool {
        !self.buffer.is_empty()
            && (self.buffer.len() >= self.batch_size
                || self.last_flush.elapsed() >= self.flush_interval)
    }

    async fn flush_cycle(&mut self, shutdown: &mut watch::Receiver<bool>) {
        match self.flush_once().await {
            Ok(()) => {}
            Err(e) => {
                self.flush_attempts += 1;
                if self.flush_attempts >= self.retry_budget {
                    tracing::error!(
                        error = %e,
                        dropped = self.buffer.iter().filter(|(_, r)| r.is_some()).count(),
                        "cost insert retry budget exhausted, dropping rows"
                    );
                    let ids: Vec<MessageId> =
                        self.buffer.iter().map(|(id, _)| id.clone()).collect();
                    if let Err(ack_err) = self.consumer.ack(&ids).await {
                        tracing::warn!(error = %ack_err, "ack failed after drop");
                    }
                    self.buffer.clear();
                    self.flush_attempts = 0;
                    self.last_flush = Instant::now();
                } else {
                    tracing::warn!(
                        error = %e,
                        attempt = self.flush_attempts,
                        "cost insert failed, buffer retained"
                    );
                    let delay = self.retry_policy.delay_for_attempt(self.flush_attempts);
                    backoff_sleep(shutdown, delay).await;
                }
            }
        }
    }

    pub(crate) async fn flush_once(&mut self) -> Result<(), StorageError> {
        if self.buffer.is_empty() {
            self.last_flush = Instant::now();
            return Ok(());
        }

        let rows: Vec<CostMetricRow> = self
            .buffer
            .iter()
            .filter_map(|(_, row)| row.clone())
            .collect();
        self.store.insert_cost_metrics(&rows).await?;

        let ids: Vec<MessageId> = self.buffer.iter().map(|(id, _)| id.clone()).collect();
        if let Err(e) = self.consumer.ack(&ids).await {
            tracing::warn!(error = %e, "bulk ack failed after insert");
        }

        tracing::info!(rows = rows.len(), acked = ids.len(), "flushed cost metrics");
        self.buffer.clear();
        self.flush_attempts = 0;
        self.last_flush = Instant::now();
        Ok(())
    }
}
