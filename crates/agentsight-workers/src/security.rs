// Security analyzer
//
// Consumes `spans.ingest` in its own group, runs the rule pipeline on
// each span and, per rule family that clears the severity floor, emits
// one alert to both sinks: the `alerts.live` stream and the columnar
// alert table. A span's message is acknowledged only after both sinks
// succeed; failed deliveries are retried on later cycles and dropped
// with a warning after five attempts (alerts are advisory, spans never
// block behind them).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use agentsight_bus::{
    decode_span, encode_alert, BusMessage, Consumer, EventBus, MessageId, PoisonTracker,
    StartPosition, ALERTS_LIVE, SPANS_INGEST,
};
use agentsight_contracts::{Alert, Severity, Span};
use agentsight_storage::{AlertRow, ColumnarStore};
use anyhow::Context;
use tokio::sync::watch;

use crate::config::WorkerConfig;
use crate::rules::{default_rules, SecurityRule};
use crate::writer::backoff_sleep;
use crate::SECURITY_GROUP;

/// Delivery attempts per span's alerts before they are dropped.
const SINK_MAX_ATTEMPTS: u32 = 5;

pub struct SecurityAnalyzer {
    consumer: Consumer,
    bus: Arc<dyn EventBus>,
    store: Arc<dyn ColumnarStore>,
    rules: Vec<Box<dyn SecurityRule>>,
    batch_size: usize,
    poll_interval: Duration,
    poison: PoisonTracker,
    decode_retry: VecDeque<BusMessage>,
    /// Alerts whose delivery failed, keyed by source message, retried
    /// next cycle.
    undelivered: VecDeque<(MessageId, Vec<Alert>)>,
    sink_attempts: HashMap<MessageId, u32>,
}

impl SecurityAnalyzer {
    pub fn new(bus: Arc<dyn EventBus>, store: Arc<dyn ColumnarStore>, config: &WorkerConfig) -> Self {
        Self {
            consumer: Consumer::new(
                bus.clone(),
                SPANS_INGEST,
                SECURITY_GROUP,
                &format!("security-{}", config.consumer_name),
            ),
            bus,
            store,
            rules: default_rules(),
            batch_size: config.batch_size,
            poll_interval: config.poll_interval,
            poison: PoisonTracker::new(),
            decode_retry: VecDeque::new(),
            undelivered: VecDeque::new(),
            sink_attempts: HashMap::new(),
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        self.consumer
            .setup(StartPosition::NewOnly)
            .await
            .context("security consumer group setup failed")?;
        tracing::info!(consumer = %self.consumer.name(), "security analyzer started");

        while !*shutdown.borrow() {
            self.retry_undelivered().await;

            let batch = match self.next_messages().await {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::warn!(error = %e, "event bus read failed");
                    backoff_sleep(&mut shutdown, Duration::from_secs(1)).await;
                    continue;
                }
            };

            for message in batch {
                self.process(message).await;
            }
        }

        // One last delivery attempt for anything still queued.
        self.retry_undelivered().await;
        tracing::info!("security analyzer shutdown complete");
        Ok(())
    }

    async fn next_messages(&mut self) -> Result<Vec<BusMessage>, agentsight_bus::BusError> {
        if let Some(retry) = self.decode_retry.pop_front() {
            return Ok(vec![retry]);
        }
        self.consumer
            .next_batch(self.batch_size, self.poll_interval)
            .await
    }

    /// Analyze one span and deliver its alerts.
    pub(crate) async fn process(&mut self, message: BusMessage) {
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

        let alerts = self.analyze(&span);
        if alerts.is_empty() {
            self.ack_message(&message.id).await;
            return;
        }
        tracing::info!(
            span_id = %span.span_id,
            count = alerts.len(),
            "span produced alerts"
        );
        self.deliver(message.id, alerts).await;
    }

    /// Run the rule pipeline; one alert per rule family above the
    /// severity floor.
    pub(crate) fn analyze(&mut self, span: &Span) -> Vec<Alert> {
        let mut alerts = Vec::new();
        for rule in &mut self.rules {
            for hit in rule.apply(span) {
                let Some(severity) = Severity::from_score(hit.score) else {
                    tracing::debug!(
                        rule = rule.name(),
                        score = hit.score,
                        "hit below severity floor, suppressed"
                    );
                    continue;
                };
                alerts.push(Alert::new(
                    span.project_id.clone(),
                    span.trace_id.clone(),
                    span.span_id.clone(),
                    hit.rule_name,
                    severity,
                    hit.score,
                    hit.description,
                    hit.evidence,
                ));
            }
        }
        alerts
    }

    /// Push alerts to both sinks; acknowledge the source span only when
    /// both succeed.
    async fn deliver(&mut self, message_id: MessageId, alerts: Vec<Alert>) {
        match self.deliver_once(&alerts).await {
            Ok(()) => {
                self.sink_attempts.remove(&message_id);
                self.ack_message(&message_id).await;
            }
            Err(e) => {
                let attempts = self.sink_attempts.entry(message_id.clone()).or_insert(0);
                *attempts += 1;
                if *attempts >= SINK_MAX_ATTEMPTS {
                    tracing::warn!(
                        message_id = %message_id,
                        attempts = *attempts,
                        error = %e,
                        dropped = alerts.len(),
                        "alert delivery attempts exhausted, dropping alerts"
                    );
                    self.sink_attempts.remove(&message_id);
                    self.ack_message(&message_id).await;
                } else {
                    tracing::warn!(
                        message_id = %message_id,
                        attempt = *attempts,
                        error = %e,
                        "alert delivery failed, will retry next cycle"
                    );
                    self.undelivered.push_back((message_id, alerts));
                }
            }
        }
    }

    async fn deliver_once(&self, alerts: &[Alert]) -> anyhow::Result<()> {
        let rows: Vec<AlertRow> = alerts.iter().map(AlertRow::from_alert).collect();
        self.store
            .insert_alerts(&rows)
            .await
            .context("alert table insert failed")?;
        for alert in alerts {
            let payload = encode_alert(alert).context("alert encode failed")?;
            self.bus
                .append(ALERTS_LIVE, &payload)
                .await
                .context("alerts.live append failed")?;
        }
        Ok(())
    }

    async fn retry_undelivered(&mut self) {
        let queued = std::mem::take(&mut self.undelivered);
        for (message_id, alerts) in queued {
            self.deliver(message_id, alerts).await;
        }
    }

    async fn ack_message(&self, id: &MessageId) {
        if let Err(e) = self.consumer.ack(std::slice::from_ref(id)).await {
            tracing::warn!(message_id = %id, error = %e, "ack failed");
        }
    }
}
