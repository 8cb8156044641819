// Alert stream consumer
//
// Reads `alerts.live` in the broadcast group and hands each decoded
// alert to the hub. One hub process per deployment: a second process in
// the same group would partition the stream between them.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use agentsight_bus::{
    decode_alert, BusMessage, Consumer, EventBus, PoisonTracker, StartPosition, ALERTS_LIVE,
};
use anyhow::Context;
use tokio::sync::watch;

use crate::hub::BroadcastHub;

pub const BROADCAST_GROUP: &str = "broadcast-group";

const READ_COUNT: usize = 64;
const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub async fn run_alert_consumer(
    bus: Arc<dyn EventBus>,
    hub: Arc<BroadcastHub>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut consumer = Consumer::with_random_name(bus, ALERTS_LIVE, BROADCAST_GROUP, "broadcast");
    consumer
        .setup(StartPosition::NewOnly)
        .await
        .context("broadcast consumer group setup failed")?;
    tracing::info!(consumer = %consumer.name(), "alert consumer started");

    let mut poison = PoisonTracker::new();
    let mut decode_retry: VecDeque<BusMessage> = VecDeque::new();

    while !*shutdown.borrow() {
        let batch = if let Some(retry) = decode_retry.pop_front() {
            vec![retry]
        } else {
            match consumer.next_batch(READ_COUNT, POLL_INTERVAL).await {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::warn!(error = %e, "alert stream read failed");
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        _ = shutdown.changed() => {}
                    }
                    continue;
                }
            }
        };

        let mut acked = Vec::new();
        for message in batch {
            match decode_alert(&message.payload) {
                Ok(alert) => {
                    poison.clear(&message.id);
                    let delivered = hub.publish(&alert).await;
                    tracing::debug!(
                        alert_id = %alert.id,
                        project_id = %alert.project_id,
                        delivered,
                        "alert broadcast"
                    );
                    acked.push(message.id);
                }
                Err(e) => {
                    if poison.record_failure(&message.id) {
                        poison.clear(&message.id);
                        if let Err(dlq_err) = consumer
                            .dead_letter(&message, &format!("alert decode failed: {e}"))
                            .await
                        {
                            tracing::error!(error = %dlq_err, "dead-letter append failed");
                        }
                    } else {
                        tracing::warn!(message_id = %message.id, error = %e, "alert decode failed, will retry");
                        decode_retry.push_back(message);
                    }
                }
            }
        }
        if let Err(e) = consumer.ack(&acked).await {
            tracing::warn!(error = %e, "alert ack failed");
        }
    }

    tracing::info!("alert consumer shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use agentsight_bus::{encode_alert, EventBus, InMemoryEventBus};
    use agentsight_contracts::{Alert, Severity};

    use super::*;

    #[tokio::test]
    async fn test_alerts_flow_from_stream_to_subscriber() {
        let bus = Arc::new(InMemoryEventBus::default());
        let hub = Arc::new(BroadcastHub::new(16));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let (_id, queue) = hub.subscribe(Some("p1".to_string())).await;

        let consumer_task = tokio::spawn(run_alert_consumer(
            bus.clone(),
            hub.clone(),
            shutdown_rx,
        ));

        // Give the consumer time to create its group before appending.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let alert = Alert::new(
            "p1",
            "t1",
            "s1",
            "prompt_injection",
            Severity::High,
            80.0,
            "desc",
            "evidence",
        );
        bus.append(ALERTS_LIVE, &encode_alert(&alert).unwrap())
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), queue.pop())
            .await
            .expect("alert not delivered in time");
        assert_eq!(received.id, alert.id);

        shutdown_tx.send(true).unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(2), consumer_task).await;

        // Delivered alert was acknowledged.
        assert_eq!(bus.pending_count(ALERTS_LIVE, BROADCAST_GROUP).await, 0);
    }

    #[tokio::test]
    async fn test_undecodable_alert_dead_lettered() {
        let bus = Arc::new(InMemoryEventBus::default());
        let hub = Arc::new(BroadcastHub::new(16));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let consumer_task = tokio::spawn(run_alert_consumer(
            bus.clone(),
            hub.clone(),
            shutdown_rx,
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;

        bus.append(ALERTS_LIVE, b"not an alert").await.unwrap();

        // Three attempts, then the DLQ entry appears.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if bus.len("alerts.live.dlq").await == 1 {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "message never dead-lettered"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        shutdown_tx.send(true).unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(2), consumer_task).await;
    }
}
