// AgentSight live broadcast server

use std::sync::Arc;

use agentsight_bus::{EventBus, RedisEventBus};
use agentsight_contracts::telemetry::{init_telemetry, TelemetryConfig};
use agentsight_live::consumer::run_alert_consumer;
use agentsight_live::ws;
use agentsight_live::{BroadcastHub, LiveConfig};
use anyhow::{Context, Result};
use axum::routing::get;
use axum::{Json, Router};

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "agentsight-live",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_telemetry(&TelemetryConfig::new("agentsight-live"));
    tracing::info!("live broadcast tier starting...");

    let config = LiveConfig::from_env();

    let bus: Arc<dyn EventBus> = Arc::new(
        RedisEventBus::connect(&config.eventbus_url, config.stream_maxlen)
            .await
            .context("event bus connection failed")?,
    );

    let hub = Arc::new(BroadcastHub::new(config.subscriber_queue_size));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let consumer = tokio::spawn(run_alert_consumer(bus, hub.clone(), shutdown_rx));

    let app = Router::new()
        .route("/health", get(health))
        .merge(ws::routes(ws::AppState { hub }));

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(addr = %addr, "live broadcast listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await
        .context("server error")?;

    let _ = shutdown_tx.send(true);
    consumer.await.context("alert consumer panicked")??;

    tracing::info!("live broadcast shutdown complete");
    Ok(())
}
