use std::sync::Arc;

use agentsight_bus::{EventBus, RedisEventBus};
use agentsight_contracts::telemetry::{init_telemetry, TelemetryConfig};
use agentsight_storage::{ClickHouseStore, ColumnarStore};
use agentsight_workers::{CostAggregator, PersistenceWriter, SecurityAnalyzer, WorkerConfig};
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum WorkerKind {
    /// Bulk-persist spans into the columnar store
    Persistence,
    /// Run the security rule pipeline and emit alerts
    Security,
    /// Derive cost rows from LLM spans
    Cost,
}

#[derive(Parser)]
#[command(name = "agentsight-workers", about = "AgentSight stream workers")]
struct Args {
    /// Which worker this process runs; scale horizontally by starting
    /// more processes of the same kind.
    #[arg(long, value_enum)]
    worker: WorkerKind,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_telemetry(&TelemetryConfig::new("agentsight-workers"));

    let config = WorkerConfig::from_env();
    tracing::info!(worker = ?args.worker, "worker starting");

    let bus: Arc<dyn EventBus> = Arc::new(
        RedisEventBus::connect(&config.eventbus_url, config.stream_maxlen)
            .await
            .context("event bus connection failed")?,
    );
    let store: Arc<dyn ColumnarStore> = Arc::new(
        ClickHouseStore::new(&config.columnar_url).context("columnar store client failed")?,
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    match args.worker {
        WorkerKind::Persistence => {
            PersistenceWriter::new(bus, store, &config)
                .run(shutdown_rx)
                .await?
        }
        WorkerKind::Security => {
            SecurityAnalyzer::new(bus, store, &config)
                .run(shutdown_rx)
                .await?
        }
        WorkerKind::Cost => {
            CostAggregator::new(bus, store, &config)
                .run(shutdown_rx)
                .await?
        }
    }

    tracing::info!("worker shutdown complete");
    Ok(())
}
