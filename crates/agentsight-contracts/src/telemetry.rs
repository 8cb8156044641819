// Tracing initialization shared by the pipeline binaries

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Logging configuration, loaded from the environment.
///
/// `RUST_LOG` takes the usual `tracing-subscriber` filter syntax; when it
/// is unset, the service's own crate logs at debug and everything else at
/// info.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name, also used as the default filter target.
    pub service_name: String,
    pub log_filter: Option<String>,
}

impl TelemetryConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            log_filter: std::env::var("RUST_LOG").ok(),
        }
    }
}

/// Initialize the global tracing subscriber.
///
/// Call once at the top of each binary's `main`.
pub fn init_telemetry(config: &TelemetryConfig) {
    let default_filter = format!("{}=debug,info", config.service_name.replace('-', "_"));
    let filter = config
        .log_filter
        .as_deref()
        .and_then(|f| EnvFilter::try_new(f).ok())
        .unwrap_or_else(|| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    tracing::info!(service = %config.service_name, "telemetry initialized");
}
