// Ingress configuration, loaded from the environment

use std::time::Duration;

use anyhow::{Context, Result};

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct IngressConfig {
    pub port: u16,
    /// Hard ceiling on request bodies, measured after decompression.
    pub max_body_bytes: usize,
    /// Total deadline per request; appends past it are abandoned.
    pub request_timeout: Duration,
    pub eventbus_url: String,
    pub stream_maxlen: usize,
    pub metadata_store_url: String,
    /// CORS origins allowed to call the collector.
    pub allowed_origins: Vec<String>,
}

impl IngressConfig {
    pub fn from_env() -> Result<Self> {
        let metadata_store_url = std::env::var("METADATA_STORE_URL")
            .context("METADATA_STORE_URL environment variable required")?;

        let allowed_origins = std::env::var("ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000,http://localhost:5173".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            port: env_parse("INGRESS_PORT", 4318),
            max_body_bytes: env_parse("INGRESS_MAX_BODY_BYTES", 5 * 1024 * 1024),
            request_timeout: Duration::from_millis(env_parse("INGRESS_REQUEST_TIMEOUT_MS", 30_000)),
            eventbus_url: std::env::var("EVENTBUS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379/0".to_string()),
            stream_maxlen: env_parse("EVENTBUS_STREAM_MAXLEN", 1_000_000),
            metadata_store_url,
            allowed_origins,
        })
    }
}
