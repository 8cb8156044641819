// Worker configuration, loaded from the environment

use std::path::PathBuf;
use std::time::Duration;

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Redis URL for the event bus.
    pub eventbus_url: String,
    /// Approximate cap on stream length.
    pub stream_maxlen: usize,
    /// ClickHouse HTTP endpoint.
    pub columnar_url: String,
    /// Instance tag for consumer names (`writer-<tag>` etc). Must be
    /// stable across restarts and distinct between processes of the same
    /// worker kind.
    pub consumer_name: String,
    /// Buffered rows that trigger a flush.
    pub batch_size: usize,
    /// Elapsed time that triggers a flush regardless of batch size.
    pub flush_interval: Duration,
    /// Max wait on an empty stream read.
    pub poll_interval: Duration,
    /// Flush attempts before the writer spills its buffer to disk.
    pub insert_retry_budget: u32,
    /// Writer spill file location.
    pub spill_path: PathBuf,
    /// Spans buffered in memory before reads pause.
    pub buffer_hard_cap: usize,
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        Self {
            eventbus_url: std::env::var("EVENTBUS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379/0".to_string()),
            stream_maxlen: env_parse("EVENTBUS_STREAM_MAXLEN", 1_000_000),
            columnar_url: std::env::var("COLUMNAR_STORE_URL")
                .unwrap_or_else(|_| "http://localhost:8123".to_string()),
            consumer_name: std::env::var("CONSUMER_NAME").unwrap_or_else(|_| "1".to_string()),
            batch_size: env_parse("WORKER_BATCH_SIZE", 1_000),
            flush_interval: Duration::from_millis(env_parse("WORKER_FLUSH_INTERVAL_MS", 1_000)),
            poll_interval: Duration::from_millis(500),
            insert_retry_budget: env_parse("COLUMNAR_INSERT_RETRY_BUDGET", 10),
            spill_path: std::env::var("WORKER_SPILL_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./agentsight-spill.bin")),
            buffer_hard_cap: 50_000,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
