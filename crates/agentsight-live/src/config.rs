// Broadcast tier configuration, loaded from the environment

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct LiveConfig {
    pub port: u16,
    pub eventbus_url: String,
    pub stream_maxlen: usize,
    /// Per-subscriber outgoing queue capacity.
    pub subscriber_queue_size: usize,
}

impl LiveConfig {
    pub fn from_env() -> Self {
        Self {
            port: env_parse("LIVE_PORT", 4319),
            eventbus_url: std::env::var("EVENTBUS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379/0".to_string()),
            stream_maxlen: env_parse("EVENTBUS_STREAM_MAXLEN", 1_000_000),
            subscriber_queue_size: env_parse("BROADCAST_SUBSCRIBER_QUEUE_SIZE", 256),
        }
    }
}
