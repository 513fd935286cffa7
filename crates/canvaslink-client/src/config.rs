use std::time::Duration;

use canvaslink_protocol::{DEFAULT_CHUNK_SIZE, DEFAULT_PORT, DEFAULT_REQUEST_TIMEOUT_MS};

use crate::backoff::BackoffConfig;

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub host: String,
    pub port: u16,
    /// Deadline applied to each dispatched command unless overridden.
    pub request_timeout: Duration,
    /// Chunk size for progress-reported bulk operations.
    pub chunk_size: usize,
    /// Whether a lost socket schedules a reconnect.
    pub auto_reconnect: bool,
    pub backoff: BackoffConfig,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            chunk_size: DEFAULT_CHUNK_SIZE,
            auto_reconnect: true,
            backoff: BackoffConfig::default(),
        }
    }
}

impl LinkConfig {
    pub fn url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }
}
