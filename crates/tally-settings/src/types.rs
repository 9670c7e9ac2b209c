//! Settings types. Every struct is `#[serde(default)]` so a partial file
//! deserializes cleanly.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TallySettings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    /// Development mode: permissive CORS and `debug` logging.
    pub development: bool,
}

impl TallySettings {
    /// Apply what development mode implies. Called by the loader after env
    /// overrides, so `DEVELOPMENT=1` wins over the file.
    pub fn apply_development(&mut self) {
        if self.development {
            self.server.allowed_origins = vec!["*".to_string()];
            self.logging.level = "debug".to_string();
        }
    }
}

/// Network and runtime settings for the HTTP/WebSocket server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port. `0` asks the OS for a free one.
    pub port: u16,
    /// CORS origins. A single `*` allows any origin.
    pub allowed_origins: Vec<String>,
    /// Largest inbound WebSocket message, in bytes.
    pub max_message_size: usize,
    /// Capacity of each connection's outbound queue.
    pub send_queue_size: usize,
    /// WebSocket ping interval in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// How long an empty session lingers before it is reaped.
    pub session_timeout_ms: u64,
    /// How often the reaper runs.
    pub reap_interval_ms: u64,
    /// Upper bound on graceful shutdown.
    pub shutdown_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            allowed_origins: vec!["*".to_string()],
            max_message_size: 1024,
            send_queue_size: 64,
            heartbeat_interval_ms: 30_000,
            session_timeout_ms: 24 * 60 * 60 * 1000,
            reap_interval_ms: 60_000,
            shutdown_timeout_ms: 10_000,
        }
    }
}

impl ServerSettings {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter level (`trace` .. `error`).
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}
