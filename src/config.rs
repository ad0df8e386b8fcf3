//! Chat Server Configuration
//!
//! Configuration loaded from environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::users::StorageBackend;

/// Chat server configuration.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Address the WebSocket listener binds to.
    pub listen_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Maximum inbound frame size in bytes.
    pub max_message_size: usize,
    /// Rate limit (events per minute per user).
    pub rate_limit_per_min: u32,
    /// Storage backend (memory or sqlite).
    pub storage_backend: StorageBackend,
    /// Data directory for persistent storage.
    pub data_dir: PathBuf,
    /// Idle timeout in seconds (for slowloris protection).
    pub idle_timeout_secs: u64,
    /// Secret used to verify access tokens. Empty means unconfigured.
    pub jwt_secret: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        ChatConfig {
            listen_addr: "0.0.0.0:8080".parse().unwrap(),
            max_connections: 1000,
            max_message_size: 65_536, // 64 KB; messages are capped at 1000 chars
            rate_limit_per_min: 300,  // typing signals are chatty
            storage_backend: StorageBackend::Sqlite,
            data_dir: PathBuf::from("./data"),
            idle_timeout_secs: 300,
            jwt_secret: String::new(),
        }
    }
}

impl ChatConfig {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("PARLEY_LISTEN_ADDR") {
            if let Ok(parsed) = addr.parse() {
                config.listen_addr = parsed;
            }
        }

        if let Ok(val) = std::env::var("PARLEY_MAX_CONNECTIONS") {
            if let Ok(parsed) = val.parse() {
                config.max_connections = parsed;
            }
        }

        if let Ok(val) = std::env::var("PARLEY_MAX_MESSAGE_SIZE") {
            if let Ok(parsed) = val.parse() {
                config.max_message_size = parsed;
            }
        }

        if let Ok(val) = std::env::var("PARLEY_RATE_LIMIT") {
            if let Ok(parsed) = val.parse() {
                config.rate_limit_per_min = parsed;
            }
        }

        if let Ok(val) = std::env::var("PARLEY_STORAGE_BACKEND") {
            config.storage_backend = match val.to_lowercase().as_str() {
                "memory" => StorageBackend::Memory,
                _ => StorageBackend::Sqlite,
            };
        }

        if let Ok(val) = std::env::var("PARLEY_DATA_DIR") {
            config.data_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("PARLEY_IDLE_TIMEOUT") {
            if let Ok(parsed) = val.parse() {
                config.idle_timeout_secs = parsed;
            }
        }

        if let Ok(val) = std::env::var("PARLEY_JWT_SECRET") {
            config.jwt_secret = val;
        }

        config
    }

    /// Returns the idle timeout as a Duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}
