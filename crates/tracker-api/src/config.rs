//! Environment configuration for the API server.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Memory,
    Sqlite,
}

impl FromStr for Backend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Backend::Memory),
            "sqlite" => Ok(Backend::Sqlite),
            other => Err(ConfigError::Backend(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("TRACKER_LISTEN is not a socket address: {0}")]
    Listen(String),
    #[error("TRACKER_BACKEND must be memory or sqlite, got {0}")]
    Backend(String),
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub listen: SocketAddr,
    pub backend: Backend,
    pub sqlite_path: PathBuf,
}

impl ApiConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable lookup; unset variables take their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen = lookup("TRACKER_LISTEN").unwrap_or_else(|| "0.0.0.0:8002".to_string());
        let listen = listen
            .parse()
            .map_err(|_| ConfigError::Listen(listen.clone()))?;
        let backend = match lookup("TRACKER_BACKEND") {
            Some(b) => b.parse()?,
            None => Backend::Memory,
        };
        let sqlite_path = lookup("TRACKER_SQLITE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("tracker.db"));
        Ok(Self {
            listen,
            backend,
            sqlite_path,
        })
    }
}
