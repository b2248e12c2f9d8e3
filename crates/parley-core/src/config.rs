//! Configuration system for Parley.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $PARLEY_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/parley/config.toml
//!   3. ~/.config/parley/config.toml

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParleyConfig {
    pub transport: TransportConfig,
    pub dispatch: DispatchConfig,
    pub server: ServerConfig,
    pub client: ClientConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// How long a sender waits for an ACK before retransmitting.
    pub ack_timeout_ms: u64,
    /// Total transmissions of one envelope before giving up.
    pub max_attempts: u32,
    /// Upper bound on a single blocking receive; bounds shutdown latency.
    pub poll_interval_ms: u64,
    /// Receive buffer size. Larger datagrams are truncated and fail the digest.
    pub max_datagram_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Concurrent handler tasks per node.
    pub workers: usize,
    /// Inbound envelopes buffered while all workers are busy.
    pub queue_depth: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub bind_host: String,
    /// How long a peer waits for the server's `resp:` to a request.
    pub reply_timeout_ms: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 500,
            max_attempts: 5,
            poll_interval_ms: 100,
            max_datagram_bytes: crate::wire::MAX_DATAGRAM,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 16,
            queue_depth: 1024,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            port: 50000,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            reply_timeout_ms: 10_000,
        }
    }
}

impl TransportConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl ClientConfig {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("parley")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid setting {0}: {1}")]
    Invalid(&'static str, &'static str),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl ParleyConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_from(&Self::file_path())?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load a config file, falling back to defaults if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(ParleyConfig::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("PARLEY_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        Self::write_default_to(&path)?;
        Ok(path)
    }

    /// Write the default config to `path` unless a file is already there.
    pub fn write_default_to(path: &Path) -> Result<(), ConfigError> {
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let text = toml::to_string_pretty(&ParleyConfig::default())
            .map_err(ConfigError::SerializeFailed)?;
        std::fs::write(path, text).map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))
    }

    /// Apply PARLEY_* overrides. `lookup` is `std::env::var` outside tests.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("PARLEY_TRANSPORT__ACK_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.transport.ack_timeout_ms = v;
        }
        if let Some(v) = lookup("PARLEY_TRANSPORT__MAX_ATTEMPTS").and_then(|v| v.parse().ok()) {
            self.transport.max_attempts = v;
        }
        if let Some(v) = lookup("PARLEY_DISPATCH__WORKERS").and_then(|v| v.parse().ok()) {
            self.dispatch.workers = v;
        }
        if let Some(v) = lookup("PARLEY_SERVER__PORT").and_then(|v| v.parse().ok()) {
            self.server.port = v;
        }
    }

    /// Reject settings that would make the node unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transport.max_attempts == 0 {
            return Err(ConfigError::Invalid("transport.max_attempts", "must be at least 1"));
        }
        if self.transport.ack_timeout_ms == 0 {
            return Err(ConfigError::Invalid("transport.ack_timeout_ms", "must be non-zero"));
        }
        if self.transport.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("transport.poll_interval_ms", "must be non-zero"));
        }
        if self.dispatch.workers == 0 || self.dispatch.queue_depth == 0 {
            return Err(ConfigError::Invalid("dispatch", "workers and queue_depth must be non-zero"));
        }
        Ok(())
    }
}
