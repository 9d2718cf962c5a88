//! Configuration system for driftnet.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $DRIFTNET_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/driftnet/config.toml
//!   3. ~/.config/driftnet/config.toml

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::codec::Compression;
use crate::wire::MAX_CHUNK_PAYLOAD;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftnetConfig {
    pub transport: TransportConfig,
    pub reassembly: ReassemblyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Local UDP address the subscriber listens on.
    pub bind_addr: String,
    /// Remote UDP address the publisher sends to.
    pub peer_addr: String,
    /// Payload bytes per chunk, excluding the chunk header.
    pub max_chunk_bytes: usize,
    /// How long one publish may keep retrying transient send failures.
    pub publish_retry_timeout_ms: u64,
    /// "none" or "zstd".
    pub compression_codec: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReassemblyConfig {
    /// Trackers with no new chunk for this long are dropped.
    pub idle_eviction_secs: u64,
    /// Largest envelope a tracker will allocate for.
    pub max_message_bytes: u64,
    /// Cap on the reassembly buffers of all in-flight messages combined.
    pub max_in_flight_bytes: u64,
    /// Emit a progress delivery for every newly received chunk.
    pub notify_progress: bool,
    /// Capacity of the delivery channel.
    pub delivery_queue: usize,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:40123".to_string(),
            peer_addr: "127.0.0.1:40123".to_string(),
            max_chunk_bytes: 16_384,
            publish_retry_timeout_ms: 30_000,
            compression_codec: "none".to_string(),
        }
    }
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            idle_eviction_secs: 30,
            max_message_bytes: 256 * 1024 * 1024,
            max_in_flight_bytes: 1024 * 1024 * 1024,
            notify_progress: false,
            delivery_queue: 64,
        }
    }
}

impl TransportConfig {
    pub fn publish_retry_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_retry_timeout_ms)
    }

    pub fn compression(&self) -> Result<Compression, ConfigError> {
        Compression::from_name(&self.compression_codec)
            .map_err(|_| ConfigError::Invalid(format!(
                "transport.compression_codec: unknown codec {:?}",
                self.compression_codec
            )))
    }
}

impl ReassemblyConfig {
    pub fn idle_eviction(&self) -> Duration {
        Duration::from_secs(self.idle_eviction_secs)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("driftnet")
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
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl DriftnetConfig {
    /// Load config: env vars → file → defaults, then validate.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_file(&Self::file_path())?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Read `path`, falling back to defaults when it does not exist.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(DriftnetConfig::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        Self::from_toml(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("DRIFTNET_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config to `path` if nothing is there yet.
    pub fn write_default_if_missing(path: &Path) -> Result<(), ConfigError> {
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let text = toml::to_string_pretty(&DriftnetConfig::default())
            .map_err(ConfigError::SerializeFailed)?;
        std::fs::write(path, text).map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))
    }

    /// Reject values the transport cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.transport;
        if t.max_chunk_bytes == 0 || t.max_chunk_bytes > MAX_CHUNK_PAYLOAD {
            return Err(ConfigError::Invalid(format!(
                "transport.max_chunk_bytes must be between 1 and {MAX_CHUNK_PAYLOAD}, got {}",
                t.max_chunk_bytes
            )));
        }
        t.compression()?;

        let r = &self.reassembly;
        if r.idle_eviction_secs == 0 {
            return Err(ConfigError::Invalid(
                "reassembly.idle_eviction_secs must be positive".into(),
            ));
        }
        if r.max_message_bytes == 0 {
            return Err(ConfigError::Invalid(
                "reassembly.max_message_bytes must be positive".into(),
            ));
        }
        if r.max_in_flight_bytes < r.max_message_bytes {
            return Err(ConfigError::Invalid(
                "reassembly.max_in_flight_bytes must be at least max_message_bytes".into(),
            ));
        }
        if r.delivery_queue == 0 {
            return Err(ConfigError::Invalid(
                "reassembly.delivery_queue must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Apply DRIFTNET_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    // Unparseable numbers leave the file value in place; validate() runs after.
    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("DRIFTNET_TRANSPORT__BIND_ADDR") {
            self.transport.bind_addr = v;
        }
        if let Some(v) = var("DRIFTNET_TRANSPORT__PEER_ADDR") {
            self.transport.peer_addr = v;
        }
        if let Some(v) = var("DRIFTNET_TRANSPORT__MAX_CHUNK_BYTES") {
            if let Ok(n) = v.parse() {
                self.transport.max_chunk_bytes = n;
            }
        }
        if let Some(v) = var("DRIFTNET_TRANSPORT__COMPRESSION_CODEC") {
            self.transport.compression_codec = v;
        }
        if let Some(v) = var("DRIFTNET_REASSEMBLY__IDLE_EVICTION_SECS") {
            if let Ok(n) = v.parse() {
                self.reassembly.idle_eviction_secs = n;
            }
        }
    }
}
