//! Configuration system for Kerf.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $KERF_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/kerf/config.toml
//!   3. ~/.config/kerf/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KerfConfig {
    pub network: NetworkConfig,
    pub auth: AuthConfig,
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the gateway listens on.
    pub bind_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HMAC secret shared with the token issuer. Must be set; the
    /// daemon refuses to start without it.
    pub shared_secret: String,
}

/// Stream-registry bounds. The pre-creation and post-creation
/// out-of-order limits are deliberately independent knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Concurrent uploads with an installed sink.
    pub max_active_streams: usize,
    /// Distinct request ids whose chunks arrived before a sink existed.
    pub max_pending_ids: usize,
    /// Buffered chunks per such id.
    pub max_pending_chunks_per_id: usize,
    /// Out-of-order chunks held inside one active stream.
    pub max_out_of_order: usize,
    /// Total bytes accepted on one upload.
    pub max_stream_bytes: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8443".to_string(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            shared_secret: String::new(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_active_streams: 10,
            max_pending_ids: 16,
            max_pending_chunks_per_id: 256,
            max_out_of_order: 64,
            max_stream_bytes: 50 * 1024 * 1024, // 50 MiB
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_or_tmp().join(".config"))
        .join("kerf")
}

fn home_or_tmp() -> PathBuf {
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
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl KerfConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            KerfConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("KERF_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Apply KERF_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("KERF_NETWORK__BIND_ADDR") {
            self.network.bind_addr = v;
        }
        if let Ok(v) = std::env::var("KERF_AUTH__SHARED_SECRET") {
            self.auth.shared_secret = v;
        }
        if let Ok(v) = std::env::var("KERF_LIMITS__MAX_ACTIVE_STREAMS") {
            if let Ok(n) = v.parse() {
                self.limits.max_active_streams = n;
            }
        }
        if let Ok(v) = std::env::var("KERF_LIMITS__MAX_STREAM_BYTES") {
            if let Ok(n) = v.parse() {
                self.limits.max_stream_bytes = n;
            }
        }
    }
}
