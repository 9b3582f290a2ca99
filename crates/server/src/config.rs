//! Server configuration.
//!
//! Stored as TOML; every field has a default so partial files work.

use std::path::{Path, PathBuf};
use std::time::Duration;

use assetcache_protocol::constants::{DEFAULT_IDENTIFIER, DEFAULT_PORT};
use serde::{Deserialize, Serialize};

use crate::ServerError;

/// Cache server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Directory holding cached artifacts. Created on startup.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// TCP port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Disk quota for the cache directory, in MiB.
    #[serde(default = "default_quota_mb")]
    pub quota_mb: u64,

    /// Identity string clients must present.
    #[serde(default = "default_identifier")]
    pub identifier: String,

    /// Interval between server ticks, in milliseconds.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("AssetCache")
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_quota_mb() -> u64 {
    1024
}

fn default_identifier() -> String {
    DEFAULT_IDENTIFIER.into()
}

fn default_tick_interval_ms() -> u64 {
    16
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            port: default_port(),
            quota_mb: default_quota_mb(),
            identifier: default_identifier(),
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

impl ServerConfig {
    /// Quota in bytes.
    pub fn quota_bytes(&self) -> u64 {
        self.quota_mb.saturating_mul(1024 * 1024)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    /// Loads configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ServerError> {
        let content = std::fs::read_to_string(path)?;
        let config: ServerConfig = toml::from_str(&content)?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Saves configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<(), ServerError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Rejects values the server cannot run with.
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.quota_mb == 0 {
            return Err(ServerError::InvalidConfig("quota_mb must be positive".into()));
        }
        if self.identifier.is_empty() {
            return Err(ServerError::InvalidConfig("identifier must not be empty".into()));
        }
        Ok(())
    }
}
