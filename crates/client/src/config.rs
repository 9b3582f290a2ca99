//! Client-side cache configuration.

use std::path::{Path, PathBuf};

use assetcache_protocol::constants::{DEFAULT_IDENTIFIER, DEFAULT_PORT};
use serde::{Deserialize, Serialize};

use crate::ClientError;
use crate::types::ReconnectConfig;

/// How a build process reaches its caches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Use the remote cache server in addition to the local directory.
    #[serde(default)]
    pub use_server: bool,

    #[serde(default = "default_server_ip")]
    pub server_ip: String,

    #[serde(default = "default_server_port")]
    pub server_port: u16,

    /// Identity string presented to the server.
    #[serde(default = "default_identifier")]
    pub identifier: String,

    /// Directory holding locally built or downloaded artifacts.
    #[serde(default = "default_local_cache_dir")]
    pub local_cache_dir: PathBuf,

    /// Consecutive failed connection attempts before pending requests are
    /// failed.
    #[serde(default = "default_max_connect_retries")]
    pub max_connect_retries: u32,

    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

fn default_server_ip() -> String {
    "127.0.0.1".into()
}

fn default_server_port() -> u16 {
    DEFAULT_PORT
}

fn default_identifier() -> String {
    DEFAULT_IDENTIFIER.into()
}

fn default_local_cache_dir() -> PathBuf {
    PathBuf::from("Library/AssetCache")
}

fn default_max_connect_retries() -> u32 {
    5
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            use_server: false,
            server_ip: default_server_ip(),
            server_port: default_server_port(),
            identifier: default_identifier(),
            local_cache_dir: default_local_cache_dir(),
            max_connect_retries: default_max_connect_retries(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl CacheConfig {
    /// `ip:port` of the cache server.
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server_ip, self.server_port)
    }

    pub fn load(path: &Path) -> Result<Self, ClientError> {
        let content = std::fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        tracing::debug!(path = %path.display(), "cache configuration loaded");
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ClientError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }
}
