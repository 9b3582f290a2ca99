//! Asset cache server.
//!
//! A [`CacheServer`] owns one [`ServerPeer`] per accepted client and drives
//! them all from a single tick loop. Peers serve downloads straight from the
//! cache directory and accept uploads after making room under the disk
//! quota (see [`quota`]).

pub mod config;
pub mod peer;
pub mod quota;
pub mod server;

pub use config::ServerConfig;
pub use peer::ServerPeer;
pub use server::CacheServer;

/// Errors produced by the cache server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Transport(#[from] assetcache_transport::TransportError),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config encode error: {0}")]
    ConfigEncode(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    InvalidConfig(String),
}
