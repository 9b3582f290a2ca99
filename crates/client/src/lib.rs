//! Asset cache client.
//!
//! [`CacheClient`] keeps FIFO download and upload queues and runs one
//! request at a time against the cache server, reconnecting with backoff
//! and requeueing interrupted requests. [`CacheManager`] is the front-end a
//! build pipeline talks to; it always checks the local cache directory
//! before going to the network.

pub mod client;
pub mod config;
pub mod manager;
pub mod queue;
pub mod types;

pub use client::CacheClient;
pub use config::CacheConfig;
pub use manager::{CacheManager, LocalCacheManager, NetworkCacheManager, build_cache_manager};
pub use queue::PendingQueue;
pub use types::{
    Completion, ConnectionStatus, Direction, Phase, ReconnectConfig, RequestError, RequestResult,
    Resolution,
};

/// Errors produced by the client crate.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config encode error: {0}")]
    ConfigEncode(#[from] toml::ser::Error),

    #[error("transport error: {0}")]
    Transport(#[from] assetcache_transport::TransportError),
}
