//! Cache front-ends used by the build pipeline.

use std::path::{Path, PathBuf};
use std::time::Duration;

use assetcache_protocol::CacheKey;
use assetcache_transport::{Connector, TcpConnector};
use tokio::runtime::Handle;
use tracing::debug;

use crate::client::CacheClient;
use crate::config::CacheConfig;
use crate::types::{Completion, RequestError, Resolution};

/// Where artifacts come from and go to.
///
/// Every request resolves through its completion exactly once. A failure
/// means the caller builds the artifact itself.
pub trait CacheManager: Send {
    /// Looks for `key`, fetching it into the local cache if needed.
    fn fetch(&mut self, key: CacheKey, on_done: Completion);

    /// Announces a freshly built artifact so it can be shared.
    fn publish(&mut self, key: CacheKey, on_done: Completion);

    /// Drives any background work. Call regularly.
    fn tick(&mut self, _elapsed: Duration) {}
}

fn local_path(dir: &Path, key: &CacheKey) -> PathBuf {
    dir.join(&key.file_name)
}

/// Cache backed only by the local directory.
pub struct LocalCacheManager {
    dir: PathBuf,
}

impl LocalCacheManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl CacheManager for LocalCacheManager {
    fn fetch(&mut self, key: CacheKey, on_done: Completion) {
        let result = if local_path(&self.dir, &key).is_file() {
            Ok(Resolution::FoundLocally)
        } else {
            Err(RequestError::Unavailable)
        };
        on_done(&key, result);
    }

    /// The artifact already lives in the local directory; nothing to do.
    fn publish(&mut self, key: CacheKey, on_done: Completion) {
        on_done(&key, Ok(Resolution::AlreadyPresent));
    }
}

/// Local directory first, then the cache server.
pub struct NetworkCacheManager {
    client: CacheClient,
}

impl NetworkCacheManager {
    pub fn new(config: CacheConfig, connector: Box<dyn Connector>) -> Self {
        Self {
            client: CacheClient::new(config, connector),
        }
    }

    pub fn client(&self) -> &CacheClient {
        &self.client
    }
}

impl CacheManager for NetworkCacheManager {
    fn fetch(&mut self, key: CacheKey, on_done: Completion) {
        if local_path(&self.client.config().local_cache_dir, &key).is_file() {
            debug!(file = %key.file_name, "local cache hit");
            on_done(&key, Ok(Resolution::FoundLocally));
            return;
        }
        self.client.fetch(key, on_done);
    }

    fn publish(&mut self, key: CacheKey, on_done: Completion) {
        self.client.publish(key, on_done);
    }

    fn tick(&mut self, elapsed: Duration) {
        self.client.tick(elapsed);
    }
}

/// Builds the manager selected by `config.use_server`.
///
/// The network manager connects over TCP, spawning its I/O on `runtime`.
pub fn build_cache_manager(config: &CacheConfig, runtime: Handle) -> Box<dyn CacheManager> {
    if !config.use_server {
        return Box::new(LocalCacheManager::new(config.local_cache_dir.clone()));
    }
    let connector = TcpConnector::new(config.server_address(), config.identifier.clone(), runtime);
    Box::new(NetworkCacheManager::new(config.clone(), Box::new(connector)))
}
