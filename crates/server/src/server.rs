//! Cache server tick loop and peer registry.

use std::collections::HashMap;
use std::time::Duration;

use assetcache_protocol::{Message, MessageType};
use assetcache_transport::{ConnectionId, EventReceiver, Link, TransportEvent, validate_identity};
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ServerError;
use crate::config::ServerConfig;
use crate::peer::ServerPeer;
use crate::quota::remove_stale_partials;

/// The asset cache server.
///
/// Consumes transport events and drives every [`ServerPeer`] from one
/// loop, so peers never touch the cache directory concurrently.
pub struct CacheServer {
    config: ServerConfig,
    events: EventReceiver,
    peers: HashMap<ConnectionId, ServerPeer>,
}

impl CacheServer {
    /// Creates the server, creating the cache directory if needed and
    /// clearing uploads interrupted by a previous run.
    pub fn new(config: ServerConfig, events: EventReceiver) -> Result<Self, ServerError> {
        config.validate()?;
        std::fs::create_dir_all(&config.cache_dir)?;
        let stale = remove_stale_partials(&config.cache_dir)?;
        if stale > 0 {
            info!(count = stale, "removed interrupted uploads");
        }
        info!(
            dir = %config.cache_dir.display(),
            quota_mb = config.quota_mb,
            "cache server ready"
        );
        Ok(Self {
            config,
            events,
            peers: HashMap::new(),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peer(&self, id: ConnectionId) -> Option<&ServerPeer> {
        self.peers.get(&id)
    }

    /// Applies one transport event.
    pub fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { link, identity } => self.on_connected(link, &identity),
            TransportEvent::Disconnected { id } => {
                if self.peers.remove(&id).is_some() {
                    info!(peer = %id, "client disconnected");
                } else {
                    debug!(conn = %id, "disconnect from unaccepted connection");
                }
            }
            TransportEvent::Message { id, message } => match self.peers.get_mut(&id) {
                Some(peer) => peer.handle_message(message),
                None => debug!(conn = %id, msg = %message.msg_type, "message from unknown connection"),
            },
            TransportEvent::ConnectFailed { reason } => {
                debug!("ignoring outbound connect failure: {reason}");
            }
        }
    }

    fn on_connected(&mut self, link: Link, identity: &str) {
        if !validate_identity(identity, &self.config.identifier) {
            warn!(conn = %link.id(), addr = %link.peer_addr(), "rejecting client: bad identity");
            link.close();
            return;
        }

        if link
            .send(Message::empty(MessageType::ConnectionAccepted))
            .is_err()
        {
            warn!(conn = %link.id(), "client went away during accept");
            return;
        }

        info!(peer = %link.id(), addr = %link.peer_addr(), "client connected");
        let peer = ServerPeer::new(
            link,
            self.config.cache_dir.clone(),
            self.config.quota_bytes(),
        );
        self.peers.insert(peer.id(), peer);
    }

    /// Drains pending events, then advances every peer by `elapsed`.
    ///
    /// Returns `false` once the event source has closed.
    pub fn tick(&mut self, elapsed: Duration) -> bool {
        let open = loop {
            match self.events.try_recv() {
                Ok(event) => self.handle_event(event),
                Err(TryRecvError::Empty) => break true,
                Err(TryRecvError::Disconnected) => break false,
            }
        };

        for peer in self.peers.values_mut() {
            peer.tick(elapsed);
        }
        open
    }

    /// Runs the tick loop until cancellation or until the transport stops.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), ServerError> {
        let mut interval = tokio::time::interval(self.config.tick_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last = tokio::time::Instant::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("cache server shutting down");
                    break;
                }

                now = interval.tick() => {
                    let elapsed = now.saturating_duration_since(last);
                    last = now;
                    if !self.tick(elapsed) {
                        warn!("transport closed, stopping cache server");
                        break;
                    }
                }
            }
        }

        for (_, peer) in self.peers.drain() {
            peer.link().close();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assetcache_transport::event::{self, EventSender};
    use assetcache_protocol::{FileFragment, FileTransferStart};
    use assetcache_transport::{Connector, MemoryNetwork};
    use filetime::{FileTime, set_file_mtime};
    use tempfile::TempDir;

    fn server(dir: &TempDir) -> (CacheServer, MemoryNetwork) {
        let (tx, rx): (EventSender, EventReceiver) = event::channel();
        let config = ServerConfig {
            cache_dir: dir.path().join("cache"),
            quota_mb: 10,
            ..ServerConfig::default()
        };
        let server = CacheServer::new(config, rx).unwrap();
        (server, MemoryNetwork::new(tx))
    }

    fn client_messages(rx: &mut EventReceiver) -> Vec<MessageType> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            if let TransportEvent::Message { message, .. } = ev {
                out.push(message.msg_type);
            }
        }
        out
    }

    #[test]
    fn creates_cache_directory() {
        let dir = TempDir::new().unwrap();
        let (server, _network) = server(&dir);
        assert!(server.config().cache_dir.is_dir());
    }

    #[test]
    fn accepts_matching_identity() {
        let dir = TempDir::new().unwrap();
        let (mut server, network) = server(&dir);
        let (client_tx, mut client_rx) = event::channel();

        network.connector("AssetCacheClient").connect(&client_tx).unwrap();
        server.tick(Duration::ZERO);
        assert_eq!(server.peer_count(), 1);

        network.pump();
        assert_eq!(
            client_messages(&mut client_rx),
            vec![MessageType::ConnectionAccepted]
        );
    }

    #[test]
    fn rejects_wrong_identity() {
        let dir = TempDir::new().unwrap();
        let (mut server, network) = server(&dir);
        let (client_tx, mut client_rx) = event::channel();

        network.connector("SomeoneElse").connect(&client_tx).unwrap();
        server.tick(Duration::ZERO);
        assert_eq!(server.peer_count(), 0);

        network.pump();
        assert_eq!(network.open_connections(), 0);
        assert!(client_messages(&mut client_rx).is_empty());
        server.tick(Duration::ZERO);
        assert_eq!(server.peer_count(), 0);
    }

    #[test]
    fn disconnect_removes_peer() {
        let dir = TempDir::new().unwrap();
        let (mut server, network) = server(&dir);
        let (client_tx, _client_rx) = event::channel();

        network.connector("AssetCacheClient").connect(&client_tx).unwrap();
        network.connector("AssetCacheClient").connect(&client_tx).unwrap();
        server.tick(Duration::ZERO);
        assert_eq!(server.peer_count(), 2);

        network.disconnect_all();
        server.tick(Duration::ZERO);
        assert_eq!(server.peer_count(), 0);
    }

    #[test]
    fn routes_messages_to_owning_peer() {
        let dir = TempDir::new().unwrap();
        let (mut server, network) = server(&dir);
        let (client_tx, mut client_rx) = event::channel();

        network.connector("AssetCacheClient").connect(&client_tx).unwrap();
        let client_link = match client_rx.try_recv().unwrap() {
            TransportEvent::Connected { link, .. } => link,
            other => panic!("expected Connected, got {other:?}"),
        };
        server.tick(Duration::ZERO);

        client_link
            .send(Message::with_name(MessageType::RequestDownload, "x.[1].bin"))
            .unwrap();
        network.pump();
        server.tick(Duration::ZERO);
        network.pump();

        assert_eq!(
            client_messages(&mut client_rx),
            vec![
                MessageType::ConnectionAccepted,
                MessageType::DownloadRequestRejectUnavailable
            ]
        );
    }

    /// A client link attached to a running server.
    struct TestClient {
        link: Link,
        rx: EventReceiver,
    }

    impl TestClient {
        fn connect(server: &mut CacheServer, network: &MemoryNetwork) -> Self {
            let (tx, mut rx) = event::channel();
            network.connector("AssetCacheClient").connect(&tx).unwrap();
            let link = match rx.try_recv().unwrap() {
                TransportEvent::Connected { link, .. } => link,
                other => panic!("expected Connected, got {other:?}"),
            };
            server.tick(Duration::ZERO);
            network.pump();
            assert_eq!(client_messages(&mut rx), vec![MessageType::ConnectionAccepted]);
            Self { link, rx }
        }

        /// Sends `msg`, runs one server tick and returns the replies.
        fn exchange(
            &mut self,
            server: &mut CacheServer,
            network: &MemoryNetwork,
            msg: Message,
        ) -> Vec<MessageType> {
            self.link.send(msg).unwrap();
            network.pump();
            server.tick(Duration::ZERO);
            network.pump();
            client_messages(&mut self.rx)
        }
    }

    const MIB: u64 = 1024 * 1024;

    fn start(name: &str, size: u64, fragments: u32) -> Message {
        Message::transfer_start(&FileTransferStart {
            file_name: name.into(),
            file_size: size,
            num_fragments: fragments,
        })
        .unwrap()
    }

    fn fragment(id: u32, data: Vec<u8>) -> Message {
        Message::fragment(&FileFragment::new(id, data)).unwrap()
    }

    #[test]
    fn clears_interrupted_uploads_on_start() {
        let dir = TempDir::new().unwrap();
        let cache = dir.path().join("cache");
        std::fs::create_dir_all(&cache).unwrap();
        std::fs::write(cache.join(".a.[1].bin.part"), b"half").unwrap();
        std::fs::write(cache.join("b.[2].bin"), b"whole").unwrap();

        let (_server, _network) = server(&dir);
        assert!(!cache.join(".a.[1].bin.part").exists());
        assert!(cache.join("b.[2].bin").exists());
    }

    #[test]
    fn upload_in_progress_is_invisible_to_other_peers() {
        let dir = TempDir::new().unwrap();
        let (mut server, network) = server(&dir);
        let cache = server.config().cache_dir.clone();
        let mut a = TestClient::connect(&mut server, &network);
        let mut b = TestClient::connect(&mut server, &network);

        let name = "x.[1].bin";
        assert_eq!(
            a.exchange(&mut server, &network, Message::with_name(MessageType::RequestUpload, name)),
            vec![MessageType::UploadRequestAccept]
        );
        // Both peers may be accepted before either starts sending.
        assert_eq!(
            b.exchange(&mut server, &network, Message::with_name(MessageType::RequestUpload, name)),
            vec![MessageType::UploadRequestAccept]
        );
        assert!(a.exchange(&mut server, &network, start(name, 6, 2)).is_empty());
        assert!(a.exchange(&mut server, &network, fragment(0, b"abc".to_vec())).is_empty());
        assert!(cache.join(".x.[1].bin.part").exists());
        assert!(!cache.join(name).exists());

        // The second uploader loses the race and the staged file is untouched.
        assert_eq!(
            b.exchange(&mut server, &network, start(name, 6, 2)),
            vec![MessageType::UploadFailedError]
        );
        assert_eq!(
            b.exchange(&mut server, &network, Message::with_name(MessageType::RequestUpload, name)),
            vec![MessageType::UploadFailedError]
        );
        assert_eq!(
            b.exchange(&mut server, &network, Message::with_name(MessageType::RequestDownload, name)),
            vec![MessageType::DownloadRequestRejectUnavailable]
        );
        assert_eq!(std::fs::metadata(cache.join(".x.[1].bin.part")).unwrap().len(), 3);

        assert_eq!(
            a.exchange(&mut server, &network, fragment(1, b"def".to_vec())),
            vec![MessageType::UploadComplete]
        );
        assert_eq!(std::fs::read(cache.join(name)).unwrap(), b"abcdef");
        assert!(!cache.join(".x.[1].bin.part").exists());

        assert_eq!(
            b.exchange(&mut server, &network, Message::with_name(MessageType::RequestUpload, name)),
            vec![MessageType::UploadRequestRejectFileExists]
        );
        let request = Message::with_name(MessageType::RequestDownload, name);
        let mut download = b.exchange(&mut server, &network, request);
        server.tick(Duration::ZERO);
        network.pump();
        download.extend(client_messages(&mut b.rx));
        assert_eq!(
            download,
            vec![MessageType::FileTransferStart, MessageType::FileTransferFragment]
        );
    }

    #[test]
    fn eviction_spares_another_peers_upload() {
        let dir = TempDir::new().unwrap();
        let (mut server, network) = server(&dir);
        let cache = server.config().cache_dir.clone();
        let old = cache.join("old.[0].bin");
        std::fs::File::create(&old).unwrap().set_len(4 * MIB).unwrap();
        set_file_mtime(&old, FileTime::from_unix_time(1_000, 0)).unwrap();

        let mut a = TestClient::connect(&mut server, &network);
        let mut b = TestClient::connect(&mut server, &network);
        let chunk = |byte: u8| vec![byte; MIB as usize];

        a.exchange(&mut server, &network, Message::with_name(MessageType::RequestUpload, "a.[1].bin"));
        assert!(a.exchange(&mut server, &network, start("a.[1].bin", 4 * MIB, 4)).is_empty());
        a.exchange(&mut server, &network, fragment(0, chunk(1)));
        a.exchange(&mut server, &network, fragment(1, chunk(2)));
        let partial = cache.join(".a.[1].bin.part");
        assert_eq!(std::fs::metadata(&partial).unwrap().len(), 2 * MIB);
        // Older than every completed entry, so plain LRU would pick it first.
        set_file_mtime(&partial, FileTime::from_unix_time(500, 0)).unwrap();

        // 4 MiB stored + 2 MiB staged of 10; fitting 5 MiB needs one eviction.
        b.exchange(&mut server, &network, Message::with_name(MessageType::RequestUpload, "b.[2].bin"));
        assert!(b.exchange(&mut server, &network, start("b.[2].bin", 5 * MIB, 5)).is_empty());
        assert!(!old.exists());
        assert!(partial.exists());

        a.exchange(&mut server, &network, fragment(2, chunk(3)));
        assert_eq!(
            a.exchange(&mut server, &network, fragment(3, chunk(4))),
            vec![MessageType::UploadComplete]
        );
        let stored = std::fs::read(cache.join("a.[1].bin")).unwrap();
        assert_eq!(stored.len() as u64, 4 * MIB);
        assert_eq!(stored[0], 1);
        assert_eq!(stored[stored.len() - 1], 4);
    }

    #[test]
    fn tick_reports_closed_transport() {
        let dir = TempDir::new().unwrap();
        let (mut server, network) = server(&dir);
        drop(network);
        assert!(!server.tick(Duration::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_cancel() {
        let dir = TempDir::new().unwrap();
        let (server, _network) = server(&dir);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(server.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
