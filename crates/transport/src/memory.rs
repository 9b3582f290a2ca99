//! In-process backend.
//!
//! A [`MemoryNetwork`] joins any number of client connectors to a single
//! server event stream. Nothing moves until [`MemoryNetwork::pump`] is
//! called, which makes delivery order fully deterministic for
//! single-threaded tick loops.

use std::sync::{Arc, Mutex, PoisonError};

use assetcache_protocol::Message;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::event::{ConnectionId, EventSender, TransportEvent};
use crate::link::Link;
use crate::{Connector, LINK_QUEUE_CAPACITY, TransportError};

/// Shared in-memory network with one server endpoint.
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

struct NetworkInner {
    server_events: EventSender,
    bridges: Vec<Bridge>,
    refusing: bool,
}

/// One side of a bridged connection.
struct Endpoint {
    id: ConnectionId,
    cancel: CancellationToken,
    outbound: mpsc::Receiver<Message>,
    events: EventSender,
}

struct Bridge {
    client: Endpoint,
    server: Endpoint,
}

impl Bridge {
    fn is_open(&self) -> bool {
        !self.client.cancel.is_cancelled() && !self.server.cancel.is_cancelled()
    }

    fn close(&mut self) {
        self.client.cancel.cancel();
        self.server.cancel.cancel();
        let _ = self.client.events.send(TransportEvent::Disconnected {
            id: self.client.id,
        });
        let _ = self.server.events.send(TransportEvent::Disconnected {
            id: self.server.id,
        });
    }

    /// Moves every queued message to the other side. Returns the count.
    fn deliver(&mut self) -> usize {
        forward(&mut self.client.outbound, &self.server) + forward(&mut self.server.outbound, &self.client)
    }
}

fn forward(outbound: &mut mpsc::Receiver<Message>, to: &Endpoint) -> usize {
    let mut count = 0;
    while let Ok(message) = outbound.try_recv() {
        let _ = to.events.send(TransportEvent::Message { id: to.id, message });
        count += 1;
    }
    count
}

impl MemoryNetwork {
    /// Creates a network whose server side reports into `server_events`.
    pub fn new(server_events: EventSender) -> Self {
        Self {
            inner: Arc::new(Mutex::new(NetworkInner {
                server_events,
                bridges: Vec::new(),
                refusing: false,
            })),
        }
    }

    /// Returns a connector that presents `identity` when connecting.
    pub fn connector(&self, identity: impl Into<String>) -> MemoryConnector {
        MemoryConnector {
            network: self.clone(),
            identity: identity.into(),
        }
    }

    /// Makes new connection attempts fail (simulates an unreachable server).
    pub fn set_refusing(&self, refusing: bool) {
        self.lock().refusing = refusing;
    }

    /// Delivers all queued messages and propagates closed links.
    ///
    /// A link closed by either side drops whatever it still had queued,
    /// like an abrupt socket loss. Returns the number of messages moved.
    pub fn pump(&self) -> usize {
        let mut inner = self.lock();
        let mut moved = 0;
        for bridge in &mut inner.bridges {
            if bridge.is_open() {
                moved += bridge.deliver();
            } else {
                bridge.close();
            }
        }
        inner.bridges.retain(|b| b.is_open());
        moved
    }

    /// Drops every open connection.
    pub fn disconnect_all(&self) {
        let mut inner = self.lock();
        for bridge in &mut inner.bridges {
            bridge.close();
        }
        inner.bridges.clear();
    }

    /// Number of currently open connections.
    pub fn open_connections(&self) -> usize {
        self.lock().bridges.iter().filter(|b| b.is_open()).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NetworkInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Connector for a [`MemoryNetwork`].
pub struct MemoryConnector {
    network: MemoryNetwork,
    identity: String,
}

impl Connector for MemoryConnector {
    fn connect(&mut self, events: &EventSender) -> Result<(), TransportError> {
        let mut inner = self.network.lock();
        if inner.refusing {
            let _ = events.send(TransportEvent::ConnectFailed {
                reason: "connection refused".into(),
            });
            return Ok(());
        }

        let (client_link, client) = endpoint("memory:server", events.clone());
        let (server_link, server) = endpoint("memory:client", inner.server_events.clone());
        debug!(client = %client.id, server = %server.id, "memory link opened");

        let _ = server.events.send(TransportEvent::Connected {
            link: server_link,
            identity: self.identity.clone(),
        });
        let _ = client.events.send(TransportEvent::Connected {
            link: client_link,
            identity: self.identity.clone(),
        });
        inner.bridges.push(Bridge { client, server });
        Ok(())
    }
}

fn endpoint(label: &str, events: EventSender) -> (Link, Endpoint) {
    let id = ConnectionId::next();
    let (tx, outbound) = mpsc::channel(LINK_QUEUE_CAPACITY);
    let cancel = CancellationToken::new();
    let link = Link::new(id, label, tx, cancel.clone());
    (
        link,
        Endpoint {
            id,
            cancel,
            outbound,
            events,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{self, EventReceiver};
    use assetcache_protocol::MessageType;

    fn expect_connected(rx: &mut EventReceiver) -> Link {
        match rx.try_recv().unwrap() {
            TransportEvent::Connected { link, .. } => link,
            other => panic!("expected Connected, got {other:?}"),
        }
    }

    #[test]
    fn messages_wait_for_pump() {
        let (server_tx, mut server_rx) = event::channel();
        let (client_tx, mut client_rx) = event::channel();
        let network = MemoryNetwork::new(server_tx);

        network.connector("id").connect(&client_tx).unwrap();
        let server_link = expect_connected(&mut server_rx);
        let client_link = expect_connected(&mut client_rx);

        client_link
            .send(Message::with_name(MessageType::RequestUpload, "f.[h].bin"))
            .unwrap();
        assert_eq!(client_link.outbound_pending(), 1);
        assert!(server_rx.try_recv().is_err());

        assert_eq!(network.pump(), 1);
        assert_eq!(client_link.outbound_pending(), 0);
        match server_rx.try_recv().unwrap() {
            TransportEvent::Message { id, message } => {
                assert_eq!(id, server_link.id());
                assert_eq!(message.name().unwrap(), "f.[h].bin");
            }
            other => panic!("expected Message, got {other:?}"),
        }
    }

    #[test]
    fn refusing_reports_connect_failure() {
        let (server_tx, mut server_rx) = event::channel();
        let (client_tx, mut client_rx) = event::channel();
        let network = MemoryNetwork::new(server_tx);
        network.set_refusing(true);

        network.connector("id").connect(&client_tx).unwrap();
        assert!(matches!(
            client_rx.try_recv().unwrap(),
            TransportEvent::ConnectFailed { .. }
        ));
        assert!(server_rx.try_recv().is_err());
        assert_eq!(network.open_connections(), 0);
    }

    #[test]
    fn close_propagates_on_pump() {
        let (server_tx, mut server_rx) = event::channel();
        let (client_tx, mut client_rx) = event::channel();
        let network = MemoryNetwork::new(server_tx);

        network.connector("id").connect(&client_tx).unwrap();
        let server_link = expect_connected(&mut server_rx);
        let client_link = expect_connected(&mut client_rx);

        server_link.close();
        network.pump();

        assert!(!client_link.is_connected());
        assert!(matches!(
            client_rx.try_recv().unwrap(),
            TransportEvent::Disconnected { id } if id == client_link.id()
        ));
        assert!(matches!(
            server_rx.try_recv().unwrap(),
            TransportEvent::Disconnected { id } if id == server_link.id()
        ));
        assert_eq!(network.open_connections(), 0);
    }

    #[test]
    fn disconnect_all_drops_queued_messages() {
        let (server_tx, mut server_rx) = event::channel();
        let (client_tx, mut client_rx) = event::channel();
        let network = MemoryNetwork::new(server_tx);

        network.connector("id").connect(&client_tx).unwrap();
        let _server_link = expect_connected(&mut server_rx);
        let client_link = expect_connected(&mut client_rx);

        client_link
            .send(Message::empty(MessageType::UploadFailedError))
            .unwrap();
        network.disconnect_all();

        assert!(matches!(
            server_rx.try_recv().unwrap(),
            TransportEvent::Disconnected { .. }
        ));
        assert!(server_rx.try_recv().is_err());
        assert!(!client_link.is_connected());
    }
}
