use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use assetcache_protocol::Message;
use tokio::sync::mpsc;

use crate::link::Link;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocates a fresh identifier.
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Everything a transport reports back to its owner.
///
/// For a given connection, `Connected` is always delivered before any of
/// its `Message` events, and `Disconnected` after the last one.
#[derive(Debug)]
pub enum TransportEvent {
    /// A connection finished its handshake. `identity` is the string the
    /// client presented.
    Connected { link: Link, identity: String },
    /// An outbound connection attempt failed.
    ConnectFailed { reason: String },
    /// A connection was closed by either side.
    Disconnected { id: ConnectionId },
    /// A message arrived on a connection.
    Message { id: ConnectionId, message: Message },
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Creates an event channel.
pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
