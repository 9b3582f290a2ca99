use std::fmt;

use assetcache_protocol::Message;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::event::ConnectionId;

/// Handle for sending messages on one connection.
///
/// Cloneable and cheap: wraps a bounded `mpsc::Sender` drained by the
/// backend, plus the connection's cancellation token.
#[derive(Clone)]
pub struct Link {
    id: ConnectionId,
    peer_addr: String,
    tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
}

/// Error returned when the outbound queue is full or the link is closed.
#[derive(Debug, thiserror::Error)]
#[error("send failed: queue full or connection closed")]
pub struct SendError;

impl Link {
    pub(crate) fn new(
        id: ConnectionId,
        peer_addr: impl Into<String>,
        tx: mpsc::Sender<Message>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            peer_addr: peer_addr.into(),
            tx,
            cancel,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote address (or a descriptive label for in-memory links).
    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    /// Queues a message without blocking.
    pub fn send(&self, msg: Message) -> Result<(), SendError> {
        if self.cancel.is_cancelled() {
            return Err(SendError);
        }
        self.tx.try_send(msg).map_err(|_| {
            tracing::warn!(conn = %self.id, "send buffer full or closed, dropping message");
            SendError
        })
    }

    /// Returns `true` while the connection is open.
    pub fn is_connected(&self) -> bool {
        !self.cancel.is_cancelled() && !self.tx.is_closed()
    }

    /// Number of messages queued but not yet handed to the wire.
    pub fn outbound_pending(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Closes the connection. Queued messages may be dropped.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("connected", &self.is_connected())
            .finish()
    }
}
