//! Message transport for the asset cache.
//!
//! A connection is represented by a cloneable [`Link`] for sending and a
//! stream of [`TransportEvent`]s for everything inbound. Two backends are
//! provided: [`tcp`] for real deployments and [`memory`] for in-process
//! wiring where the caller pumps delivery explicitly.
//!
//! # Wire format
//!
//! See [`wire`] for the TCP framing.

pub mod event;
pub mod identity;
pub mod link;
pub mod memory;
pub mod tcp;
pub mod wire;

pub use event::{ConnectionId, EventReceiver, EventSender, TransportEvent};
pub use identity::validate_identity;
pub use link::{Link, SendError};
pub use memory::{MemoryConnector, MemoryNetwork};
pub use tcp::{TcpConnector, TcpListenerTransport};

use std::time::Duration;

/// Capacity of each link's outbound queue.
///
/// Must stay above the sender's pacing budget so a full batch never
/// overflows into `try_send` failures.
pub const LINK_QUEUE_CAPACITY: usize = 1024;

/// Largest payload accepted in a single frame (8 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 8 * 1024 * 1024;

/// TCP read/write buffer size (256 KB).
pub const TCP_BUFFER_SIZE: usize = 256 * 1024;

/// Timeout for the outbound TCP connection attempt.
pub const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for the identity handshake on accepted connections.
pub const TCP_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors produced by the transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connection timed out")]
    Timeout,

    #[error("connection refused: {0}")]
    Refused(String),
}

impl From<assetcache_protocol::ProtocolError> for TransportError {
    fn from(e: assetcache_protocol::ProtocolError) -> Self {
        Self::Protocol(e.to_string())
    }
}

/// Starts outbound connections on behalf of a client.
///
/// `connect` only initiates the attempt; its outcome is delivered through
/// `events` as [`TransportEvent::Connected`] or
/// [`TransportEvent::ConnectFailed`]. An `Err` means the attempt could not
/// even be started.
pub trait Connector: Send {
    fn connect(&mut self, events: &EventSender) -> Result<(), TransportError>;
}
