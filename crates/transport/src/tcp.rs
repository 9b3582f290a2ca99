//! TCP backend.
//!
//! Each connection runs a read pump and a write pump as background tasks.
//! The read pump forwards framed messages as [`TransportEvent::Message`];
//! the write pump drains the [`Link`]'s outbound queue onto the socket.

use std::net::SocketAddr;

use assetcache_protocol::Message;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::event::{ConnectionId, EventSender, TransportEvent};
use crate::link::Link;
use crate::wire::{read_identity, read_message, write_identity, write_message};
use crate::{
    Connector, LINK_QUEUE_CAPACITY, TCP_BUFFER_SIZE, TCP_CONNECT_TIMEOUT, TCP_HANDSHAKE_TIMEOUT,
    TransportError,
};

// ---------------------------------------------------------------------------
// Listener (server side)
// ---------------------------------------------------------------------------

/// Accepts client connections and reports them as transport events.
pub struct TcpListenerTransport {
    listener: TcpListener,
    events: EventSender,
    cancel: CancellationToken,
}

impl TcpListenerTransport {
    /// Binds the listening socket.
    pub async fn bind(
        addr: SocketAddr,
        events: EventSender,
        cancel: CancellationToken,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "cache transport listening");
        Ok(Self {
            listener,
            events,
            cancel,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    /// Runs the accept loop until cancellation.
    pub async fn run(self) -> Result<(), TransportError> {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("listener shutting down");
                    break Ok(());
                }

                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let events = self.events.clone();
                            let cancel = self.cancel.clone();
                            tokio::spawn(async move {
                                if let Err(e) = accept_connection(stream, peer_addr, events, cancel).await {
                                    warn!(%peer_addr, "handshake failed: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {e}");
                        }
                    }
                }
            }
        }
    }
}

/// Reads the client's identity and starts the connection pumps.
///
/// Identity validation is left to the event consumer.
async fn accept_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    events: EventSender,
    cancel: CancellationToken,
) -> Result<(), TransportError> {
    stream.set_nodelay(true)?;
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::with_capacity(TCP_BUFFER_SIZE, reader);

    let identity = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(()),
        result = tokio::time::timeout(TCP_HANDSHAKE_TIMEOUT, read_identity(&mut reader)) => {
            match result {
                Ok(Ok(identity)) => identity,
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(TransportError::Timeout),
            }
        }
    };

    debug!(%peer_addr, %identity, "handshake received");
    spawn_link(reader, writer, peer_addr.to_string(), identity, events, &cancel);
    Ok(())
}

// ---------------------------------------------------------------------------
// Connector (client side)
// ---------------------------------------------------------------------------

/// Opens outbound TCP connections to a cache server.
///
/// Connection attempts run on the given runtime, so [`Connector::connect`]
/// can be called from synchronous code.
pub struct TcpConnector {
    addr: String,
    identity: String,
    runtime: Handle,
    cancel: CancellationToken,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>, identity: impl Into<String>, runtime: Handle) -> Self {
        Self {
            addr: addr.into(),
            identity: identity.into(),
            runtime,
            cancel: CancellationToken::new(),
        }
    }

    /// Closes every connection opened by this connector.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for TcpConnector {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Connector for TcpConnector {
    fn connect(&mut self, events: &EventSender) -> Result<(), TransportError> {
        let addr = self.addr.clone();
        let identity = self.identity.clone();
        let events = events.clone();
        let cancel = self.cancel.clone();

        self.runtime.spawn(async move {
            if let Err(e) = open_connection(&addr, identity, events.clone(), cancel).await {
                warn!(%addr, "connection attempt failed: {e}");
                let _ = events.send(TransportEvent::ConnectFailed {
                    reason: e.to_string(),
                });
            }
        });
        Ok(())
    }
}

async fn open_connection(
    addr: &str,
    identity: String,
    events: EventSender,
    cancel: CancellationToken,
) -> Result<(), TransportError> {
    let stream = match tokio::time::timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => return Err(TransportError::Timeout),
    };
    stream.set_nodelay(true)?;
    let peer_addr = stream.peer_addr()?;

    let (reader, mut writer) = stream.into_split();
    write_identity(&mut writer, &identity).await?;
    info!(%peer_addr, "connected to cache server");

    let reader = BufReader::with_capacity(TCP_BUFFER_SIZE, reader);
    spawn_link(reader, writer, peer_addr.to_string(), identity, events, &cancel);
    Ok(())
}

// ---------------------------------------------------------------------------
// Pumps
// ---------------------------------------------------------------------------

/// Creates the [`Link`], reports it, and starts both pumps.
fn spawn_link(
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    peer_addr: String,
    identity: String,
    events: EventSender,
    parent: &CancellationToken,
) {
    let id = ConnectionId::next();
    let (tx, rx) = mpsc::channel::<Message>(LINK_QUEUE_CAPACITY);
    let cancel = parent.child_token();
    let link = Link::new(id, peer_addr, tx, cancel.clone());

    // Connected must be queued before the read pump can emit messages.
    if events
        .send(TransportEvent::Connected { link, identity })
        .is_err()
    {
        cancel.cancel();
        return;
    }

    let writer = BufWriter::with_capacity(TCP_BUFFER_SIZE, writer);
    tokio::spawn(write_pump(writer, rx, cancel.clone()));

    tokio::spawn(async move {
        read_pump(reader, id, &events, &cancel).await;
        // When the read pump exits, stop the write pump too.
        cancel.cancel();
        let _ = events.send(TransportEvent::Disconnected { id });
        debug!(conn = %id, "connection closed");
    });
}

/// Write pump: drains the outbound queue onto the socket.
async fn write_pump(
    mut writer: BufWriter<OwnedWriteHalf>,
    mut rx: mpsc::Receiver<Message>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            msg = rx.recv() => {
                let Some(msg) = msg else { break };
                if let Err(e) = write_message(&mut writer, &msg).await {
                    warn!("write pump error: {e}");
                    break;
                }
                // Coalesce bursts; flush once the queue is drained.
                if rx.is_empty() {
                    if let Err(e) = writer.flush().await {
                        warn!("write pump flush error: {e}");
                        break;
                    }
                }
            }
        }
    }

    cancel.cancel();
    let _ = writer.shutdown().await;
}

/// Read pump: reads frames and forwards them as events.
async fn read_pump(
    mut reader: BufReader<OwnedReadHalf>,
    id: ConnectionId,
    events: &EventSender,
    cancel: &CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            result = read_message(&mut reader) => {
                match result {
                    Ok(message) => {
                        if events.send(TransportEvent::Message { id, message }).is_err() {
                            break;
                        }
                    }
                    Err(TransportError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                        debug!(conn = %id, "peer closed connection");
                        break;
                    }
                    Err(e) => {
                        warn!(conn = %id, "read pump error: {e}");
                        break;
                    }
                }
            }
        }
    }
}
