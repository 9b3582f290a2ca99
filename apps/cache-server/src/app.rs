//! Wires the TCP listener to the cache server loop.

use std::net::{Ipv4Addr, SocketAddr};

use assetcache_server::{CacheServer, ServerConfig};
use assetcache_transport::{TcpListenerTransport, event};
use tokio_util::sync::CancellationToken;

/// Runs the server until Ctrl-C or until the listener stops.
pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let (events_tx, events_rx) = event::channel();

    let server = CacheServer::new(config.clone(), events_rx)?;

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
    let listener = TcpListenerTransport::bind(addr, events_tx, cancel.clone()).await?;
    let bound = listener.local_addr()?;

    let listener_cancel = cancel.clone();
    let listener_task = tokio::spawn(async move {
        if let Err(e) = listener.run().await {
            tracing::error!("listener error: {e}");
        }
        listener_cancel.cancel();
    });

    let server_task = tokio::spawn(server.run(cancel.clone()));
    tracing::info!(%bound, "cache server ready");

    tokio::select! {
        _ = cancel.cancelled() => {
            tracing::info!("listener stopped");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received, shutting down");
        }
    }

    cancel.cancel();
    listener_task.await?;
    server_task.await??;
    Ok(())
}
