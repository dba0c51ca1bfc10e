//! TCP stream source: every accepted socket becomes one connection keyed by the remote IP.

use std::net::SocketAddr;

use devlink_core::PeerAddress;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::connection::{spawn_connection, Link};

/// Bind `listen_addr` and serve until the listener fails.
pub async fn run_listener(listen_addr: SocketAddr, link: Link) -> std::io::Result<()> {
    let listener = TcpListener::bind(listen_addr).await?;
    info!(addr = %listener.local_addr()?, "listening for device streams");
    serve(listener, link).await
}

pub async fn serve(listener: TcpListener, link: Link) -> std::io::Result<()> {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            warn!(%remote, error = %e, "could not disable Nagle");
        }
        let address = PeerAddress::new(remote.ip().to_string());
        // Detached: the connection logs its own exit.
        let _ = spawn_connection(stream, address, link.clone());
    }
}
