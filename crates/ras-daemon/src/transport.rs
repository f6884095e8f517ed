//! TCP transport listener
//!
//! Clients that reached the daemon through LAN or overlay signaling connect
//! here and run the handshake on the framed stream.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use ras_core::link::StreamLink;
use ras_core::PathType;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::connection::serve_link;
use crate::state::DaemonState;

/// Accepts transport connections and serves each on its own task
pub struct TransportListener {
    listener: TcpListener,
    state: Arc<DaemonState>,
    cancel: CancellationToken,
}

impl TransportListener {
    pub fn new(listener: TcpListener, state: Arc<DaemonState>, cancel: CancellationToken) -> Self {
        Self {
            listener,
            state,
            cancel,
        }
    }

    /// Run the accept loop until cancelled
    pub async fn run(self) -> Result<()> {
        tracing::info!("Transport listening on {}", self.listener.local_addr()?);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("Transport listener shutting down");
                    break;
                }

                result = self.listener.accept() => {
                    match result {
                        Ok((socket, peer_addr)) => self.handle_connection(socket, peer_addr),
                        Err(e) => tracing::error!("Failed to accept connection: {}", e),
                    }
                }
            }
        }

        Ok(())
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        tracing::debug!("Transport connection from {}", peer_addr);

        // Overlay peers dial the same listener; tell them apart by address
        let path_type = if ras_core::overlay::is_overlay_ip(&peer_addr.ip()) {
            PathType::OverlayDirect
        } else {
            PathType::LanDirect
        };

        let state = Arc::clone(&self.state);
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            serve_link(Box::new(StreamLink::tcp(socket)), path_type, state, cancel).await;
        });
    }
}
