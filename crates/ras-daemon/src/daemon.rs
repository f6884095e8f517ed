//! Daemon assembly
//!
//! Binds the listeners, builds the shared state and runs every service
//! until cancelled.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use ras_core::config::DaemonConfig;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::pairing::PairingRecord;
use crate::publisher::IpChangePublisher;
use crate::relay_listener::RelayListener;
use crate::signaling;
use crate::state::DaemonState;
use crate::transport::TransportListener;

/// A daemon with its sockets bound, ready to run
pub struct Daemon {
    state: Arc<DaemonState>,
    signaling: TcpListener,
    transport: TcpListener,
}

impl Daemon {
    /// Bind the signaling and transport listeners
    pub async fn bind(config: DaemonConfig, record: PairingRecord) -> Result<Self> {
        let transport = TcpListener::bind(config.transport_bind)
            .await
            .with_context(|| format!("Failed to bind transport to {}", config.transport_bind))?;
        let signaling = TcpListener::bind(config.signaling_bind)
            .await
            .with_context(|| format!("Failed to bind signaling to {}", config.signaling_bind))?;

        let transport_port = transport.local_addr()?.port();
        let state = DaemonState::new(config, record, transport_port)
            .context("Failed to set up daemon state")?;

        Ok(Self {
            state: Arc::new(state),
            signaling,
            transport,
        })
    }

    pub fn state(&self) -> &Arc<DaemonState> {
        &self.state
    }

    pub fn signaling_addr(&self) -> Result<SocketAddr> {
        Ok(self.signaling.local_addr()?)
    }

    pub fn transport_addr(&self) -> Result<SocketAddr> {
        Ok(self.transport.local_addr()?)
    }

    /// Run until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let Self {
            state,
            signaling,
            transport,
        } = self;

        let publisher = IpChangePublisher::new(&state);
        let publisher_task = tokio::spawn(publisher.run(cancel.child_token()));

        let relay = RelayListener::new(Arc::clone(&state), cancel.child_token());
        let relay_task = tokio::spawn(async move { relay.run().await });

        let transport_task = tokio::spawn(
            TransportListener::new(transport, Arc::clone(&state), cancel.child_token()).run(),
        );

        let result = signaling::serve(signaling, Arc::clone(&state), cancel.clone()).await;

        cancel.cancel();
        let _ = tokio::join!(publisher_task, relay_task, transport_task);
        result
    }
}
