//! Shared daemon state

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use ras_core::config::DaemonConfig;
use ras_core::relay::RelayClient;
use ras_core::{ConnectionError, PathType, SessionKeys};
use tokio::sync::broadcast;

use crate::pairing::PairingRecord;

const EVENT_CAPACITY: usize = 256;

/// Something that happened on an authenticated client link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonEvent {
    /// A client finished the handshake
    ClientConnected {
        path_type: PathType,
        peer: Option<SocketAddr>,
    },
    /// Application data from a client
    Data(Bytes),
    /// A client link ended
    ClientDisconnected { path_type: PathType },
}

/// State shared by the listeners
pub struct DaemonState {
    pub config: DaemonConfig,
    pub record: PairingRecord,
    pub keys: Arc<SessionKeys>,
    /// Port the TCP transport listener is bound to
    pub transport_port: u16,
    pub relay: RelayClient,
    events: broadcast::Sender<DaemonEvent>,
}

impl DaemonState {
    pub fn new(
        config: DaemonConfig,
        record: PairingRecord,
        transport_port: u16,
    ) -> Result<Self, ConnectionError> {
        let keys = SessionKeys::derive(record.payload().secret())?;
        let relay = RelayClient::new(config.relay_server.clone())?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            config,
            record,
            keys: Arc::new(keys),
            transport_port,
            relay,
            events,
        })
    }

    pub fn session_id(&self) -> &str {
        self.record.session_id()
    }

    pub fn relay_topic(&self) -> &str {
        self.record.payload().relay_topic()
    }

    /// Subscribe to client events
    pub fn subscribe(&self) -> broadcast::Receiver<DaemonEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: DaemonEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}
