//! Client runtime
//!
//! Wires the pieces together for a long-running client: pair once, then
//! follow the daemon around as it changes address, keep the link alive, and
//! tear everything down on a user disconnect.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use ras_core::config::ClientConfig;
use ras_core::{ConnectionPath, NonceCache, PairingState};
use ras_protocol::Message;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::ExponentialBackoff;
use crate::notify::NotificationChannel;
use crate::pairing::PairingStateMachine;
use crate::reconnect::{ReconnectController, ReconnectEvent, Reconnector};
use crate::state::ConnectionSlot;

/// Reconnects through the pairing state machine and installs the result
pub struct PairingReconnector {
    machine: Arc<PairingStateMachine>,
    slot: Arc<ConnectionSlot>,
}

impl PairingReconnector {
    pub fn new(machine: Arc<PairingStateMachine>, slot: Arc<ConnectionSlot>) -> Self {
        Self { machine, slot }
    }
}

#[async_trait]
impl Reconnector for PairingReconnector {
    async fn reconnect(&self, ip: IpAddr, port: u16) -> Result<bool> {
        match self.machine.reconnect_to(SocketAddr::new(ip, port)).await {
            Ok(channel) => {
                self.slot.replace(channel).await;
                Ok(true)
            }
            Err(e) => {
                warn!("Reconnection to {}:{} failed: {}", ip, port, e);
                Ok(false)
            }
        }
    }
}

/// A paired client following its daemon
pub struct ClientRuntime {
    machine: Arc<PairingStateMachine>,
    slot: Arc<ConnectionSlot>,
    controller: Arc<ReconnectController>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ClientRuntime {
    /// Pair with the daemon described by `qr_text` and start following it
    pub async fn start(config: &ClientConfig, qr_text: &str) -> Result<Self> {
        let machine = Arc::new(
            PairingStateMachine::from_config(config).context("Failed to set up relay client")?,
        );
        let relay = ras_core::relay::RelayClient::new(config.relay_server.clone())?;

        let channel = machine.pair(qr_text).await.context("Pairing failed")?;
        info!("Paired over {}", channel.path);

        let notifications = NotificationChannel::new(relay, &channel.payload, &channel.keys)
            .with_cache(Arc::new(NonceCache::new(config.nonce_cache_capacity)))
            .with_tolerance(config.timestamp_tolerance_secs);

        let slot = Arc::new(ConnectionSlot::new());
        slot.replace(channel).await;

        let reconnector = Arc::new(PairingReconnector::new(machine.clone(), slot.clone()));
        let controller = Arc::new(ReconnectController::spawn(reconnector, &config.backoff));

        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        let (tx, mut rx) = mpsc::channel(16);
        let backoff = ExponentialBackoff::from_config(&config.backoff);
        let listen_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            notifications.run(tx, listen_cancel, backoff).await;
        }));

        let feed_controller = controller.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(notification) = rx.recv().await {
                feed_controller.submit(&notification);
            }
        }));

        tasks.push(tokio::spawn(keepalive(
            machine.clone(),
            slot.clone(),
            controller.clone(),
            config.keepalive_interval,
            cancel.clone(),
        )));

        Ok(Self {
            machine,
            slot,
            controller,
            cancel,
            tasks,
        })
    }

    /// Pairing progress
    pub fn pairing_state(&self) -> watch::Receiver<PairingState> {
        self.machine.subscribe()
    }

    /// Active path
    pub fn path(&self) -> watch::Receiver<Option<ConnectionPath>> {
        self.slot.subscribe()
    }

    /// Reconnection outcomes
    pub fn reconnect_events(&self) -> tokio::sync::broadcast::Receiver<ReconnectEvent> {
        self.controller.subscribe()
    }

    /// User-initiated disconnect
    pub async fn disconnect(self) {
        let slot = self.slot.clone();
        let cancel = self.cancel.clone();
        self.controller
            .request_disconnect(|| async move {
                cancel.cancel();
                slot.clear().await;
            })
            .await;

        for task in self.tasks {
            let _ = task.await;
        }
        info!("Disconnected");
    }
}

async fn keepalive(
    machine: Arc<PairingStateMachine>,
    slot: Arc<ConnectionSlot>,
    controller: Arc<ReconnectController>,
    interval: std::time::Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let sent = ras_core::time::current_time_millis();
        let reply =
            tokio::time::timeout(interval, slot.request(Message::Ping { timestamp: sent })).await;

        match reply {
            Ok(Ok(Some(Message::Pong { timestamp }))) if timestamp == sent => {
                debug!(
                    "Keepalive ok ({} ms)",
                    ras_core::time::elapsed_millis(sent)
                );
            }
            other => {
                if cancel.is_cancelled() {
                    return;
                }
                debug!("Keepalive failed: {:?}", other.map(|r| r.map(|m| m.is_some())));
                if let Some(payload) = machine.payload() {
                    controller.on_transport_error(payload.rendezvous());
                }
            }
        }
    }
}
