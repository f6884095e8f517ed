//! Relay signaling listener
//!
//! Watches the pairing's upstream topic for sealed envelopes. NAT offers
//! are answered and hole-punched; relayed links are accepted and their
//! frames routed to the matching [`RelayLink`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use ras_core::link::DatagramLink;
use ras_core::punch::punch;
use ras_core::relay::seal::{open_envelope, seal_envelope};
use ras_core::relay::{EventKind, RelayEvent, RelayFrame, RelayLink};
use ras_core::stun::discover_reflexive;
use ras_core::{ConnectionError, PathType};
use ras_protocol::signaling::{downstream_topic, upstream_topic};
use ras_protocol::SignalEnvelope;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::serve_link;
use crate::state::DaemonState;

const INITIAL_RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);
const MAX_RESUBSCRIBE_DELAY: Duration = Duration::from_secs(60);
const STUN_TIMEOUT: Duration = Duration::from_secs(2);
const LINK_CAPACITY: usize = 64;

/// Handles everything clients send through the relay
pub struct RelayListener {
    state: Arc<DaemonState>,
    cancel: CancellationToken,
    links: Arc<DashMap<String, mpsc::Sender<RelayFrame>>>,
}

impl RelayListener {
    pub fn new(state: Arc<DaemonState>, cancel: CancellationToken) -> Self {
        Self {
            state,
            cancel,
            links: Arc::new(DashMap::new()),
        }
    }

    /// Number of open relayed links
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Subscribe and dispatch until cancelled, resubscribing on failure
    pub async fn run(&self) {
        let topic = upstream_topic(self.state.relay_topic());
        let mut delay = INITIAL_RESUBSCRIBE_DELAY;

        while !self.cancel.is_cancelled() {
            match self.state.relay.subscribe(&topic).await {
                Ok(mut subscription) => {
                    delay = INITIAL_RESUBSCRIBE_DELAY;
                    info!("Listening for relay signaling");
                    loop {
                        let next = tokio::select! {
                            _ = self.cancel.cancelled() => return,
                            next = subscription.next_event() => next,
                        };
                        match next {
                            Ok(Some(event)) => self.handle_event(&event),
                            Ok(None) => {
                                debug!("Relay ended the subscription");
                                break;
                            }
                            Err(e) => {
                                warn!("Relay subscription failed: {}", e);
                                break;
                            }
                        }
                    }
                }
                Err(e) => warn!("Could not subscribe to relay: {}", e),
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(MAX_RESUBSCRIBE_DELAY);
        }
    }

    fn handle_event(&self, event: &RelayEvent) {
        if event.kind() != EventKind::Message {
            return;
        }
        let Some(text) = event.message.as_deref() else {
            return;
        };
        match open_envelope(&self.state.keys.signaling, text) {
            Ok(envelope) => self.handle_envelope(envelope),
            Err(e) => debug!("Dropping relay message: {}", e),
        }
    }

    /// Act on one opened envelope
    pub fn handle_envelope(&self, envelope: SignalEnvelope) {
        match envelope {
            SignalEnvelope::NatOffer {
                offer_id,
                session_id,
                reflexive,
            } => {
                if session_id != self.state.session_id() {
                    debug!("NAT offer for another session");
                    return;
                }
                let state = Arc::clone(&self.state);
                let cancel = self.cancel.child_token();
                tokio::spawn(async move {
                    if let Err(e) = answer_nat_offer(state, offer_id, reflexive, cancel).await {
                        warn!("NAT traversal failed: {}", e);
                    }
                });
            }
            SignalEnvelope::RelayOpen {
                link_id,
                session_id,
            } => {
                if session_id != self.state.session_id() {
                    debug!("Relay open for another session");
                    return;
                }
                if self.links.contains_key(&link_id) {
                    return;
                }
                let (tx, rx) = mpsc::channel(LINK_CAPACITY);
                self.links.insert(link_id.clone(), tx);

                let state = Arc::clone(&self.state);
                let links = Arc::clone(&self.links);
                let cancel = self.cancel.child_token();
                tokio::spawn(async move {
                    if let Err(e) = accept_relay_link(&state, &link_id, rx, cancel).await {
                        warn!("Relayed link {} failed: {}", link_id, e);
                    }
                    links.remove(&link_id);
                });
            }
            SignalEnvelope::RelayData {
                link_id,
                seq,
                sealed,
            } => {
                let Some(tx) = self.links.get(&link_id).map(|tx| tx.clone()) else {
                    debug!("Frame for unknown relayed link {}", link_id);
                    return;
                };
                if tx.try_send(RelayFrame { seq, sealed }).is_err() {
                    warn!("Relayed link {} is not keeping up, dropping frame", link_id);
                }
            }
            SignalEnvelope::RelayClose { link_id } => {
                // Dropping the sender ends the link's inbound stream
                if self.links.remove(&link_id).is_some() {
                    debug!("Client closed relayed link {}", link_id);
                }
            }
            SignalEnvelope::NatAnswer { .. } | SignalEnvelope::RelayAccept { .. } => {}
        }
    }
}

async fn answer_nat_offer(
    state: Arc<DaemonState>,
    offer_id: String,
    client: SocketAddr,
    cancel: CancellationToken,
) -> Result<(), ConnectionError> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    let reflexive = discover_reflexive(&socket, &state.config.stun_servers, STUN_TIMEOUT).await?;
    debug!("Answering NAT offer {} from {}", offer_id, reflexive);

    let answer = SignalEnvelope::NatAnswer {
        offer_id: offer_id.clone(),
        reflexive,
    };
    state
        .relay
        .publish(
            &downstream_topic(state.relay_topic()),
            seal_envelope(&state.keys.signaling, &answer)?,
        )
        .await?;

    let limit = state.config.handshake_timeout;
    let confirmed = tokio::time::timeout(
        limit,
        punch(&socket, client, &offer_id, &state.keys.signaling),
    )
    .await
    .map_err(|_| ConnectionError::Timeout(limit))??;

    serve_link(
        Box::new(DatagramLink::new(socket, confirmed)),
        PathType::NatTraversalDirect,
        state,
        cancel,
    )
    .await;
    Ok(())
}

async fn accept_relay_link(
    state: &Arc<DaemonState>,
    link_id: &str,
    inbound: mpsc::Receiver<RelayFrame>,
    cancel: CancellationToken,
) -> Result<(), ConnectionError> {
    let outbound = downstream_topic(state.relay_topic());
    let accept = SignalEnvelope::RelayAccept {
        link_id: link_id.to_string(),
    };
    state
        .relay
        .publish(&outbound, seal_envelope(&state.keys.signaling, &accept)?)
        .await?;
    info!("Accepted relayed link {}", link_id);

    let link = RelayLink::new(
        state.relay.clone(),
        outbound,
        link_id,
        &state.keys,
        inbound,
    );
    serve_link(Box::new(link), PathType::Relayed, Arc::clone(state), cancel).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pairing::PairingRecord;
    use ras_core::config::DaemonConfig;

    fn listener() -> RelayListener {
        let record =
            PairingRecord::generate("127.0.0.1:8821".parse().unwrap(), None, None).unwrap();
        let config = DaemonConfig {
            relay_server: "http://127.0.0.1:9".to_string(),
            ..DaemonConfig::default()
        };
        let state = Arc::new(DaemonState::new(config, record, 8822).unwrap());
        RelayListener::new(state, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_open_for_other_session_is_ignored() {
        let listener = listener();
        listener.handle_envelope(SignalEnvelope::RelayOpen {
            link_id: "l1".to_string(),
            session_id: "someone-else".to_string(),
        });
        assert_eq!(listener.link_count(), 0);
    }

    #[tokio::test]
    async fn test_frames_routed_by_link_id() {
        let listener = listener();
        let (tx, mut rx) = mpsc::channel(4);
        listener.links.insert("l1".to_string(), tx);

        listener.handle_envelope(SignalEnvelope::RelayData {
            link_id: "l1".to_string(),
            seq: 3,
            sealed: "abc".to_string(),
        });
        listener.handle_envelope(SignalEnvelope::RelayData {
            link_id: "other".to_string(),
            seq: 0,
            sealed: "zzz".to_string(),
        });

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.seq, 3);
        assert_eq!(frame.sealed, "abc");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_ends_inbound_stream() {
        let listener = listener();
        let (tx, mut rx) = mpsc::channel(4);
        listener.links.insert("l1".to_string(), tx);

        listener.handle_envelope(SignalEnvelope::RelayClose {
            link_id: "l1".to_string(),
        });

        assert_eq!(listener.link_count(), 0);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_undecodable_event_is_dropped() {
        let listener = listener();
        listener.handle_event(&RelayEvent::message("topic-up", "not sealed"));
        listener.handle_event(&RelayEvent {
            id: "k".to_string(),
            time: 0,
            event: "keepalive".to_string(),
            topic: "topic-up".to_string(),
            message: None,
        });
        assert_eq!(listener.link_count(), 0);
    }
}
