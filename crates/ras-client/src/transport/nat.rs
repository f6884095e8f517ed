//! NAT traversal path
//!
//! Learn our reflexive address from STUN, trade it for the daemon's through
//! the relay's signaling topics, then punch a UDP hole.

use std::time::Duration;

use async_trait::async_trait;
use ras_core::link::DatagramLink;
use ras_core::punch::punch;
use ras_core::relay::seal::seal_envelope;
use ras_core::stun::discover_reflexive;
use ras_core::{BoxedLink, PathType};
use ras_protocol::signaling::{downstream_topic, upstream_topic};
use ras_protocol::SignalEnvelope;
use tokio::net::UdpSocket;
use tracing::debug;

use super::{wait_for_envelope, CandidateError, PathCandidate, TransportContext};

/// Per-server STUN timeout
const STUN_TIMEOUT: Duration = Duration::from_secs(2);

/// STUN + relay signaling + hole punching
#[derive(Debug, Clone, Copy, Default)]
pub struct NatCandidate;

impl NatCandidate {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PathCandidate for NatCandidate {
    fn path_type(&self) -> PathType {
        PathType::NatTraversalDirect
    }

    fn is_applicable(&self, ctx: &TransportContext) -> bool {
        !ctx.stun_servers.is_empty()
    }

    async fn attempt(&self, ctx: &TransportContext) -> Result<BoxedLink, CandidateError> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| CandidateError::Unreachable(format!("bind UDP socket: {}", e)))?;
        let reflexive = discover_reflexive(&socket, &ctx.stun_servers, STUN_TIMEOUT).await?;

        let topic = ctx.payload.relay_topic();
        // subscribe first so the answer cannot slip past
        let mut answers = ctx.relay.subscribe(&downstream_topic(topic)).await?;

        let offer_id = uuid::Uuid::new_v4().to_string();
        let offer = SignalEnvelope::NatOffer {
            offer_id: offer_id.clone(),
            session_id: ctx.payload.session_id().to_string(),
            reflexive,
        };
        ctx.relay
            .publish(&upstream_topic(topic), seal_envelope(&ctx.keys.signaling, &offer)?)
            .await?;
        debug!("Sent NAT offer {} from {}", offer_id, reflexive);

        let peer = wait_for_envelope(&mut answers, &ctx.keys.signaling, |envelope| {
            match envelope {
                SignalEnvelope::NatAnswer {
                    offer_id: id,
                    reflexive,
                } if id == offer_id => Some(reflexive),
                _ => None,
            }
        })
        .await?;
        drop(answers);
        debug!("Daemon answered offer {} from {}", offer_id, peer);

        let confirmed = punch(&socket, peer, &offer_id, &ctx.keys.signaling).await?;
        Ok(Box::new(DatagramLink::new(socket, confirmed)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ras_core::relay::RelayClient;
    use ras_core::SessionKeys;
    use ras_protocol::{MasterSecret, PairingPayload};
    use std::sync::Arc;

    #[test]
    fn test_requires_stun_servers() {
        let secret = MasterSecret::from_bytes([5u8; 32]);
        let mut ctx = TransportContext {
            payload: PairingPayload::new("192.168.1.100:8821".parse().unwrap(), secret.clone(), "s")
                .unwrap(),
            keys: Arc::new(SessionKeys::derive(&secret).unwrap()),
            relay: RelayClient::new("http://127.0.0.1:9").unwrap(),
            stun_servers: Vec::new(),
            timestamp_tolerance_secs: 300,
        };

        assert!(!NatCandidate::new().is_applicable(&ctx));
        ctx.stun_servers.push("stun.example.net:3478".to_string());
        assert!(NatCandidate::new().is_applicable(&ctx));
    }
}
