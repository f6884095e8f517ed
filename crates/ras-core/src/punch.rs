//! UDP hole punching
//!
//! Both peers learn each other's reflexive address through the relay, then
//! fire authenticated `Probe` datagrams at it until one arrives from the
//! other side. A probe carries `HMAC(signaling_key, offer_id)` so strangers
//! cannot hijack the mapping.

use std::net::SocketAddr;
use std::time::Duration;

use ras_protocol::{decode_message, encode_message, Message};
use tokio::net::UdpSocket;
use tracing::{debug, info};

use crate::crypto::{mac, DerivedKey};
use crate::error::ConnectionError;

/// Gap between probes
pub const PROBE_INTERVAL: Duration = Duration::from_millis(200);

/// Probes sent after the peer is confirmed, so its side sees us too
const CONFIRMATION_PROBES: usize = 3;

/// Build the probe for `offer_id`
pub fn probe(key: &DerivedKey, offer_id: &str) -> Message {
    Message::Probe {
        offer_id: offer_id.to_string(),
        proof: mac::compute(key.as_bytes(), offer_id.as_bytes()),
    }
}

fn is_valid_probe(datagram: &[u8], key: &DerivedKey, offer_id: &str) -> bool {
    match decode_message(datagram) {
        Ok(Message::Probe { offer_id: id, proof }) => {
            id == offer_id && mac::verify(key.as_bytes(), id.as_bytes(), &proof)
        }
        _ => false,
    }
}

/// Punch towards `peer` until a valid probe comes back.
///
/// Runs until it succeeds; callers bound it with a timeout. Returns the
/// address the peer's probe actually came from, which can differ from
/// `peer` in port when the peer's NAT remaps.
pub async fn punch(
    socket: &UdpSocket,
    peer: SocketAddr,
    offer_id: &str,
    key: &DerivedKey,
) -> Result<SocketAddr, ConnectionError> {
    let frame = encode_message(&probe(key, offer_id))?;
    let mut ticker = tokio::time::interval(PROBE_INTERVAL);
    let mut buf = [0u8; 1024];

    let confirmed = loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = socket.send_to(&frame, peer).await {
                    debug!("Probe to {} failed: {}", peer, e);
                }
            }
            received = socket.recv_from(&mut buf) => {
                let (len, from) = received?;
                if from.ip() != peer.ip() {
                    continue;
                }
                if is_valid_probe(&buf[..len], key, offer_id) {
                    break from;
                }
            }
        }
    };

    for _ in 0..CONFIRMATION_PROBES {
        socket.send_to(&frame, confirmed).await?;
    }

    info!("Hole punched to {}", confirmed);
    Ok(confirmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::derive_key;

    #[tokio::test]
    async fn test_punch_between_local_sockets() {
        let key = derive_key(&[6u8; 32], "signaling").unwrap();
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let a_addr = a.local_addr().unwrap();
        let b_addr = b.local_addr().unwrap();

        let (ra, rb) = tokio::join!(
            punch(&a, b_addr, "offer-1", &key),
            punch(&b, a_addr, "offer-1", &key),
        );
        assert_eq!(ra.unwrap(), b_addr);
        assert_eq!(rb.unwrap(), a_addr);
    }

    #[tokio::test]
    async fn test_forged_probe_ignored() {
        let key = derive_key(&[6u8; 32], "signaling").unwrap();
        let wrong = derive_key(&[7u8; 32], "signaling").unwrap();
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b_addr = b.local_addr().unwrap();
        let a_addr = a.local_addr().unwrap();

        let forged = encode_message(&probe(&wrong, "offer-1")).unwrap();
        let other_offer = encode_message(&probe(&key, "offer-2")).unwrap();
        b.send_to(&forged, a_addr).await.unwrap();
        b.send_to(&other_offer, a_addr).await.unwrap();

        let result =
            tokio::time::timeout(Duration::from_millis(500), punch(&a, b_addr, "offer-1", &key))
                .await;
        assert!(result.is_err(), "punch must not accept forged probes");
    }
}
