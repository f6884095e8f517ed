//! Peer link tunnelled through the push relay
//!
//! Each protocol frame is sealed with the `encryption` key, wrapped in a
//! `RelayData` envelope, and the envelope is sealed again with the
//! `signaling` key before publishing. Inbound frames arrive through an mpsc
//! channel fed by whoever owns the subscription.

use std::collections::BTreeMap;

use async_trait::async_trait;
use ras_protocol::{decode_message, encode_message, Message, SignalEnvelope};
use tokio::sync::mpsc;
use tokio_util::sync::DropGuard;
use tracing::{debug, trace};

use super::seal::{open_frame, seal_envelope, seal_frame};
use super::RelayClient;
use crate::crypto::{DerivedKey, SessionKeys};
use crate::error::ConnectionError;
use crate::link::PeerLink;

/// Out-of-order frames held before giving up on a gap
const MAX_REORDER: usize = 64;

/// One inbound `RelayData` payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayFrame {
    /// Sender sequence number, starting at 0
    pub seq: u64,
    /// Frame sealed with the `encryption` key
    pub sealed: String,
}

/// [`PeerLink`] over relay topics
pub struct RelayLink {
    client: RelayClient,
    outbound_topic: String,
    link_id: String,
    signaling_key: DerivedKey,
    encryption_key: DerivedKey,
    next_seq: u64,
    expected_seq: u64,
    pending: BTreeMap<u64, String>,
    inbound: mpsc::Receiver<RelayFrame>,
    closed: bool,
    _guard: Option<DropGuard>,
}

impl RelayLink {
    /// Create a link that publishes to `outbound_topic` and reads `inbound`
    pub fn new(
        client: RelayClient,
        outbound_topic: impl Into<String>,
        link_id: impl Into<String>,
        keys: &SessionKeys,
        inbound: mpsc::Receiver<RelayFrame>,
    ) -> Self {
        Self {
            client,
            outbound_topic: outbound_topic.into(),
            link_id: link_id.into(),
            signaling_key: keys.signaling.clone(),
            encryption_key: keys.encryption.clone(),
            next_seq: 0,
            expected_seq: 0,
            pending: BTreeMap::new(),
            inbound,
            closed: false,
            _guard: None,
        }
    }

    /// Cancel the feeding task when this link is dropped
    pub fn with_guard(mut self, guard: DropGuard) -> Self {
        self._guard = Some(guard);
        self
    }

    /// Link identifier shared by both ends
    pub fn link_id(&self) -> &str {
        &self.link_id
    }

    async fn publish(&self, envelope: &SignalEnvelope) -> Result<(), ConnectionError> {
        let text = seal_envelope(&self.signaling_key, envelope)?;
        self.client.publish(&self.outbound_topic, text).await
    }

    fn open(&self, sealed: &str) -> Result<Message, ConnectionError> {
        let frame = open_frame(&self.encryption_key, sealed)
            .map_err(|e| ConnectionError::Relay(format!("relayed frame rejected: {}", e)))?;
        Ok(decode_message(&frame)?)
    }

    /// Next in-order sealed frame, buffering anything that arrives early
    async fn next_in_order(&mut self) -> Option<String> {
        loop {
            if let Some(sealed) = self.pending.remove(&self.expected_seq) {
                self.expected_seq += 1;
                return Some(sealed);
            }

            let frame = match self.inbound.recv().await {
                Some(frame) => frame,
                None => {
                    // Feeder gone: deliver what we have, skipping gaps
                    let (&seq, _) = self.pending.iter().next()?;
                    self.expected_seq = seq;
                    continue;
                }
            };

            if frame.seq < self.expected_seq || self.pending.contains_key(&frame.seq) {
                trace!("Dropping duplicate relayed frame {}", frame.seq);
                continue;
            }
            if frame.seq == self.expected_seq {
                self.expected_seq += 1;
                return Some(frame.sealed);
            }

            self.pending.insert(frame.seq, frame.sealed);
            if self.pending.len() > MAX_REORDER {
                if let Some((&seq, _)) = self.pending.iter().next() {
                    debug!(
                        "Skipping relayed frames {}..{} on link {}",
                        self.expected_seq, seq, self.link_id
                    );
                    self.expected_seq = seq;
                }
            }
        }
    }
}

#[async_trait]
impl PeerLink for RelayLink {
    async fn send(&mut self, message: Message) -> Result<(), ConnectionError> {
        if self.closed {
            return Err(ConnectionError::Closed);
        }

        let frame = encode_message(&message)?;
        let envelope = SignalEnvelope::RelayData {
            link_id: self.link_id.clone(),
            seq: self.next_seq,
            sealed: seal_frame(&self.encryption_key, &frame)?,
        };
        self.publish(&envelope).await?;
        self.next_seq += 1;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Message>, ConnectionError> {
        if self.closed {
            return Ok(None);
        }
        match self.next_in_order().await {
            Some(sealed) => self.open(&sealed).map(Some),
            None => Ok(None),
        }
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.inbound.close();
        self.publish(&SignalEnvelope::RelayClose {
            link_id: self.link_id.clone(),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ras_protocol::MasterSecret;

    fn keys() -> SessionKeys {
        SessionKeys::derive(&MasterSecret::from_bytes([4u8; 32])).unwrap()
    }

    fn sealed(keys: &SessionKeys, message: &Message) -> String {
        seal_frame(&keys.encryption, &encode_message(message).unwrap()).unwrap()
    }

    fn link(keys: &SessionKeys) -> (RelayLink, mpsc::Sender<RelayFrame>) {
        let (tx, rx) = mpsc::channel(16);
        let client = RelayClient::new("http://127.0.0.1:9").unwrap();
        (RelayLink::new(client, "ras-test-up", "link-1", keys, rx), tx)
    }

    #[tokio::test]
    async fn test_reorders_and_deduplicates() {
        let keys = keys();
        let (mut link, tx) = link(&keys);

        let ping = |t| Message::Ping { timestamp: t };
        for seq in [1u64, 0, 0, 2, 1] {
            tx.send(RelayFrame {
                seq,
                sealed: sealed(&keys, &ping(seq)),
            })
            .await
            .unwrap();
        }
        drop(tx);

        assert_eq!(link.recv().await.unwrap(), Some(ping(0)));
        assert_eq!(link.recv().await.unwrap(), Some(ping(1)));
        assert_eq!(link.recv().await.unwrap(), Some(ping(2)));
        assert_eq!(link.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_gap_skipped_when_feed_ends() {
        let keys = keys();
        let (mut link, tx) = link(&keys);

        tx.send(RelayFrame {
            seq: 3,
            sealed: sealed(&keys, &Message::Pong { timestamp: 3 }),
        })
        .await
        .unwrap();
        drop(tx);

        assert_eq!(link.recv().await.unwrap(), Some(Message::Pong { timestamp: 3 }));
        assert_eq!(link.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_foreign_frame_rejected() {
        let keys = keys();
        let other = SessionKeys::derive(&MasterSecret::from_bytes([5u8; 32])).unwrap();
        let (mut link, tx) = link(&keys);

        tx.send(RelayFrame {
            seq: 0,
            sealed: sealed(&other, &Message::Ping { timestamp: 1 }),
        })
        .await
        .unwrap();

        assert!(matches!(link.recv().await, Err(ConnectionError::Relay(_))));
    }
}
