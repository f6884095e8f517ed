//! Encrypted address-change notifications
//!
//! The daemon publishes its new address to the pairing's relay topic,
//! sealed with the `ntfy-relay` key. Everything that is not a fresh,
//! authentic, never-seen message is dropped here, quietly: the topic is
//! public and anyone can post to it.

use std::sync::Arc;

use ras_core::nonce_cache::DEFAULT_NONCE_CAPACITY;
use ras_core::relay::seal::open_notification;
use ras_core::relay::{EventKind, OpenError, RelayClient, RelayEvent};
use ras_core::signaling::TIMESTAMP_TOLERANCE_SECS;
use ras_core::time::{current_time_secs, within_window};
use ras_core::{DerivedKey, NonceCache, SessionKeys};
use ras_protocol::{IpChangeNotification, PairingPayload};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::ExponentialBackoff;

/// Why a relay event produced no notification
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Open, keepalive and other non-message events
    #[error("control event")]
    Control,

    /// Not base64, too short, wrong key or tampered
    #[error("undecodable: {0}")]
    Undecodable(#[from] OpenError),

    /// Nonce already seen
    #[error("replayed nonce")]
    Replay,

    /// Timestamp outside the accepted window
    #[error("timestamp {timestamp} outside window (now {now})")]
    Stale { timestamp: u64, now: u64 },
}

/// Filters one relay topic down to authentic address changes
pub struct NotificationChannel {
    relay: RelayClient,
    topic: String,
    key: DerivedKey,
    cache: Arc<NonceCache>,
    tolerance_secs: u64,
}

impl NotificationChannel {
    /// Channel for the pairing in `payload`
    pub fn new(relay: RelayClient, payload: &PairingPayload, keys: &SessionKeys) -> Self {
        Self {
            relay,
            topic: payload.relay_topic().to_string(),
            key: keys.relay.clone(),
            cache: Arc::new(NonceCache::new(DEFAULT_NONCE_CAPACITY)),
            tolerance_secs: TIMESTAMP_TOLERANCE_SECS,
        }
    }

    /// Share a nonce cache, e.g. across resubscriptions of the same pairing
    pub fn with_cache(mut self, cache: Arc<NonceCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Accepted clock skew on notification timestamps, in seconds
    pub fn with_tolerance(mut self, secs: u64) -> Self {
        self.tolerance_secs = secs;
        self
    }

    /// Topic being watched
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Replay cache in use
    pub fn cache(&self) -> &Arc<NonceCache> {
        &self.cache
    }

    /// Process one event against the current clock
    pub fn process(&self, event: &RelayEvent) -> Result<IpChangeNotification, Rejection> {
        self.process_at(event, current_time_secs())
    }

    /// Process one event as if the time were `now`.
    ///
    /// The nonce is cached as soon as the message opens, before the
    /// timestamp check.
    pub fn process_at(
        &self,
        event: &RelayEvent,
        now: u64,
    ) -> Result<IpChangeNotification, Rejection> {
        if event.kind() != EventKind::Message {
            return Err(Rejection::Control);
        }
        let text = event.message.as_deref().ok_or(Rejection::Control)?;

        let notification = open_notification(&self.key, text)?;

        if !self.cache.check_and_insert(notification.nonce) {
            return Err(Rejection::Replay);
        }

        if !within_window(notification.timestamp, now, self.tolerance_secs) {
            return Err(Rejection::Stale {
                timestamp: notification.timestamp,
                now,
            });
        }

        Ok(notification)
    }

    /// Subscribe and forward accepted notifications until cancelled.
    ///
    /// Lost subscriptions are re-established after a backoff delay. Returns
    /// when `cancel` fires or the receiver is dropped.
    pub async fn run(
        &self,
        tx: mpsc::Sender<IpChangeNotification>,
        cancel: CancellationToken,
        mut backoff: ExponentialBackoff,
    ) {
        loop {
            let subscribed = tokio::select! {
                _ = cancel.cancelled() => return,
                result = self.relay.subscribe(&self.topic) => result,
            };

            match subscribed {
                Ok(mut subscription) => {
                    info!("Listening for address changes on {}", self.topic);
                    backoff.reset();

                    loop {
                        let event = tokio::select! {
                            _ = cancel.cancelled() => return,
                            event = subscription.next_event() => event,
                        };

                        match event {
                            Ok(Some(event)) => match self.process(&event) {
                                Ok(notification) => {
                                    info!(
                                        "Daemon moved to {}",
                                        notification.socket_addr()
                                    );
                                    if tx.send(notification).await.is_err() {
                                        return;
                                    }
                                }
                                Err(Rejection::Control) => {}
                                Err(rejection) => {
                                    debug!("Dropped relay message: {}", rejection)
                                }
                            },
                            Ok(None) => {
                                debug!("Relay closed subscription to {}", self.topic);
                                break;
                            }
                            Err(e) => {
                                warn!("Relay subscription failed: {}", e);
                                break;
                            }
                        }
                    }
                }
                Err(e) => warn!("Failed to subscribe to {}: {}", self.topic, e),
            }

            let delay = backoff.next_delay();
            debug!("Resubscribing in {:?}", delay);
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ras_core::relay::seal::{new_notification, seal_notification};
    use ras_protocol::MasterSecret;
    use std::net::SocketAddr;

    const NOW: u64 = 1_700_000_000;

    fn setup() -> (NotificationChannel, SessionKeys) {
        let secret = MasterSecret::from_bytes([9u8; 32]);
        let payload =
            PairingPayload::new("192.168.1.100:8821".parse().unwrap(), secret.clone(), "s-1")
                .unwrap();
        let keys = SessionKeys::derive(&secret).unwrap();
        let channel = NotificationChannel::new(
            RelayClient::new("http://127.0.0.1:9").unwrap(),
            &payload,
            &keys,
        );
        (channel, keys)
    }

    fn sealed_event(key: &DerivedKey, addr: &str, timestamp: u64) -> RelayEvent {
        let addr: SocketAddr = addr.parse().unwrap();
        let sealed = seal_notification(key, &new_notification(addr, timestamp)).unwrap();
        RelayEvent::message("ras-topic", sealed)
    }

    #[test]
    fn test_accepts_fresh_notification() {
        let (channel, keys) = setup();
        let event = sealed_event(&keys.relay, "192.168.1.140:8821", NOW);

        let notification = channel.process_at(&event, NOW).unwrap();
        assert_eq!(
            notification.socket_addr(),
            "192.168.1.140:8821".parse().unwrap()
        );
    }

    #[test]
    fn test_identical_message_delivers_once() {
        let (channel, keys) = setup();
        let event = sealed_event(&keys.relay, "192.168.1.140:8821", NOW);

        assert!(channel.process_at(&event, NOW).is_ok());
        assert_eq!(channel.process_at(&event, NOW), Err(Rejection::Replay));
    }

    #[test]
    fn test_timestamp_window() {
        let (channel, keys) = setup();

        let stale = sealed_event(&keys.relay, "10.0.0.2:8821", NOW - 301);
        assert!(matches!(
            channel.process_at(&stale, NOW),
            Err(Rejection::Stale { .. })
        ));

        let future = sealed_event(&keys.relay, "10.0.0.2:8821", NOW + 301);
        assert!(matches!(
            channel.process_at(&future, NOW),
            Err(Rejection::Stale { .. })
        ));

        let edge = sealed_event(&keys.relay, "10.0.0.2:8821", NOW - 300);
        assert!(channel.process_at(&edge, NOW).is_ok());
    }

    #[test]
    fn test_stale_message_still_burns_nonce() {
        let (channel, keys) = setup();
        let stale = sealed_event(&keys.relay, "10.0.0.2:8821", NOW - 1000);

        assert!(matches!(
            channel.process_at(&stale, NOW),
            Err(Rejection::Stale { .. })
        ));
        // the same message is a replay even at a time where it would be fresh
        assert_eq!(channel.process_at(&stale, NOW - 1000), Err(Rejection::Replay));
    }

    #[test]
    fn test_rejects_noise() {
        let (channel, keys) = setup();

        let control = RelayEvent {
            event: "keepalive".to_string(),
            ..RelayEvent::message("t", "")
        };
        assert_eq!(channel.process_at(&control, NOW), Err(Rejection::Control));

        let wrong_key = sealed_event(&keys.signaling, "10.0.0.2:8821", NOW);
        assert_eq!(
            channel.process_at(&wrong_key, NOW),
            Err(Rejection::Undecodable(OpenError::Authentication))
        );

        let garbage = RelayEvent::message("t", "not base64 at all!");
        assert_eq!(
            channel.process_at(&garbage, NOW),
            Err(Rejection::Undecodable(OpenError::InvalidBase64))
        );

        let short = RelayEvent::message("t", "AAAA");
        assert_eq!(
            channel.process_at(&short, NOW),
            Err(Rejection::Undecodable(OpenError::Undersized))
        );

        assert!(channel.cache().is_empty());
    }
}
