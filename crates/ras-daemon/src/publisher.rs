//! Address-change publisher
//!
//! Polls the host's LAN address and, when it moves, posts a sealed
//! notification to the pairing's relay topic so the client can follow.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use ras_core::crypto::DerivedKey;
use ras_core::netinfo;
use ras_core::relay::seal::{new_notification, seal_notification};
use ras_core::relay::RelayClient;
use ras_core::time::current_time_secs;
use ras_core::ConnectionError;
use ras_protocol::IpChangeNotification;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::state::DaemonState;

type Detector = Box<dyn Fn() -> Option<IpAddr> + Send + Sync>;

/// Publishes the daemon's address whenever it changes
pub struct IpChangePublisher {
    relay: RelayClient,
    topic: String,
    key: DerivedKey,
    port: u16,
    interval: Duration,
    detector: Detector,
    last: Option<IpAddr>,
}

impl IpChangePublisher {
    /// Publisher for the daemon's pairing, starting from the advertised address
    pub fn new(state: &Arc<DaemonState>) -> Self {
        let rendezvous = state.record.payload().rendezvous();
        Self {
            relay: state.relay.clone(),
            topic: state.relay_topic().to_string(),
            key: state.keys.relay.clone(),
            port: rendezvous.port(),
            interval: state.config.ip_poll_interval,
            detector: Box::new(netinfo::detect_lan_ip),
            last: Some(rendezvous.ip()),
        }
    }

    /// Replace how the current address is found
    pub fn with_detector(mut self, detector: impl Fn() -> Option<IpAddr> + Send + Sync + 'static) -> Self {
        self.detector = Box::new(detector);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Last address published or advertised
    pub fn last_address(&self) -> Option<IpAddr> {
        self.last
    }

    /// Seal and post a notification for `ip` now
    pub async fn publish_now(&self, ip: IpAddr) -> Result<IpChangeNotification, ConnectionError> {
        let notification = new_notification(SocketAddr::new(ip, self.port), current_time_secs());
        let sealed = seal_notification(&self.key, &notification)?;
        self.relay.publish(&self.topic, sealed).await?;
        info!("Published address change to {}:{}", ip, self.port);
        Ok(notification)
    }

    /// Check the address once, publishing if it moved
    pub async fn poll_once(&mut self) -> Result<Option<IpChangeNotification>, ConnectionError> {
        let Some(current) = (self.detector)() else {
            debug!("No LAN address right now");
            return Ok(None);
        };
        if Some(current) == self.last {
            return Ok(None);
        }

        info!("Address changed: {:?} -> {}", self.last, current);
        let notification = self.publish_now(current).await?;
        // Only remember it once published so a failed post is retried
        self.last = Some(current);
        Ok(Some(notification))
    }

    /// Poll until cancelled
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Address publisher stopping");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        warn!("Failed to publish address change: {}", e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pairing::PairingRecord;
    use axum::body::Bytes;
    use axum::extract::{Path, State};
    use axum::routing::post;
    use axum::Router;
    use ras_core::config::DaemonConfig;
    use ras_core::relay::seal::open_notification;
    use std::sync::Mutex;
    use tokio::net::TcpListener;

    type Posts = Arc<Mutex<Vec<(String, String)>>>;

    async fn capture(
        State(posts): State<Posts>,
        Path(topic): Path<String>,
        body: Bytes,
    ) -> &'static str {
        posts
            .lock()
            .unwrap()
            .push((topic, String::from_utf8_lossy(&body).into_owned()));
        "{}"
    }

    async fn relay() -> (String, Posts) {
        let posts: Posts = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route("/:topic", post(capture))
            .with_state(posts.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), posts)
    }

    fn state(relay_server: String) -> Arc<DaemonState> {
        let record =
            PairingRecord::generate("192.168.1.50:8821".parse().unwrap(), None, None).unwrap();
        let config = DaemonConfig {
            relay_server,
            ..DaemonConfig::default()
        };
        Arc::new(DaemonState::new(config, record, 8822).unwrap())
    }

    #[tokio::test]
    async fn test_unchanged_address_is_not_published() {
        let (server, posts) = relay().await;
        let state = state(server);
        let mut publisher = IpChangePublisher::new(&state)
            .with_detector(|| Some("192.168.1.50".parse().unwrap()));

        assert!(publisher.poll_once().await.unwrap().is_none());
        assert!(posts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_change_publishes_sealed_notification() {
        let (server, posts) = relay().await;
        let state = state(server);
        let mut publisher = IpChangePublisher::new(&state)
            .with_detector(|| Some("192.168.1.100".parse().unwrap()));

        let sent = publisher.poll_once().await.unwrap().unwrap();
        assert_eq!(sent.socket_addr(), "192.168.1.100:8821".parse().unwrap());
        assert_eq!(publisher.last_address(), Some("192.168.1.100".parse().unwrap()));

        // Same address again: nothing new
        assert!(publisher.poll_once().await.unwrap().is_none());

        let posts = posts.lock().unwrap();
        assert_eq!(posts.len(), 1);
        let (topic, body) = &posts[0];
        assert_eq!(topic, state.relay_topic());
        let opened = open_notification(&state.keys.relay, body).unwrap();
        assert_eq!(opened, sent);
    }

    #[tokio::test]
    async fn test_failed_publish_is_retried() {
        let state = state("http://127.0.0.1:9".to_string());
        let mut publisher = IpChangePublisher::new(&state)
            .with_detector(|| Some("10.1.1.1".parse().unwrap()));

        assert!(publisher.poll_once().await.is_err());
        assert_eq!(publisher.last_address(), Some("192.168.1.50".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_no_address_is_quiet() {
        let (server, posts) = relay().await;
        let state = state(server);
        let mut publisher = IpChangePublisher::new(&state).with_detector(|| None);

        assert!(publisher.poll_once().await.unwrap().is_none());
        assert!(posts.lock().unwrap().is_empty());
    }
}
