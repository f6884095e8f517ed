//! Push relay client
//!
//! The relay is an ntfy-compatible topic server: `POST {server}/{topic}`
//! publishes a text message and `GET {server}/{topic}/json` streams one JSON
//! event per line. Everything we publish is sealed first (see [`seal`]), so
//! the relay only ever sees opaque base64.

pub mod link;
pub mod seal;

use std::time::Duration;

use bytes::BytesMut;
use serde::Deserialize;
use tracing::{debug, trace};

use crate::error::ConnectionError;

pub use link::{RelayFrame, RelayLink};
pub use seal::OpenError;

/// ntfy's default message size limit
pub const MAX_MESSAGE_SIZE: usize = 4096;

/// Longest subscription line we buffer while waiting for its newline
pub const MAX_EVENT_LINE: usize = 4 * MAX_MESSAGE_SIZE;

/// Kind of event on a subscription stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Subscription established
    Open,
    /// Periodic keepalive
    Keepalive,
    /// A published message
    Message,
    /// Anything else the server sends
    Other,
}

/// One line of a subscription stream
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RelayEvent {
    /// Server-assigned message id
    #[serde(default)]
    pub id: String,
    /// Server timestamp (Unix seconds)
    #[serde(default)]
    pub time: u64,
    /// `open`, `keepalive`, `message`, ...
    pub event: String,
    /// Topic the event belongs to
    #[serde(default)]
    pub topic: String,
    /// Message body for `message` events
    #[serde(default)]
    pub message: Option<String>,
}

impl RelayEvent {
    /// Classify the event
    pub fn kind(&self) -> EventKind {
        match self.event.as_str() {
            "open" => EventKind::Open,
            "keepalive" => EventKind::Keepalive,
            "message" => EventKind::Message,
            _ => EventKind::Other,
        }
    }

    /// Build a `message` event (used by local relays and tests)
    pub fn message(topic: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            time: 0,
            event: "message".to_string(),
            topic: topic.into(),
            message: Some(body.into()),
        }
    }
}

/// Parse one subscription line; `None` for blank or malformed lines
pub fn parse_event_line(line: &[u8]) -> Option<RelayEvent> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    if line.iter().all(|b| b.is_ascii_whitespace()) {
        return None;
    }
    match serde_json::from_slice(line) {
        Ok(event) => Some(event),
        Err(e) => {
            debug!("Skipping malformed relay line: {}", e);
            None
        }
    }
}

/// HTTP client for one relay server
#[derive(Debug, Clone)]
pub struct RelayClient {
    http: reqwest::Client,
    server: String,
}

impl RelayClient {
    /// Create a client for `server` (e.g. `https://ntfy.sh`)
    pub fn new(server: impl Into<String>) -> Result<Self, ConnectionError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ConnectionError::Relay(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            server: server.into().trim_end_matches('/').to_string(),
        })
    }

    /// Relay base URL
    pub fn server(&self) -> &str {
        &self.server
    }

    fn topic_url(&self, topic: &str) -> String {
        format!("{}/{}", self.server, topic)
    }

    /// Publish a text message to `topic`
    pub async fn publish(&self, topic: &str, message: String) -> Result<(), ConnectionError> {
        if message.len() > MAX_MESSAGE_SIZE {
            return Err(ConnectionError::Relay(format!(
                "message of {} bytes exceeds relay limit of {}",
                message.len(),
                MAX_MESSAGE_SIZE
            )));
        }

        let response = self
            .http
            .post(self.topic_url(topic))
            .timeout(Duration::from_secs(15))
            .body(message)
            .send()
            .await
            .map_err(|e| ConnectionError::Relay(format!("publish failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(ConnectionError::Relay(format!(
                "publish to {} returned {}",
                topic,
                response.status()
            )));
        }

        trace!("Published to {}", topic);
        Ok(())
    }

    /// Open a streaming subscription to `topic`
    pub async fn subscribe(&self, topic: &str) -> Result<RelaySubscription, ConnectionError> {
        let response = self
            .http
            .get(format!("{}/json", self.topic_url(topic)))
            .send()
            .await
            .map_err(|e| ConnectionError::Relay(format!("subscribe failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(ConnectionError::Relay(format!(
                "subscribe to {} returned {}",
                topic,
                response.status()
            )));
        }

        debug!("Subscribed to {}", topic);
        Ok(RelaySubscription {
            response,
            buf: BytesMut::new(),
            finished: false,
        })
    }
}

/// Live subscription stream
#[derive(Debug)]
pub struct RelaySubscription {
    response: reqwest::Response,
    buf: BytesMut,
    finished: bool,
}

impl RelaySubscription {
    /// Next event; `Ok(None)` when the server ends the stream.
    ///
    /// Malformed lines are skipped. A line longer than [`MAX_EVENT_LINE`]
    /// ends the subscription with an error.
    pub async fn next_event(&mut self) -> Result<Option<RelayEvent>, ConnectionError> {
        loop {
            if let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
                let line = self.buf.split_to(pos + 1);
                if let Some(event) = parse_event_line(&line[..pos]) {
                    return Ok(Some(event));
                }
                continue;
            }

            if self.finished {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                let rest = self.buf.split();
                return Ok(parse_event_line(&rest));
            }

            if self.buf.len() > MAX_EVENT_LINE {
                self.buf = BytesMut::new();
                self.finished = true;
                return Err(ConnectionError::Relay(format!(
                    "subscription line exceeds {} bytes",
                    MAX_EVENT_LINE
                )));
            }

            match self
                .response
                .chunk()
                .await
                .map_err(|e| ConnectionError::Relay(format!("subscription read failed: {}", e)))?
            {
                Some(chunk) => self.buf.extend_from_slice(&chunk),
                None => self.finished = true,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, State};
    use axum::routing::{get, post};
    use axum::Router;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_parse_event_line() {
        let event = parse_event_line(
            br#"{"id":"abc","time":1700000000,"event":"message","topic":"ras-1","message":"hi"}"#,
        )
        .unwrap();
        assert_eq!(event.kind(), EventKind::Message);
        assert_eq!(event.message.as_deref(), Some("hi"));

        let open = parse_event_line(br#"{"id":"x","time":1,"event":"open","topic":"ras-1"}"#).unwrap();
        assert_eq!(open.kind(), EventKind::Open);
        assert_eq!(open.message, None);

        assert!(parse_event_line(b"").is_none());
        assert!(parse_event_line(b"  \r").is_none());
        assert!(parse_event_line(b"{not json").is_none());
    }

    type Published = Arc<Mutex<Vec<(String, String)>>>;

    async fn spawn_relay(published: Published) -> String {
        async fn publish(
            State(published): State<Published>,
            Path(topic): Path<String>,
            body: String,
        ) -> &'static str {
            published.lock().unwrap().push((topic, body));
            "{}"
        }

        async fn subscribe(Path(topic): Path<String>) -> String {
            [
                format!(r#"{{"id":"1","time":1,"event":"open","topic":"{}"}}"#, topic),
                r#"{"id":"2","time":2,"event":"keepalive"}"#.to_string(),
                "garbage".to_string(),
                format!(
                    r#"{{"id":"3","time":3,"event":"message","topic":"{}","message":"payload"}}"#,
                    topic
                ),
            ]
            .join("\n")
        }

        let app = Router::new()
            .route("/:topic", post(publish))
            .route("/:topic/json", get(subscribe))
            .with_state(published);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/", addr)
    }

    #[tokio::test]
    async fn test_publish_and_subscribe() {
        let published = Published::default();
        let server = spawn_relay(published.clone()).await;
        let client = RelayClient::new(server).unwrap();

        client.publish("ras-abc", "sealed".to_string()).await.unwrap();
        assert_eq!(
            published.lock().unwrap().as_slice(),
            &[("ras-abc".to_string(), "sealed".to_string())]
        );

        let mut sub = client.subscribe("ras-abc").await.unwrap();
        assert_eq!(sub.next_event().await.unwrap().unwrap().kind(), EventKind::Open);
        assert_eq!(
            sub.next_event().await.unwrap().unwrap().kind(),
            EventKind::Keepalive
        );
        let message = sub.next_event().await.unwrap().unwrap();
        assert_eq!(message.kind(), EventKind::Message);
        assert_eq!(message.message.as_deref(), Some("payload"));
        assert_eq!(sub.next_event().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_endless_line_ends_subscription() {
        async fn subscribe(Path(topic): Path<String>) -> String {
            format!(
                "{}\n{}",
                format!(r#"{{"id":"1","time":1,"event":"open","topic":"{}"}}"#, topic),
                "x".repeat(MAX_EVENT_LINE * 4)
            )
        }

        let app = Router::new().route("/:topic/json", get(subscribe));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = RelayClient::new(format!("http://{}", addr)).unwrap();
        let mut sub = client.subscribe("ras-abc").await.unwrap();
        assert_eq!(sub.next_event().await.unwrap().unwrap().kind(), EventKind::Open);

        let err = sub.next_event().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Relay(_)));
        assert!(sub.buf.is_empty());
        assert_eq!(sub.next_event().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_publish_rejected() {
        let client = RelayClient::new("http://127.0.0.1:9").unwrap();
        let err = client
            .publish("t", "x".repeat(MAX_MESSAGE_SIZE + 1))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Relay(_)));
    }
}
