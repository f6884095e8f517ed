//! Signaling bodies
//!
//! Two signaling carriers exist:
//!
//! - LAN/overlay: a signed HTTP exchange with the daemon's signaling server.
//!   The signature is `HMAC(auth_key, session_id || be64(timestamp) || body)`
//!   and travels in the headers named below.
//! - Relay: [`SignalEnvelope`]s posted on the pairing topic's `-up`/`-down`
//!   sub-topics, sealed with the signaling key.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// HTTP path of the signaling endpoint
pub const SIGNAL_PATH: &str = "/v1/signal";

/// Header carrying the session id
pub const HEADER_SESSION: &str = "x-ras-session";

/// Header carrying the unix timestamp (seconds) the signature covers
pub const HEADER_TIMESTAMP: &str = "x-ras-timestamp";

/// Header carrying the hex HMAC signature
pub const HEADER_SIGNATURE: &str = "x-ras-signature";

/// Suffix of the client → daemon relay signaling topic
pub const UPSTREAM_SUFFIX: &str = "-up";

/// Suffix of the daemon → client relay signaling topic
pub const DOWNSTREAM_SUFFIX: &str = "-down";

/// Client → daemon topic for a pairing topic
pub fn upstream_topic(relay_topic: &str) -> String {
    format!("{}{}", relay_topic, UPSTREAM_SUFFIX)
}

/// Daemon → client topic for a pairing topic
pub fn downstream_topic(relay_topic: &str) -> String {
    format!("{}{}", relay_topic, DOWNSTREAM_SUFFIX)
}

/// Signaling request body (client → daemon)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalRequest {
    /// Hex nonce the response must echo, binds the response to this request
    pub request_nonce: String,
    /// Address the client believes it is sending from (informational)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_addr: Option<SocketAddr>,
}

/// Signaling response body (daemon → client)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalResponse {
    /// Echo of [`SignalRequest::request_nonce`]
    pub request_nonce: String,
    /// TCP port of the daemon's transport listener
    pub transport_port: u16,
    /// Source address the daemon saw for the request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_addr: Option<SocketAddr>,
}

/// Messages carried over the relay signaling topics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalEnvelope {
    /// Client wants to hole-punch from `reflexive`
    NatOffer {
        offer_id: String,
        session_id: String,
        reflexive: SocketAddr,
    },

    /// Daemon will punch from `reflexive`
    NatAnswer {
        offer_id: String,
        reflexive: SocketAddr,
    },

    /// Client wants a relayed link
    RelayOpen { link_id: String, session_id: String },

    /// Daemon accepted a relayed link
    RelayAccept { link_id: String },

    /// One protocol frame on a relayed link, sealed with the encryption key
    RelayData {
        link_id: String,
        seq: u64,
        sealed: String,
    },

    /// Relayed link closed
    RelayClose { link_id: String },
}

impl SignalEnvelope {
    /// Serialize to JSON
    pub fn to_json(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse JSON
    pub fn from_json(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_suffixes() {
        assert_eq!(upstream_topic("ras-abc"), "ras-abc-up");
        assert_eq!(downstream_topic("ras-abc"), "ras-abc-down");
    }

    #[test]
    fn test_envelope_is_tagged() {
        let envelope = SignalEnvelope::RelayOpen {
            link_id: "l1".to_string(),
            session_id: "s1".to_string(),
        };
        let json: serde_json::Value =
            serde_json::from_slice(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "relay_open");

        let parsed = SignalEnvelope::from_json(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn test_signal_request_omits_missing_addr() {
        let request = SignalRequest {
            request_nonce: "00ff".to_string(),
            client_addr: None,
        };
        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(json, r#"{"request_nonce":"00ff"}"#);
    }
}
