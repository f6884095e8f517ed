//! Client configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::backoff::BackoffConfig;
use super::serde_utils::{duration_millis, duration_secs};

/// Public push relay used when nothing else is configured
pub const DEFAULT_RELAY_SERVER: &str = "https://ntfy.sh";

/// Public STUN servers tried in order
pub const DEFAULT_STUN_SERVERS: [&str; 2] = ["stun.l.google.com:19302", "stun1.l.google.com:19302"];

/// Configuration for the mobile-side client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the push relay
    pub relay_server: String,

    /// STUN servers (`host:port`) for reflexive address discovery
    pub stun_servers: Vec<String>,

    /// Per-candidate connection timeouts
    pub timeouts: CandidateTimeouts,

    /// Bound on the whole challenge-response exchange
    #[serde(with = "duration_secs")]
    pub handshake_timeout: Duration,

    /// Accepted clock skew for notifications, in seconds
    pub timestamp_tolerance_secs: u64,

    /// Number of notification nonces remembered
    pub nonce_cache_capacity: usize,

    /// Backoff between notification-channel resubscriptions
    pub backoff: BackoffConfig,

    /// Interval between keepalive pings on an established link
    #[serde(with = "duration_secs")]
    pub keepalive_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_server: DEFAULT_RELAY_SERVER.to_string(),
            stun_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            timeouts: CandidateTimeouts::default(),
            handshake_timeout: Duration::from_secs(10),
            timestamp_tolerance_secs: 300,
            nonce_cache_capacity: 100,
            backoff: BackoffConfig::default(),
            keepalive_interval: Duration::from_secs(30),
        }
    }
}

/// How long each transport candidate may take before the next is tried
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CandidateTimeouts {
    /// Overlay-direct attempt
    #[serde(with = "duration_millis")]
    pub overlay: Duration,

    /// LAN-direct attempt
    #[serde(with = "duration_millis")]
    pub lan: Duration,

    /// STUN discovery, offer/answer and hole punching together
    #[serde(with = "duration_millis")]
    pub nat_traversal: Duration,

    /// Relayed attempt
    #[serde(with = "duration_millis")]
    pub relay: Duration,
}

impl Default for CandidateTimeouts {
    fn default() -> Self {
        Self {
            overlay: Duration::from_secs(3),
            lan: Duration::from_secs(3),
            nat_traversal: Duration::from_secs(10),
            relay: Duration::from_secs(15),
        }
    }
}
