//! Daemon configuration

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use super::client::{DEFAULT_RELAY_SERVER, DEFAULT_STUN_SERVERS};
use super::serde_utils::duration_secs;

/// Default LAN signaling port
pub const DEFAULT_SIGNALING_PORT: u16 = 8821;

/// Default transport port
pub const DEFAULT_TRANSPORT_PORT: u16 = 8822;

/// Configuration for the host-side daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Address of the HTTP signaling server (the rendezvous in the pairing payload)
    pub signaling_bind: SocketAddr,

    /// Address of the TCP transport listener
    pub transport_bind: SocketAddr,

    /// Base URL of the push relay
    pub relay_server: String,

    /// STUN servers (`host:port`) for public address discovery
    pub stun_servers: Vec<String>,

    /// How often the local address is checked for changes
    #[serde(with = "duration_secs")]
    pub ip_poll_interval: Duration,

    /// Bound on the responder side of the challenge-response
    #[serde(with = "duration_secs")]
    pub handshake_timeout: Duration,

    /// Accepted clock skew for signed signaling requests, in seconds
    pub timestamp_tolerance_secs: u64,

    /// Interval between keepalive pings on an established link
    #[serde(with = "duration_secs")]
    pub keepalive_interval: Duration,

    /// Where the pairing record is stored
    pub pairing_path: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            signaling_bind: SocketAddr::from(([0, 0, 0, 0], DEFAULT_SIGNALING_PORT)),
            transport_bind: SocketAddr::from(([0, 0, 0, 0], DEFAULT_TRANSPORT_PORT)),
            relay_server: DEFAULT_RELAY_SERVER.to_string(),
            stun_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            ip_poll_interval: Duration::from_secs(15),
            handshake_timeout: Duration::from_secs(10),
            timestamp_tolerance_secs: 300,
            keepalive_interval: Duration::from_secs(30),
            pairing_path: super::default_config_dir().join("pairing.toml"),
        }
    }
}
