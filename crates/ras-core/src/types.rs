//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

/// Kind of transport a connection runs over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathType {
    /// Direct connection over the private overlay network
    OverlayDirect,
    /// Direct connection on the local network
    LanDirect,
    /// Direct UDP connection after NAT hole punching
    NatTraversalDirect,
    /// Every frame goes through the push relay
    Relayed,
}

impl PathType {
    /// Order in which the resolver tries paths
    pub const PRIORITY_ORDER: [PathType; 4] = [
        PathType::OverlayDirect,
        PathType::LanDirect,
        PathType::NatTraversalDirect,
        PathType::Relayed,
    ];

    /// Short label for status displays
    pub fn badge(&self) -> &'static str {
        match self {
            PathType::OverlayDirect => "Tailscale",
            PathType::LanDirect => "LAN",
            PathType::NatTraversalDirect => "P2P",
            PathType::Relayed => "Relay",
        }
    }

    /// Whether the path has a directly addressable remote endpoint
    pub fn has_remote_address(&self) -> bool {
        !matches!(self, PathType::Relayed)
    }
}

impl fmt::Display for PathType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathType::OverlayDirect => write!(f, "overlay-direct"),
            PathType::LanDirect => write!(f, "lan-direct"),
            PathType::NatTraversalDirect => write!(f, "nat-traversal"),
            PathType::Relayed => write!(f, "relayed"),
        }
    }
}

/// An established transport.
///
/// Immutable: a reconnection produces a new value that replaces the old one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionPath {
    path_type: PathType,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    #[serde(with = "crate::config::serde_utils::duration_millis")]
    latency: Duration,
    label: String,
    #[serde(skip)]
    established_at: SystemTime,
}

impl ConnectionPath {
    /// Describe a freshly established path.
    ///
    /// `remote` is dropped for [`PathType::Relayed`], which has no
    /// meaningful peer address.
    pub fn new(
        path_type: PathType,
        local: Option<SocketAddr>,
        remote: Option<SocketAddr>,
        latency: Duration,
    ) -> Self {
        let remote = remote.filter(|_| path_type.has_remote_address());
        let label = match remote {
            Some(addr) => format!("{} {}", path_type.badge(), addr),
            None => path_type.badge().to_string(),
        };

        Self {
            path_type,
            local,
            remote,
            latency,
            label,
            established_at: SystemTime::now(),
        }
    }

    /// Transport kind
    pub fn path_type(&self) -> PathType {
        self.path_type
    }

    /// Local socket address, when the transport has one
    pub fn local(&self) -> Option<SocketAddr> {
        self.local
    }

    /// Remote socket address; always `None` for relayed paths
    pub fn remote(&self) -> Option<SocketAddr> {
        self.remote
    }

    /// Time taken to establish and authenticate
    pub fn latency(&self) -> Duration {
        self.latency
    }

    /// Human-readable description
    pub fn label(&self) -> &str {
        &self.label
    }

    /// When the path was established
    pub fn established_at(&self) -> SystemTime {
        self.established_at
    }
}

impl fmt::Display for ConnectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} ms)", self.label, self.latency.as_millis())
    }
}

/// Why pairing failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The scanned payload was malformed
    PayloadParseError,
    /// No transport could be established
    ConnectionFailed,
    /// Mutual authentication did not succeed
    AuthenticationFailed,
    /// A bounded wait expired
    Timeout,
}

impl FailureReason {
    /// Whether retrying with the same payload can succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureReason::PayloadParseError)
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::PayloadParseError => write!(f, "invalid pairing code"),
            FailureReason::ConnectionFailed => write!(f, "daemon unreachable"),
            FailureReason::AuthenticationFailed => write!(f, "authentication failed"),
            FailureReason::Timeout => write!(f, "timed out"),
        }
    }
}

/// Pairing progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum PairingState {
    /// Nothing started
    Idle,
    /// Reading the pairing payload
    Scanning,
    /// Resolving a transport
    Connecting,
    /// Running the mutual challenge-response
    Authenticating,
    /// Authenticated channel is up
    Connected,
    /// Terminal until retried
    Failed(FailureReason),
}

impl PairingState {
    /// Whether moving from `self` to `next` is allowed.
    ///
    /// Progress is forward-only; `Failed` and `Connected` may re-enter
    /// `Connecting` on retry.
    pub fn can_transition_to(&self, next: PairingState) -> bool {
        use PairingState::*;

        match (self, next) {
            (Idle, Scanning) => true,
            (Scanning, Connecting) => true,
            (Connecting, Authenticating) => true,
            (Authenticating, Connected) => true,
            (Scanning | Connecting | Authenticating, Failed(_)) => true,
            (Failed(_) | Connected, Connecting) => true,
            // scanning a new code starts over
            (Failed(_) | Connected, Scanning) => true,
            _ => false,
        }
    }

    /// Whether the state is `Failed`
    pub fn is_failed(&self) -> bool {
        matches!(self, PairingState::Failed(_))
    }
}

impl fmt::Display for PairingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PairingState::Idle => write!(f, "idle"),
            PairingState::Scanning => write!(f, "scanning"),
            PairingState::Connecting => write!(f, "connecting"),
            PairingState::Authenticating => write!(f, "authenticating"),
            PairingState::Connected => write!(f, "connected"),
            PairingState::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}
