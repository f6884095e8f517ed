//! Transport selection
//!
//! Paths are tried in a fixed priority order (overlay, LAN, NAT traversal,
//! relay); the first one that yields a link wins. Each attempt is bounded by
//! its own timeout and a failure simply falls through to the next path.

pub mod direct;
pub mod nat;
pub mod relayed;
mod resolver;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ras_core::relay::seal::open_envelope;
use ras_core::relay::{EventKind, RelayClient, RelaySubscription};
use ras_core::{BoxedLink, ConnectionError, ConnectionPath, DerivedKey, PathType, SessionKeys};
use ras_protocol::{PairingPayload, SignalEnvelope};
use thiserror::Error;
use tracing::debug;

pub use direct::DirectCandidate;
pub use nat::NatCandidate;
pub use relayed::RelayedCandidate;
pub use resolver::TransportResolver;

/// Everything a candidate needs to reach the daemon
#[derive(Debug, Clone)]
pub struct TransportContext {
    /// Parsed pairing payload
    pub payload: PairingPayload,
    /// Keys derived from the payload's secret
    pub keys: Arc<SessionKeys>,
    /// Push relay client
    pub relay: RelayClient,
    /// STUN servers for reflexive discovery
    pub stun_servers: Vec<String>,
    /// Accepted clock skew for signed signaling, in seconds
    pub timestamp_tolerance_secs: u64,
}

/// A link that is up but not yet authenticated
pub struct EstablishedPath {
    /// Description of the transport
    pub path: ConnectionPath,
    /// The link itself
    pub link: BoxedLink,
}

impl fmt::Debug for EstablishedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EstablishedPath")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Why one transport candidate failed
#[derive(Error, Debug)]
pub enum CandidateError {
    /// The attempt exceeded its timeout
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Nothing answered
    #[error("unreachable: {0}")]
    Unreachable(String),

    /// The daemon answered but refused the signaling exchange
    #[error("signaling rejected: {0}")]
    Rejected(String),

    /// The daemon does not know this pairing
    #[error("unknown session")]
    UnknownSession,

    /// A signed or sealed reply did not verify
    #[error("peer failed verification: {0}")]
    Verification(String),

    /// Lower-level transport failure
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

impl CandidateError {
    /// Whether the failure was a timeout
    pub fn is_timeout(&self) -> bool {
        match self {
            CandidateError::Timeout(_) => true,
            CandidateError::Connection(e) => e.is_timeout(),
            _ => false,
        }
    }
}

/// One failed attempt
#[derive(Debug)]
pub struct AttemptFailure {
    /// Path that was tried
    pub path_type: PathType,
    /// How it failed
    pub error: CandidateError,
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path_type, self.error)
    }
}

/// Every candidate failed
#[derive(Error, Debug)]
pub enum ResolveError {
    /// Attempts in the order they were made
    #[error("all transport paths failed ({})", summarize(.attempts))]
    ConnectionFailed {
        /// One entry per attempted candidate
        attempts: Vec<AttemptFailure>,
    },
}

fn summarize(attempts: &[AttemptFailure]) -> String {
    if attempts.is_empty() {
        return "no applicable path".to_string();
    }
    attempts
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl ResolveError {
    /// Failed attempts, in priority order
    pub fn attempts(&self) -> &[AttemptFailure] {
        match self {
            ResolveError::ConnectionFailed { attempts } => attempts,
        }
    }

    /// Whether every attempt ended in a timeout
    pub fn all_timed_out(&self) -> bool {
        let attempts = self.attempts();
        !attempts.is_empty() && attempts.iter().all(|a| a.error.is_timeout())
    }

    /// Whether the daemon said it does not know this pairing
    pub fn daemon_forgot_pairing(&self) -> bool {
        self.attempts()
            .iter()
            .any(|a| matches!(a.error, CandidateError::UnknownSession))
    }
}

/// One way of reaching the daemon
#[async_trait]
pub trait PathCandidate: Send + Sync {
    /// Which path this candidate establishes
    fn path_type(&self) -> PathType;

    /// Whether the candidate can run at all with this context
    fn is_applicable(&self, _ctx: &TransportContext) -> bool {
        true
    }

    /// Try to open a link. Cancelled by the resolver on timeout.
    async fn attempt(&self, ctx: &TransportContext) -> Result<BoxedLink, CandidateError>;
}

/// Wait on a downstream subscription for the envelope `select` picks out.
///
/// Envelopes that fail to open or do not match are skipped.
pub(crate) async fn wait_for_envelope<T>(
    subscription: &mut RelaySubscription,
    key: &DerivedKey,
    mut select: impl FnMut(SignalEnvelope) -> Option<T> + Send,
) -> Result<T, CandidateError> {
    loop {
        let event = subscription
            .next_event()
            .await?
            .ok_or_else(|| CandidateError::Unreachable("relay subscription ended".to_string()))?;

        if event.kind() != EventKind::Message {
            continue;
        }
        let Some(text) = event.message else {
            continue;
        };

        match open_envelope(key, &text) {
            Ok(envelope) => {
                if let Some(found) = select(envelope) {
                    return Ok(found);
                }
            }
            Err(e) => debug!("Ignoring relay signaling message: {}", e),
        }
    }
}
