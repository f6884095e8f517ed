//! Pairing state machine
//!
//! Drives one pairing from scanned code to authenticated channel:
//!
//! ```text
//! Idle -> Scanning -> Connecting -> Authenticating -> Connected
//!            \            \              \
//!             +------------+--------------+--> Failed(reason)
//! ```
//!
//! `Failed` and `Connected` may go back to `Connecting` through
//! [`PairingStateMachine::retry`] or [`PairingStateMachine::reconnect_to`],
//! and back to `Scanning` when a new code is paired.
//! Progress is published on a `watch` channel.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ras_core::config::ClientConfig;
use ras_core::handshake::{self, HandshakeError};
use ras_core::relay::RelayClient;
use ras_core::signaling::TIMESTAMP_TOLERANCE_SECS;
use ras_core::{
    BoxedLink, ConnectionError, ConnectionPath, CryptoError, FailureReason, PairingState,
    SessionKeys,
};
use ras_protocol::{PairingPayload, PayloadError};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::transport::{EstablishedPath, ResolveError, TransportContext, TransportResolver};

/// Default bound on the challenge-response exchange
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Why pairing or reconnecting failed
#[derive(Error, Debug)]
pub enum PairingError {
    /// The scanned code is not a pairing payload
    #[error("invalid pairing code: {0}")]
    InvalidPayload(#[from] PayloadError),

    /// The daemon no longer knows this pairing
    #[error("device unpaired")]
    Unpaired,

    /// No transport reached the daemon
    #[error("daemon unreachable: {0}")]
    Unreachable(#[source] ResolveError),

    /// Every transport attempt timed out
    #[error("timed out reaching daemon: {0}")]
    ConnectTimeout(#[source] ResolveError),

    /// The peers do not share a valid pairing
    #[error("authentication failed: {0}")]
    Authentication(#[source] HandshakeError),

    /// The link broke during the handshake
    #[error("handshake failed: {0}")]
    Handshake(#[source] HandshakeError),

    /// The handshake did not finish in time
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// Keys could not be derived from the payload
    #[error("key derivation failed: {0}")]
    Crypto(#[from] CryptoError),

    /// `retry` called with nothing to retry
    #[error("nothing to retry from state {0}")]
    NotRetryable(PairingState),
}

impl PairingError {
    /// The `Failed` reason this error publishes, if it publishes one
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            PairingError::InvalidPayload(_) | PairingError::Crypto(_) => {
                Some(FailureReason::PayloadParseError)
            }
            PairingError::Unpaired | PairingError::Authentication(_) => {
                Some(FailureReason::AuthenticationFailed)
            }
            PairingError::Unreachable(_) | PairingError::Handshake(_) => {
                Some(FailureReason::ConnectionFailed)
            }
            PairingError::ConnectTimeout(_) | PairingError::HandshakeTimeout(_) => {
                Some(FailureReason::Timeout)
            }
            PairingError::NotRetryable(_) => None,
        }
    }

    fn from_resolve(err: ResolveError) -> Self {
        if err.daemon_forgot_pairing() {
            PairingError::Unpaired
        } else if err.all_timed_out() {
            PairingError::ConnectTimeout(err)
        } else {
            PairingError::Unreachable(err)
        }
    }

    fn from_handshake(err: HandshakeError) -> Self {
        match err {
            HandshakeError::UnknownSession => PairingError::Unpaired,
            e if e.is_authentication_failure() => PairingError::Authentication(e),
            e => PairingError::Handshake(e),
        }
    }
}

/// Mutually authenticated link to the daemon
pub struct AuthenticatedChannel {
    /// Transport in use
    pub path: ConnectionPath,
    /// The link, ready for `Data` frames
    pub link: BoxedLink,
    /// Payload the channel was established with
    pub payload: PairingPayload,
    /// Keys derived from the payload
    pub keys: Arc<SessionKeys>,
}

impl fmt::Debug for AuthenticatedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticatedChannel")
            .field("path", &self.path)
            .field("session_id", &self.payload.session_id())
            .finish_non_exhaustive()
    }
}

/// Runs pairing attempts and publishes their progress
pub struct PairingStateMachine {
    state: watch::Sender<PairingState>,
    resolver: TransportResolver,
    relay: RelayClient,
    stun_servers: Vec<String>,
    handshake_timeout: Duration,
    timestamp_tolerance_secs: u64,
    payload: Mutex<Option<PairingPayload>>,
    // one attempt at a time
    busy: tokio::sync::Mutex<()>,
}

impl PairingStateMachine {
    /// State machine over `resolver`, using `relay` for relay-backed paths
    pub fn new(resolver: TransportResolver, relay: RelayClient) -> Self {
        let (state, _) = watch::channel(PairingState::Idle);
        Self {
            state,
            resolver,
            relay,
            stun_servers: Vec::new(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            timestamp_tolerance_secs: TIMESTAMP_TOLERANCE_SECS,
            payload: Mutex::new(None),
            busy: tokio::sync::Mutex::new(()),
        }
    }

    /// State machine with the standard resolver configured from `config`
    pub fn from_config(config: &ClientConfig) -> Result<Self, ConnectionError> {
        let relay = RelayClient::new(config.relay_server.clone())?;
        Ok(Self::new(TransportResolver::standard(config.timeouts.clone()), relay)
            .with_stun_servers(config.stun_servers.clone())
            .with_handshake_timeout(config.handshake_timeout)
            .with_timestamp_tolerance(config.timestamp_tolerance_secs))
    }

    pub fn with_stun_servers(mut self, servers: Vec<String>) -> Self {
        self.stun_servers = servers;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_timestamp_tolerance(mut self, secs: u64) -> Self {
        self.timestamp_tolerance_secs = secs;
        self
    }

    /// Current state
    pub fn state(&self) -> PairingState {
        *self.state.borrow()
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<PairingState> {
        self.state.subscribe()
    }

    /// Payload of the last successfully parsed code
    pub fn payload(&self) -> Option<PairingPayload> {
        self.stored_payload().clone()
    }

    fn stored_payload(&self) -> std::sync::MutexGuard<'_, Option<PairingPayload>> {
        self.payload.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn transition(&self, next: PairingState) {
        let current = self.state();
        debug_assert!(
            current.can_transition_to(next),
            "invalid pairing transition {} -> {}",
            current,
            next
        );
        info!("Pairing state: {} -> {}", current, next);
        self.state.send_replace(next);
    }

    fn fail(&self, err: PairingError) -> PairingError {
        if let Some(reason) = err.failure_reason() {
            self.transition(PairingState::Failed(reason));
        }
        err
    }

    /// A previous `pair()` whose future was dropped can leave the machine
    /// mid-flight; that attempt is abandoned and the machine goes back to
    /// `Idle` before scanning.
    fn begin_scan(&self) {
        let current = self.state();
        if !current.can_transition_to(PairingState::Scanning) {
            info!("Pairing state: {} -> {} (abandoned)", current, PairingState::Idle);
            self.state.send_replace(PairingState::Idle);
        }
        self.transition(PairingState::Scanning);
    }

    /// Pair using scanned QR text.
    ///
    /// Replaces any earlier pairing, whatever state it reached.
    pub async fn pair(&self, qr_text: &str) -> Result<AuthenticatedChannel, PairingError> {
        let _busy = self.busy.lock().await;

        self.begin_scan();

        let payload = match PairingPayload::from_qr_text(qr_text) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Rejected pairing code: {}", e);
                *self.stored_payload() = None;
                return Err(self.fail(e.into()));
            }
        };
        debug!("Parsed pairing payload for session {}", payload.session_id());

        self.connect(payload).await
    }

    fn retry_payload(&self) -> Result<PairingPayload, PairingError> {
        let state = self.state();
        let retryable = match state {
            PairingState::Connected => true,
            PairingState::Failed(reason) => reason.is_retryable(),
            _ => false,
        };
        match self.payload() {
            Some(payload) if retryable => Ok(payload),
            _ => Err(PairingError::NotRetryable(state)),
        }
    }

    /// Re-run the connection with the stored payload.
    ///
    /// Allowed from `Connected` and from a retryable `Failed`.
    pub async fn retry(&self) -> Result<AuthenticatedChannel, PairingError> {
        let _busy = self.busy.lock().await;
        let payload = self.retry_payload()?;
        self.connect(payload).await
    }

    /// Reconnect to the daemon at a new signaling address
    pub async fn reconnect_to(
        &self,
        rendezvous: SocketAddr,
    ) -> Result<AuthenticatedChannel, PairingError> {
        let _busy = self.busy.lock().await;
        let payload = self.retry_payload()?.with_rendezvous(rendezvous);
        self.connect(payload).await
    }

    async fn connect(&self, payload: PairingPayload) -> Result<AuthenticatedChannel, PairingError> {
        self.transition(PairingState::Connecting);

        let keys = match SessionKeys::derive(payload.secret()) {
            Ok(keys) => Arc::new(keys),
            Err(e) => return Err(self.fail(e.into())),
        };
        *self.stored_payload() = Some(payload.clone());

        let ctx = TransportContext {
            payload: payload.clone(),
            keys: keys.clone(),
            relay: self.relay.clone(),
            stun_servers: self.stun_servers.clone(),
            timestamp_tolerance_secs: self.timestamp_tolerance_secs,
        };

        let EstablishedPath { path, mut link } = match self.resolver.resolve(&ctx).await {
            Ok(established) => established,
            Err(e) => return Err(self.fail(PairingError::from_resolve(e))),
        };

        self.transition(PairingState::Authenticating);
        let outcome = tokio::time::timeout(
            self.handshake_timeout,
            handshake::initiate(link.as_mut(), &keys.auth, payload.session_id()),
        )
        .await;

        let err = match outcome {
            Ok(Ok(())) => {
                self.transition(PairingState::Connected);
                return Ok(AuthenticatedChannel {
                    path,
                    link,
                    payload,
                    keys,
                });
            }
            Ok(Err(e)) => PairingError::from_handshake(e),
            Err(_) => PairingError::HandshakeTimeout(self.handshake_timeout),
        };

        // the link must be gone before anyone sees Failed
        if let Err(e) = link.close().await {
            debug!("Closing link after failed handshake: {}", e);
        }
        drop(link);
        Err(self.fail(err))
    }
}
