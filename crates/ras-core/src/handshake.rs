//! Mutual challenge-response over a [`PeerLink`]
//!
//! ```text
//! client                                   daemon
//!   Hello { session_id, client_nonce }  ->
//!                                       <-  Challenge { daemon_nonce, HMAC(auth, "ras-daemon" | client_nonce | daemon_nonce) }
//!   ChallengeResponse { HMAC(auth, "ras-client" | daemon_nonce | client_nonce) } ->
//!                                       <-  AuthResult { accepted }
//! ```
//!
//! Each side proves possession of the `auth` key and verifies the other's
//! proof before the link is used for anything else. Proofs carry the
//! sender's role and both nonces, so a proof obtained from the daemon on one
//! connection is never a valid client proof on another.

use rand::rngs::OsRng;
use rand::RngCore;
use ras_protocol::{Message, MessageType, AUTH_NONCE_SIZE};
use thiserror::Error;
use tracing::{debug, warn};

use crate::crypto::{mac, DerivedKey};
use crate::error::ConnectionError;
use crate::link::PeerLink;

/// Reason sent when the session id is not ours
pub const REASON_UNKNOWN_SESSION: &str = "unknown session";

/// Reason sent when a proof does not verify
pub const REASON_BAD_PROOF: &str = "authentication failed";

/// Handshake failures
#[derive(Error, Debug)]
pub enum HandshakeError {
    /// Transport failed underneath the handshake
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Peer refused us
    #[error("peer rejected authentication: {reason}")]
    Rejected {
        /// Reason given by the peer
        reason: String,
    },

    /// The daemon does not know our session (pairing was revoked)
    #[error("unknown session")]
    UnknownSession,

    /// Peer's proof did not verify
    #[error("peer proof did not verify")]
    BadProof,

    /// Peer sent something out of sequence
    #[error("unexpected {0:?} during handshake")]
    UnexpectedMessage(MessageType),

    /// Link closed before the handshake finished
    #[error("link closed during handshake")]
    Closed,
}

impl HandshakeError {
    /// Whether the failure means the peers do not share a valid pairing
    pub fn is_authentication_failure(&self) -> bool {
        matches!(
            self,
            HandshakeError::Rejected { .. }
                | HandshakeError::UnknownSession
                | HandshakeError::BadProof
        )
    }
}

const DAEMON_ROLE: &[u8] = b"ras-daemon";
const CLIENT_ROLE: &[u8] = b"ras-client";

fn daemon_proof(
    key: &DerivedKey,
    client_nonce: &[u8; AUTH_NONCE_SIZE],
    daemon_nonce: &[u8; AUTH_NONCE_SIZE],
) -> [u8; mac::TAG_SIZE] {
    mac::compute_parts(key.as_bytes(), &[DAEMON_ROLE, client_nonce, daemon_nonce])
}

fn client_proof(
    key: &DerivedKey,
    client_nonce: &[u8; AUTH_NONCE_SIZE],
    daemon_nonce: &[u8; AUTH_NONCE_SIZE],
) -> [u8; mac::TAG_SIZE] {
    mac::compute_parts(key.as_bytes(), &[CLIENT_ROLE, daemon_nonce, client_nonce])
}

fn fresh_nonce() -> [u8; AUTH_NONCE_SIZE] {
    let mut nonce = [0u8; AUTH_NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

async fn next_message(link: &mut dyn PeerLink) -> Result<Message, HandshakeError> {
    match link.recv().await? {
        Some(Message::Close { reason }) => {
            debug!("Peer closed during handshake: {:?}", reason);
            Err(HandshakeError::Closed)
        }
        Some(message) => Ok(message),
        None => Err(HandshakeError::Closed),
    }
}

fn rejection(reason: Option<String>) -> HandshakeError {
    match reason {
        Some(reason) if reason == REASON_UNKNOWN_SESSION => HandshakeError::UnknownSession,
        Some(reason) => HandshakeError::Rejected { reason },
        None => HandshakeError::Rejected {
            reason: "no reason given".to_string(),
        },
    }
}

/// Client side of the handshake
pub async fn initiate(
    link: &mut dyn PeerLink,
    auth_key: &DerivedKey,
    session_id: &str,
) -> Result<(), HandshakeError> {
    let client_nonce = fresh_nonce();
    link.send(Message::Hello {
        session_id: session_id.to_string(),
        nonce: client_nonce,
    })
    .await?;

    let (daemon_nonce, proof) = match next_message(link).await? {
        Message::Challenge { nonce, proof } => (nonce, proof),
        Message::AuthResult { reason, .. } => return Err(rejection(reason)),
        other => return Err(HandshakeError::UnexpectedMessage(other.message_type())),
    };

    if daemon_nonce == client_nonce
        || !mac::verify_parts(
            auth_key.as_bytes(),
            &[DAEMON_ROLE, &client_nonce, &daemon_nonce],
            &proof,
        )
    {
        warn!("Daemon failed to prove possession of the pairing key");
        let _ = link
            .send(Message::Close {
                reason: Some(REASON_BAD_PROOF.to_string()),
            })
            .await;
        return Err(HandshakeError::BadProof);
    }

    link.send(Message::ChallengeResponse {
        proof: client_proof(auth_key, &client_nonce, &daemon_nonce),
    })
    .await?;

    match next_message(link).await? {
        Message::AuthResult { accepted: true, .. } => Ok(()),
        Message::AuthResult { reason, .. } => Err(rejection(reason)),
        other => Err(HandshakeError::UnexpectedMessage(other.message_type())),
    }
}

/// Daemon side of the handshake
pub async fn respond(
    link: &mut dyn PeerLink,
    auth_key: &DerivedKey,
    expected_session: &str,
) -> Result<(), HandshakeError> {
    let client_nonce = match next_message(link).await? {
        Message::Hello { session_id, nonce } => {
            if session_id != expected_session {
                warn!("Handshake for unknown session {}", session_id);
                reject(link, REASON_UNKNOWN_SESSION).await;
                return Err(HandshakeError::UnknownSession);
            }
            nonce
        }
        other => return Err(HandshakeError::UnexpectedMessage(other.message_type())),
    };

    let daemon_nonce = fresh_nonce();
    link.send(Message::Challenge {
        nonce: daemon_nonce,
        proof: daemon_proof(auth_key, &client_nonce, &daemon_nonce),
    })
    .await?;

    let proof = match next_message(link).await? {
        Message::ChallengeResponse { proof } => proof,
        other => return Err(HandshakeError::UnexpectedMessage(other.message_type())),
    };

    if !mac::verify_parts(
        auth_key.as_bytes(),
        &[CLIENT_ROLE, &daemon_nonce, &client_nonce],
        &proof,
    ) {
        warn!("Client failed to prove possession of the pairing key");
        reject(link, REASON_BAD_PROOF).await;
        return Err(HandshakeError::BadProof);
    }

    link.send(Message::AuthResult {
        accepted: true,
        reason: None,
    })
    .await?;
    Ok(())
}

async fn reject(link: &mut dyn PeerLink, reason: &str) {
    let _ = link
        .send(Message::AuthResult {
            accepted: false,
            reason: Some(reason.to_string()),
        })
        .await;
}
