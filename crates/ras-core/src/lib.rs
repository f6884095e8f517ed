//! ras-core: Core plumbing for RAS pairing and connection resilience
//!
//! This crate provides the pieces shared by the mobile client and the host
//! daemon: key derivation and authenticated encryption, configuration,
//! error types, the nonce cache, peer links and the mutual-authentication
//! handshake, the push-relay client, STUN, hole punching and overlay
//! detection.

pub mod config;
pub mod crypto;
pub mod error;
pub mod handshake;
pub mod link;
pub mod netinfo;
pub mod nonce_cache;
pub mod overlay;
pub mod punch;
pub mod relay;
pub mod signaling;
pub mod stun;
pub mod time;
pub mod types;

pub use crypto::{DerivedKey, KeyPurpose, SessionKeys};
pub use error::{ConfigError, ConnectionError, CryptoError};
pub use link::{BoxedLink, PeerLink};
pub use nonce_cache::NonceCache;
pub use types::{ConnectionPath, FailureReason, PairingState, PathType};
