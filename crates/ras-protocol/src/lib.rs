//! ras-protocol: Wire formats for RAS pairing and connection resilience
//!
//! This crate defines the byte-level formats shared by the mobile client and
//! the host daemon: the out-of-band pairing record, the framed handshake
//! protocol, the LAN signaling bodies and the relay push records.

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;
pub mod notification;
pub mod payload;
pub mod signaling;

pub use codec::{decode_message, encode_message, FrameCodec};
pub use error::{PayloadError, ProtocolError};
pub use frame::{FrameHeader, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use message::{Message, MessageType, AUTH_NONCE_SIZE, PROTOCOL_VERSION};
pub use notification::{IpChangeNotification, NOTIFICATION_NONCE_SIZE};
pub use payload::{derive_relay_topic, MasterSecret, PairingPayload, MASTER_SECRET_SIZE};
pub use signaling::{SignalEnvelope, SignalRequest, SignalResponse};
