//! Address-change record carried inside relay push messages
//!
//! On the wire the record is JSON (`{"ip":..,"port":..,"timestamp":..,"nonce":".."}`,
//! nonce hex-encoded) and is always sealed with the relay key before it is
//! posted; see `ras_core::relay` for the sealing side.

use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Size of the replay-protection nonce in a notification
pub const NOTIFICATION_NONCE_SIZE: usize = 16;

/// "The daemon is now reachable at ip:port"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpChangeNotification {
    /// New rendezvous IP
    pub ip: IpAddr,
    /// New rendezvous port
    pub port: u16,
    /// Unix timestamp (seconds) at which the daemon issued the record
    pub timestamp: u64,
    /// Unique per record, used for replay rejection
    #[serde(with = "hex_nonce")]
    pub nonce: [u8; NOTIFICATION_NONCE_SIZE],
}

impl IpChangeNotification {
    /// New rendezvous address as a socket address
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Serialize to the JSON wire form
    pub fn to_json(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse the JSON wire form
    pub fn from_json(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

mod hex_nonce {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    use super::NOTIFICATION_NONCE_SIZE;

    pub fn serialize<S>(nonce: &[u8; NOTIFICATION_NONCE_SIZE], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(nonce))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; NOTIFICATION_NONCE_SIZE], D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        let mut nonce = [0u8; NOTIFICATION_NONCE_SIZE];
        hex::decode_to_slice(&text, &mut nonce).map_err(D::Error::custom)?;
        Ok(nonce)
    }
}
