//! Pairing bootstrap record
//!
//! The daemon encodes this record into a QR code; the mobile client scans it
//! and parses it here. All validation happens before the embedded secret is
//! handed to anything that derives keys from it.
//!
//! Binary layout (integers big-endian):
//!
//! ```text
//! u8        version (= 1)
//! addr      rendezvous        u8 family (4|6), 4|16 byte ip, u16 port
//! [u8; 32]  master secret
//! u8 + ..   session id        1..=64 printable ASCII bytes
//! u8 + ..   relay topic       1..=64 printable ASCII bytes
//! u8        flags             bit0 overlay present, bit1 public present
//! addr      overlay address   if bit0
//! addr      public address    if bit1
//! ```

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::{Buf, BufMut, BytesMut};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::PayloadError;

/// Current pairing record version
pub const PAYLOAD_VERSION: u8 = 1;

/// Length of the shared master secret
pub const MASTER_SECRET_SIZE: usize = 32;

/// Maximum length of the session id and relay topic fields
const MAX_LABEL_LEN: usize = 64;

/// Number of hex characters of the secret digest used in the relay topic
const TOPIC_HASH_CHARS: usize = 12;

const FLAG_OVERLAY: u8 = 0b0000_0001;
const FLAG_PUBLIC: u8 = 0b0000_0010;

/// Shared secret exchanged out-of-band during pairing
///
/// Never printed: `Debug` is redacted and the bytes are wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterSecret([u8; MASTER_SECRET_SIZE]);

impl MasterSecret {
    /// Wrap raw secret bytes
    pub fn from_bytes(bytes: [u8; MASTER_SECRET_SIZE]) -> Self {
        Self(bytes)
    }

    /// Borrow the raw bytes for key derivation
    pub fn expose_secret(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterSecret(<redacted>)")
    }
}

impl PartialEq for MasterSecret {
    fn eq(&self, other: &Self) -> bool {
        self.0
            .iter()
            .zip(other.0.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl Eq for MasterSecret {}

/// Relay topic for a pairing secret: `"ras-" + hex(SHA256(secret))[0..12]`
pub fn derive_relay_topic(secret: &MasterSecret) -> String {
    let digest = Sha256::digest(secret.expose_secret());
    let hex = hex::encode(digest);
    format!("ras-{}", &hex[..TOPIC_HASH_CHARS])
}

/// Parsed pairing bootstrap record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingPayload {
    version: u8,
    rendezvous: SocketAddr,
    secret: MasterSecret,
    session_id: String,
    relay_topic: String,
    overlay_address: Option<SocketAddr>,
    public_address: Option<SocketAddr>,
}

impl PairingPayload {
    /// Build a new record; the relay topic is derived from the secret
    pub fn new(
        rendezvous: SocketAddr,
        secret: MasterSecret,
        session_id: impl Into<String>,
    ) -> Result<Self, PayloadError> {
        let session_id = session_id.into();
        validate_label(&session_id).map_err(|_| PayloadError::InvalidSessionId)?;
        if rendezvous.port() == 0 {
            return Err(PayloadError::ZeroPort {
                field: "rendezvous",
            });
        }

        let relay_topic = derive_relay_topic(&secret);
        Ok(Self {
            version: PAYLOAD_VERSION,
            rendezvous,
            secret,
            session_id,
            relay_topic,
            overlay_address: None,
            public_address: None,
        })
    }

    /// Attach the daemon's overlay-network address
    pub fn with_overlay_address(mut self, addr: SocketAddr) -> Self {
        self.overlay_address = Some(addr);
        self
    }

    /// Attach the daemon's public (reflexive) address
    pub fn with_public_address(mut self, addr: SocketAddr) -> Self {
        self.public_address = Some(addr);
        self
    }

    /// Record version
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Rendezvous (LAN signaling) address
    pub fn rendezvous(&self) -> SocketAddr {
        self.rendezvous
    }

    /// Shared master secret
    pub fn secret(&self) -> &MasterSecret {
        &self.secret
    }

    /// Session identifier
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Relay topic used for push notifications
    pub fn relay_topic(&self) -> &str {
        &self.relay_topic
    }

    /// Overlay-network address, if the daemon has one
    pub fn overlay_address(&self) -> Option<SocketAddr> {
        self.overlay_address
    }

    /// Public address, if the daemon discovered one
    pub fn public_address(&self) -> Option<SocketAddr> {
        self.public_address
    }

    /// Same record with a different rendezvous address.
    ///
    /// Used after an address-change notification: everything else about the
    /// pairing stays the same.
    pub fn with_rendezvous(&self, rendezvous: SocketAddr) -> Self {
        let mut updated = self.clone();
        updated.rendezvous = rendezvous;
        updated
    }

    /// Encode into the binary record
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(128);
        buf.put_u8(self.version);
        put_addr(&mut buf, self.rendezvous);
        buf.put_slice(self.secret.expose_secret());
        put_label(&mut buf, &self.session_id);
        put_label(&mut buf, &self.relay_topic);

        let mut flags = 0u8;
        if self.overlay_address.is_some() {
            flags |= FLAG_OVERLAY;
        }
        if self.public_address.is_some() {
            flags |= FLAG_PUBLIC;
        }
        buf.put_u8(flags);
        if let Some(addr) = self.overlay_address {
            put_addr(&mut buf, addr);
        }
        if let Some(addr) = self.public_address {
            put_addr(&mut buf, addr);
        }
        buf.to_vec()
    }

    /// Encode as QR text (standard base64)
    pub fn to_qr_text(&self) -> String {
        BASE64.encode(self.encode())
    }

    /// Parse QR text (standard base64, surrounding whitespace ignored)
    pub fn from_qr_text(text: &str) -> Result<Self, PayloadError> {
        let bytes = BASE64
            .decode(text.trim())
            .map_err(|_| PayloadError::InvalidEncoding)?;
        Self::parse(&bytes)
    }

    /// Parse and validate the binary record
    pub fn parse(bytes: &[u8]) -> Result<Self, PayloadError> {
        let mut reader = Reader { buf: bytes };

        let version = reader.u8("version")?;
        if version != PAYLOAD_VERSION {
            return Err(PayloadError::UnsupportedVersion(version));
        }

        let rendezvous = reader.addr("rendezvous")?;

        let mut secret_bytes = [0u8; MASTER_SECRET_SIZE];
        secret_bytes.copy_from_slice(reader.bytes(MASTER_SECRET_SIZE, "master secret")?);
        let secret = MasterSecret::from_bytes(secret_bytes);
        secret_bytes.zeroize();

        let session_id = reader
            .label("session id")?
            .ok_or(PayloadError::InvalidSessionId)?;
        let relay_topic = reader
            .label("relay topic")?
            .ok_or(PayloadError::InvalidTopic)?;

        let flags = reader.u8("flags")?;
        if flags & !(FLAG_OVERLAY | FLAG_PUBLIC) != 0 {
            return Err(PayloadError::UnknownFlags(flags));
        }
        let overlay_address = if flags & FLAG_OVERLAY != 0 {
            Some(reader.addr("overlay")?)
        } else {
            None
        };
        let public_address = if flags & FLAG_PUBLIC != 0 {
            Some(reader.addr("public")?)
        } else {
            None
        };

        if !reader.buf.is_empty() {
            return Err(PayloadError::TrailingBytes(reader.buf.len()));
        }

        if relay_topic != derive_relay_topic(&secret) {
            return Err(PayloadError::TopicMismatch);
        }

        Ok(Self {
            version,
            rendezvous,
            secret,
            session_id,
            relay_topic,
            overlay_address,
            public_address,
        })
    }
}

fn validate_label(value: &str) -> Result<(), ()> {
    if value.is_empty() || value.len() > MAX_LABEL_LEN {
        return Err(());
    }
    if !value.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(());
    }
    Ok(())
}

fn put_label(buf: &mut BytesMut, value: &str) {
    buf.put_u8(value.len() as u8);
    buf.put_slice(value.as_bytes());
}

fn put_addr(buf: &mut BytesMut, addr: SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(4);
            buf.put_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.put_u8(6);
            buf.put_slice(&ip.octets());
        }
    }
    buf.put_u16(addr.port());
}

/// Bounds-checked cursor over the raw record
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn u8(&mut self, field: &'static str) -> Result<u8, PayloadError> {
        if self.buf.remaining() < 1 {
            return Err(PayloadError::Truncated { field });
        }
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self, field: &'static str) -> Result<u16, PayloadError> {
        if self.buf.remaining() < 2 {
            return Err(PayloadError::Truncated { field });
        }
        Ok(self.buf.get_u16())
    }

    fn bytes(&mut self, len: usize, field: &'static str) -> Result<&'a [u8], PayloadError> {
        if self.buf.len() < len {
            return Err(PayloadError::Truncated { field });
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    /// Length-prefixed printable label; `None` if it fails validation
    fn label(&mut self, field: &'static str) -> Result<Option<String>, PayloadError> {
        let len = self.u8(field)? as usize;
        let raw = self.bytes(len, field)?;
        let Ok(value) = std::str::from_utf8(raw) else {
            return Ok(None);
        };
        Ok(validate_label(value).ok().map(|_| value.to_string()))
    }

    fn addr(&mut self, field: &'static str) -> Result<SocketAddr, PayloadError> {
        let family = self.u8(field)?;
        let ip = match family {
            4 => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(self.bytes(4, field)?);
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            6 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(self.bytes(16, field)?);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            other => return Err(PayloadError::InvalidAddressFamily(other)),
        };
        let port = self.u16(field)?;
        if port == 0 {
            return Err(PayloadError::ZeroPort { field });
        }
        Ok(SocketAddr::new(ip, port))
    }
}
