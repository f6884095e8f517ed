//! Frame header encoding/decoding
//!
//! The frame format uses an 8-byte header:
//! - magic: 2 bytes (`b"RS"`)
//! - version: 1 byte
//! - message_type: 1 byte
//! - payload_length: 4 bytes (u32, big-endian)

use bytes::{Buf, BufMut, BytesMut};

use crate::error::ProtocolError;
use crate::message::{MessageType, PROTOCOL_VERSION};

/// Size of the frame header in bytes
pub const HEADER_SIZE: usize = 8;

/// Maximum payload size (1 MiB; the control channel never carries bulk data)
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Magic bytes at the start of every frame
pub const FRAME_MAGIC: [u8; 2] = *b"RS";

/// Frame header containing type and length information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Type of message in the payload
    pub message_type: MessageType,
    /// Length of the payload in bytes
    pub payload_length: u32,
}

impl FrameHeader {
    /// Create a new frame header
    pub fn new(message_type: MessageType, payload_length: u32) -> Self {
        Self {
            message_type,
            payload_length,
        }
    }

    /// Encode the header into a byte buffer
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE);
        dst.put_slice(&FRAME_MAGIC);
        dst.put_u8(PROTOCOL_VERSION);
        dst.put_u8(self.message_type.as_u8());
        dst.put_u32(self.payload_length);
    }

    /// Decode a header from a byte buffer
    ///
    /// Returns None if there aren't enough bytes in the buffer.
    /// Returns Err if the header is invalid (bad magic, version or type).
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        // Validate everything before consuming so a bad header leaves the buffer intact
        if src[0..2] != FRAME_MAGIC {
            return Err(ProtocolError::InvalidHeader);
        }
        if src[2] != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(src[2]));
        }
        let msg_type_byte = src[3];
        let message_type = MessageType::from_u8(msg_type_byte)
            .ok_or(ProtocolError::UnknownMessageType(msg_type_byte))?;

        src.advance(4);
        let payload_length = src.get_u32();

        Ok(Some(Self {
            message_type,
            payload_length,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = FrameHeader::new(MessageType::Data, 12345);

        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        header.encode(&mut buf);

        assert_eq!(buf.len(), HEADER_SIZE);

        let decoded = FrameHeader::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_insufficient_bytes() {
        let mut buf = BytesMut::from(&[b'R', b'S', 1, 1][..]);
        let result = FrameHeader::decode(&mut buf).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_bad_magic() {
        let mut buf = BytesMut::from(&[b'X', b'X', 1, 1, 0, 0, 0, 0][..]);
        assert!(matches!(
            FrameHeader::decode(&mut buf),
            Err(ProtocolError::InvalidHeader)
        ));
    }

    #[test]
    fn test_unsupported_version() {
        let mut buf = BytesMut::from(&[b'R', b'S', 9, 1, 0, 0, 0, 0][..]);
        assert!(matches!(
            FrameHeader::decode(&mut buf),
            Err(ProtocolError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn test_unknown_message_type() {
        let mut buf = BytesMut::from(&[b'R', b'S', 1, 0xFE, 0, 0, 0, 10][..]);
        let result = FrameHeader::decode(&mut buf);
        assert!(matches!(
            result,
            Err(ProtocolError::UnknownMessageType(0xFE))
        ));
    }
}
