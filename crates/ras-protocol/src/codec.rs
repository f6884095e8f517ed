//! Tokio codec for framed protocol messages

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::frame::{FrameHeader, HEADER_SIZE, MAX_PAYLOAD_SIZE};
use crate::message::Message;

/// Codec for encoding/decoding protocol frames
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// Current header being decoded (if any)
    pending_header: Option<FrameHeader>,
}

impl FrameCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self {
            pending_header: None,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Try to decode header if we don't have one
        let header = match self.pending_header.take() {
            Some(h) => h,
            None => match FrameHeader::decode(src)? {
                Some(h) => h,
                None => return Ok(None), // Need more data
            },
        };

        let payload_len = header.payload_length as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        if src.len() < payload_len {
            // Save header and wait for more data
            src.reserve(payload_len - src.len());
            self.pending_header = Some(header);
            return Ok(None);
        }

        let payload_bytes = src.split_to(payload_len).freeze();
        let message: Message = bincode::deserialize(&payload_bytes)?;

        // The header type must agree with the payload
        if message.message_type() != header.message_type {
            return Err(ProtocolError::UnknownMessageType(
                header.message_type.as_u8(),
            ));
        }

        Ok(Some(message))
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = bincode::serialize(&message)?;
        let payload_len = payload.len();

        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let header = FrameHeader::new(message.message_type(), payload_len as u32);
        header.encode(dst);
        dst.extend_from_slice(&payload);

        Ok(())
    }
}

/// Encode a single message into a self-contained frame.
///
/// Used where the carrier preserves message boundaries (UDP datagrams,
/// relay posts) and no streaming decoder is involved.
pub fn encode_message(message: &Message) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    FrameCodec::new().encode(message.clone(), &mut buf)?;
    Ok(buf.freeze())
}

/// Decode exactly one message from a self-contained frame.
pub fn decode_message(bytes: &[u8]) -> Result<Message, ProtocolError> {
    let mut buf = BytesMut::from(bytes);
    let mut codec = FrameCodec::new();
    match codec.decode(&mut buf)? {
        Some(message) if buf.is_empty() => Ok(message),
        Some(_) => Err(ProtocolError::TruncatedFrame {
            expected: bytes.len() - buf.len(),
            actual: bytes.len(),
        }),
        None => Err(ProtocolError::TruncatedFrame {
            expected: codec
                .pending_header
                .map(|h| HEADER_SIZE + h.payload_length as usize)
                .unwrap_or(HEADER_SIZE),
            actual: bytes.len(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_hello() {
        let mut codec = FrameCodec::new();

        let message = Message::Hello {
            session_id: "session-1".to_string(),
            nonce: [7u8; 32],
        };

        let mut buf = BytesMut::new();
        codec.encode(message.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, message);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_codec_data_message() {
        let mut codec = FrameCodec::new();

        let mut buf = BytesMut::new();
        codec
            .encode(Message::Data(Bytes::from("Hello, world!")), &mut buf)
            .unwrap();

        if let Message::Data(data) = codec.decode(&mut buf).unwrap().unwrap() {
            assert_eq!(data.as_ref(), b"Hello, world!");
        } else {
            panic!("Expected Data message");
        }
    }

    #[test]
    fn test_codec_partial_read() {
        let mut codec = FrameCodec::new();

        let mut full_buf = BytesMut::new();
        codec
            .encode(Message::Ping { timestamp: 12345 }, &mut full_buf)
            .unwrap();

        // Split the buffer to simulate partial read
        let mut partial = full_buf.split_to(HEADER_SIZE + 1);

        // Header is complete but payload isn't
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full_buf);

        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded, Message::Ping { timestamp: 12345 });
    }

    #[test]
    fn test_mismatched_header_type_rejected() {
        let mut buf = BytesMut::new();
        FrameCodec::new()
            .encode(Message::Ping { timestamp: 1 }, &mut buf)
            .unwrap();
        // Claim it's a Pong
        buf[3] = crate::message::MessageType::Pong.as_u8();

        assert!(FrameCodec::new().decode(&mut buf).is_err());
    }

    #[test]
    fn test_single_message_helpers() {
        let message = Message::Close {
            reason: Some("bye".to_string()),
        };
        let bytes = encode_message(&message).unwrap();
        assert_eq!(decode_message(&bytes).unwrap(), message);

        // A truncated datagram is rejected, not buffered
        assert!(matches!(
            decode_message(&bytes[..bytes.len() - 1]),
            Err(ProtocolError::TruncatedFrame { .. })
        ));

        // Two frames glued together are rejected too
        let mut doubled = bytes.to_vec();
        doubled.extend_from_slice(&bytes);
        assert!(decode_message(&doubled).is_err());
    }
}
