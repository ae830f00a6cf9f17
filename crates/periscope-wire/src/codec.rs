//! Length-prefixed frame codec.
//!
//! Frame layout: `[u32 payload length, big endian][u8 type tag][payload]`.
//! The payload is the JSON encoding of the full [`Message`]; the tag is
//! redundant with it and exists so a peer can route or drop a frame without
//! parsing the payload. A tag that disagrees with the payload is malformed.

use bytes::{Buf, BufMut, BytesMut};

use crate::protocol::{Message, ProtocolError};

/// Upper bound on a single frame's payload. Anything larger is treated as a
/// protocol violation rather than an allocation request.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 4 + 1;

/// Stateless encoder/decoder operating on [`BytesMut`] buffers.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl FrameCodec {
    /// Append one encoded frame to `buf`.
    ///
    /// # Errors
    /// `Malformed` if the message cannot be serialized or exceeds
    /// [`MAX_FRAME_LEN`].
    pub fn encode(msg: &Message, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        let payload =
            serde_json::to_vec(msg).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        if payload.len() > MAX_FRAME_LEN {
            return Err(ProtocolError::Malformed(format!(
                "frame payload of {} bytes exceeds limit",
                payload.len()
            )));
        }

        buf.reserve(HEADER_LEN + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.put_u8(msg.tag());
        buf.put_slice(&payload);
        Ok(())
    }

    /// Try to decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a complete
    /// frame; callers keep reading from the socket and retry. Consumed bytes
    /// are split off `buf` only once a full frame is present.
    ///
    /// # Errors
    /// `Malformed` on oversized frames, undecodable payloads, or a tag that
    /// disagrees with the payload.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let payload_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if payload_len > MAX_FRAME_LEN {
            return Err(ProtocolError::Malformed(format!(
                "frame payload of {payload_len} bytes exceeds limit"
            )));
        }
        if buf.len() < HEADER_LEN + payload_len {
            return Ok(None);
        }

        buf.advance(4);
        let tag = buf.get_u8();
        let payload = buf.split_to(payload_len);

        let msg: Message = serde_json::from_slice(&payload)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        if msg.tag() != tag {
            return Err(ProtocolError::Malformed(format!(
                "frame tag {tag} does not match payload tag {}",
                msg.tag()
            )));
        }
        Ok(Some(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PROTOCOL_VERSION;
    use periscope_core::ModelPath;

    #[test]
    fn roundtrip_single_frame() {
        let msg = Message::Handshake {
            version: PROTOCOL_VERSION,
        };
        let mut buf = BytesMut::new();
        FrameCodec::encode(&msg, &mut buf).unwrap();

        let decoded = FrameCodec::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_yields_none_without_consuming() {
        let msg = Message::RowCountRequest {
            request_id: 1,
            path: ModelPath::root(),
        };
        let mut full = BytesMut::new();
        FrameCodec::encode(&msg, &mut full).unwrap();

        // Feed all but the last byte.
        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        let before = partial.len();
        assert!(FrameCodec::decode(&mut partial).unwrap().is_none());
        assert_eq!(partial.len(), before);

        // Completing the frame makes it decodable.
        partial.extend_from_slice(&full[full.len() - 1..]);
        assert_eq!(FrameCodec::decode(&mut partial).unwrap(), Some(msg));
    }

    #[test]
    fn coalesced_frames_decode_in_order() {
        let first = Message::Ping;
        let second = Message::Pong;
        let mut buf = BytesMut::new();
        FrameCodec::encode(&first, &mut buf).unwrap();
        FrameCodec::encode(&second, &mut buf).unwrap();

        assert_eq!(FrameCodec::decode(&mut buf).unwrap(), Some(first));
        assert_eq!(FrameCodec::decode(&mut buf).unwrap(), Some(second));
        assert_eq!(FrameCodec::decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn garbage_payload_is_malformed() {
        let mut buf = BytesMut::new();
        buf.put_u32(4);
        buf.put_u8(0);
        buf.put_slice(b"!!!!");
        assert!(matches!(
            FrameCodec::decode(&mut buf),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn mismatched_tag_is_malformed() {
        let msg = Message::Ping;
        let mut buf = BytesMut::new();
        FrameCodec::encode(&msg, &mut buf).unwrap();
        buf[4] = Message::Pong.tag();
        assert!(matches!(
            FrameCodec::decode(&mut buf),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn oversized_length_is_rejected_before_allocation() {
        let mut buf = BytesMut::new();
        buf.put_u32(u32::MAX);
        buf.put_u8(0);
        assert!(matches!(
            FrameCodec::decode(&mut buf),
            Err(ProtocolError::Malformed(_))
        ));
    }
}
