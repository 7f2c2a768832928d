//! Length-prefixed JSON codec for stream transports.
//!
//! Frames are a `u32` little-endian length followed by the JSON-serialized
//! envelope. The decoder is incremental: feed it a `BytesMut` read buffer
//! and it yields complete envelopes as they arrive.

use crate::envelope::Envelope;
use crate::error::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::warn;

/// Default maximum frame size (256 KiB). Chat envelopes are small; anything
/// near this limit is either corruption or abuse.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 256 * 1024;

const LEN_PREFIX_SIZE: usize = 4;

/// Encode an envelope into a length-prefixed frame
pub fn encode_envelope(envelope: &Envelope, max_frame: usize) -> Result<Bytes, WireError> {
    let body = serde_json::to_vec(envelope)?;
    if body.len() > max_frame {
        return Err(WireError::Size(body.len()));
    }

    let mut buf = BytesMut::with_capacity(LEN_PREFIX_SIZE + body.len());
    buf.put_u32_le(body.len() as u32);
    buf.extend_from_slice(&body);
    Ok(buf.freeze())
}

/// Incremental envelope decoder over a stream read buffer
#[derive(Debug)]
pub struct EnvelopeDecoder {
    max_frame: usize,
}

impl EnvelopeDecoder {
    /// Create a decoder with the default frame limit
    pub fn new() -> Self {
        Self {
            max_frame: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Create a decoder with a custom frame limit
    pub fn with_max_frame(max_frame: usize) -> Self {
        Self { max_frame }
    }

    /// Try to decode one envelope from the buffer.
    ///
    /// Returns `Ok(None)` when more bytes are needed; consumed bytes are
    /// removed from `buf`.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Envelope>, WireError> {
        if buf.len() < LEN_PREFIX_SIZE {
            return Ok(None);
        }

        let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if len > self.max_frame {
            return Err(WireError::Size(len));
        }

        if buf.len() < LEN_PREFIX_SIZE + len {
            return Ok(None);
        }

        buf.advance(LEN_PREFIX_SIZE);
        let body = buf.split_to(len);

        match serde_json::from_slice::<Envelope>(&body) {
            Ok(envelope) => Ok(Some(envelope)),
            Err(e) => {
                warn!("Discarding undecodable frame ({} bytes): {}", len, e);
                Err(WireError::Malformed(e.to_string()))
            }
        }
    }
}

impl Default for EnvelopeDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{EnvelopeKind, MessagePayload};

    fn sample(id: &str) -> Envelope {
        Envelope::new(
            id,
            EnvelopeKind::Message,
            "alice",
            &MessagePayload {
                text: "hello".to_string(),
                reply_to: None,
                edited: false,
            },
            1_700_000_000_000,
        )
        .unwrap()
    }

    #[test]
    fn test_encode_decode() {
        let env = sample("m1");
        let frame = encode_envelope(&env, DEFAULT_MAX_FRAME_SIZE).unwrap();

        let mut decoder = EnvelopeDecoder::new();
        let mut buf = BytesMut::from(frame.as_ref());
        let decoded = decoder.decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded.id, "m1");
        assert_eq!(decoded.sender_id, "alice");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_needs_more_data() {
        let env = sample("m1");
        let frame = encode_envelope(&env, DEFAULT_MAX_FRAME_SIZE).unwrap();

        let mut decoder = EnvelopeDecoder::new();
        let mut buf = BytesMut::from(&frame[..frame.len() / 2]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&frame[frame.len() / 2..]);
        assert!(decoder.decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn test_two_frames_back_to_back() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_envelope(&sample("m1"), DEFAULT_MAX_FRAME_SIZE).unwrap());
        buf.extend_from_slice(&encode_envelope(&sample("m2"), DEFAULT_MAX_FRAME_SIZE).unwrap());

        let mut decoder = EnvelopeDecoder::new();
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap().id, "m1");
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap().id, "m2");
        assert!(decoder.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_oversize_frame_rejected() {
        let mut decoder = EnvelopeDecoder::with_max_frame(16);
        let mut buf = BytesMut::new();
        buf.put_u32_le(1024);
        buf.extend_from_slice(&[0u8; 1024]);
        assert!(matches!(decoder.decode(&mut buf), Err(WireError::Size(_))));
    }
}
