//! Wire framing for sealed transport frames.
//!
//! After the handshake, every frame on the wire is
//! `u64 seq (big-endian) || 12B nonce || AEAD(ct||tag)`, per §6. The codec
//! lives here as a `tokio_util::codec::{Encoder, Decoder}` pair so it plugs
//! directly into a `Framed<T, FrameCodec>` over any `AsyncRead + AsyncWrite`.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::TransportError;

/// Header length: 8 bytes seq + 12 bytes nonce.
const HEADER_LEN: usize = 8 + 12;

/// A single sealed transport frame as it appears on the wire, before the
/// session layer authenticates and decrypts it.
#[derive(Debug, Clone)]
pub struct Frame {
    pub seq: u64,
    pub nonce: [u8; 12],
    /// AEAD ciphertext with the authentication tag appended.
    pub ciphertext: Vec<u8>,
}

impl Frame {
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.ciphertext.len()
    }
}

/// Builds the additional authenticated data bound into a frame's tag:
/// `"role=" || role_byte || "," || seq_be8`.
pub fn frame_aad(role_byte: u8, seq: u64) -> Vec<u8> {
    let mut aad = Vec::with_capacity(6 + 8);
    aad.extend_from_slice(b"role=");
    aad.push(role_byte);
    aad.push(b',');
    aad.extend_from_slice(&seq.to_be_bytes());
    aad
}

/// Stream codec for sealed frames, enforcing the configured maximum frame
/// size before any decryption is attempted (§4.4: oversize frames are
/// rejected pre-decryption).
pub struct FrameCodec {
    max_frame_bytes: usize,
}

impl FrameCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = TransportError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if frame.wire_len() > self.max_frame_bytes {
            return Err(TransportError::Oversize);
        }
        dst.reserve(frame.wire_len());
        dst.put_u64(frame.seq);
        dst.put_slice(&frame.nonce);
        dst.put_slice(&frame.ciphertext);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        if src.len() > self.max_frame_bytes {
            return Err(TransportError::Oversize);
        }

        // We only learn the full length once everything has arrived, since
        // frames aren't separately length-prefixed beyond the fixed header;
        // the session protocol is request/response so a single `read` per
        // logical frame is expected. Callers that need length-delimited
        // transport framing lower in the stack (e.g. over a raw TCP stream
        // with partial reads) should pair this with a length-delimited
        // codec; here we require the whole frame to be buffered.
        let mut seq_bytes = [0u8; 8];
        seq_bytes.copy_from_slice(&src[0..8]);
        let seq = u64::from_be_bytes(seq_bytes);

        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&src[8..20]);

        let ciphertext = src[HEADER_LEN..].to_vec();
        src.advance(src.len());

        Ok(Some(Frame {
            seq,
            nonce,
            ciphertext,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aad_binds_role_and_seq() {
        let a = frame_aad(b'A', 5);
        let b = frame_aad(b'C', 5);
        let c = frame_aad(b'A', 6);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn encode_rejects_oversize_frame() {
        let mut codec = FrameCodec::new(16);
        let frame = Frame {
            seq: 0,
            nonce: [0u8; 12],
            ciphertext: vec![0u8; 32],
        };
        let mut buf = BytesMut::new();
        assert!(matches!(
            codec.encode(frame, &mut buf),
            Err(TransportError::Oversize)
        ));
    }
}
