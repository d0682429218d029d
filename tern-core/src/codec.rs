//! Framing codecs for the two transports.
//!
//! `FrameCodec` handles the TCP peer links: every packet travels behind a
//! u16 little-endian length prefix. The decoder tolerates multiple frames
//! per read and frames split across reads; a frame larger than the link
//! buffer is an unrecoverable overflow that closes the link.
//!
//! `UdpCodec` wraps whole datagrams for the server channel, applying the
//! scramble cipher on the way out and reversing it on the way in.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::cipher::{self, PacketRng};
use crate::error::TernError;
use crate::packet::{MAX_PACKET_SIZE, Packet};

/// Size of the u16 length prefix on TCP frames.
pub const FRAME_PREFIX_LEN: usize = 2;

// ── FrameCodec ───────────────────────────────────────────────────

/// Length-prefixed TCP frame codec.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Packet;
    type Error = TernError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < FRAME_PREFIX_LEN {
            return Ok(None);
        }
        let frame_len = u16::from_le_bytes([src[0], src[1]]) as usize;
        if frame_len > MAX_PACKET_SIZE {
            return Err(TernError::FrameTooLarge {
                size: frame_len,
                max: MAX_PACKET_SIZE,
            });
        }
        if src.len() < FRAME_PREFIX_LEN + frame_len {
            src.reserve(FRAME_PREFIX_LEN + frame_len - src.len());
            return Ok(None);
        }
        src.advance(FRAME_PREFIX_LEN);
        let body = src.split_to(frame_len);
        Ok(Some(Packet::from_bytes(&body)?))
    }
}

impl Encoder<Packet> for FrameCodec {
    type Error = TernError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = item.into_bytes();
        if bytes.len() > MAX_PACKET_SIZE {
            return Err(TernError::FrameTooLarge {
                size: bytes.len(),
                max: MAX_PACKET_SIZE,
            });
        }
        dst.reserve(FRAME_PREFIX_LEN + bytes.len());
        dst.put_u16_le(bytes.len() as u16);
        dst.put_slice(&bytes);
        Ok(())
    }
}

// ── UdpCodec ─────────────────────────────────────────────────────

/// Whole-datagram codec for the server channel: cipher on encode,
/// inverse cipher + checkcode verification on decode.
#[derive(Debug)]
pub struct UdpCodec {
    rng: PacketRng,
}

impl UdpCodec {
    pub fn new() -> Self {
        Self {
            rng: PacketRng::new(),
        }
    }

    /// Deterministic cipher randomness, for tests.
    pub fn with_rng(rng: PacketRng) -> Self {
        Self { rng }
    }
}

impl Default for UdpCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for UdpCodec {
    type Item = Packet;
    type Error = TernError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // datagram transport: the buffer holds exactly one datagram
        if src.is_empty() {
            return Ok(None);
        }
        let mut data = src.split().to_vec();
        cipher::decode(&mut data)?;
        Ok(Some(Packet::from_bytes(&data)?))
    }
}

impl Encoder<Packet> for UdpCodec {
    type Error = TernError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut data = item.into_bytes();
        cipher::encode(&mut data, &mut self.rng)?;
        dst.reserve(data.len());
        dst.put_slice(&data);
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(body: &[u8]) -> Vec<u8> {
        let mut out = (body.len() as u16).to_le_bytes().to_vec();
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn single_frame_in_one_read() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::from(&frame(b"hello")[..]);
        let pkt = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(pkt.as_bytes(), b"hello");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn multiple_frames_in_one_read() {
        let mut codec = FrameCodec;
        let mut bytes = frame(b"one");
        bytes.extend_from_slice(&frame(b"two"));
        bytes.extend_from_slice(&frame(b"three"));
        let mut buf = BytesMut::from(&bytes[..]);

        let mut out = Vec::new();
        while let Some(pkt) = codec.decode(&mut buf).unwrap() {
            out.push(pkt.into_bytes());
        }
        assert_eq!(out, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
    }

    #[test]
    fn frame_split_at_every_boundary() {
        // reassembly must be independent of how the stream is chopped up
        let mut bytes = frame(b"alpha");
        bytes.extend_from_slice(&frame(b""));
        bytes.extend_from_slice(&frame(b"omega"));
        let expected = vec![b"alpha".to_vec(), b"".to_vec(), b"omega".to_vec()];

        for split in 0..=bytes.len() {
            let mut codec = FrameCodec;
            let mut buf = BytesMut::new();
            let mut out = Vec::new();
            for chunk in [&bytes[..split], &bytes[split..]] {
                buf.extend_from_slice(chunk);
                while let Some(pkt) = codec.decode(&mut buf).unwrap() {
                    out.push(pkt.into_bytes());
                }
            }
            assert_eq!(out, expected, "split at {split}");
        }
    }

    #[test]
    fn oversized_frame_is_fatal() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        buf.put_u16_le((MAX_PACKET_SIZE + 1) as u16);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(TernError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn encode_decode_roundtrip() {
        let mut codec = FrameCodec;
        let pkt = Packet::from_bytes(b"payload").unwrap();
        let mut buf = BytesMut::new();
        codec.encode(pkt, &mut buf).unwrap();
        let back = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(back.as_bytes(), b"payload");
    }

    #[test]
    fn udp_codec_roundtrip() {
        let mut codec = UdpCodec::with_rng(PacketRng::seeded(11));
        let mut pkt = Packet::new();
        pkt.append_u16(5).unwrap();
        pkt.append_bytes(&[0u8; 0x16]).unwrap(); // rest of header
        pkt.append_u32(0xCAFE_F00D).unwrap();
        let original = pkt.as_bytes().to_vec();

        let mut wire = BytesMut::new();
        codec.encode(pkt, &mut wire).unwrap();
        assert_ne!(&wire[..], &original[..]);

        let back = codec.decode(&mut wire).unwrap().unwrap();
        assert_eq!(back.as_bytes(), &original[..]);
    }

    #[test]
    fn udp_codec_rejects_garbage() {
        let mut codec = UdpCodec::new();
        let mut wire = BytesMut::from(&[0u8; 40][..]);
        assert!(codec.decode(&mut wire).is_err());
    }
}
