//! Packet framing over the SSH byte stream
//!
//! Each packet travels as `[u16 big-endian length][payload]`. There is no
//! sequencing or acknowledgement; the stream below is reliable.

use bytes::{Buf, BufMut, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

/// Largest payload a length prefix can describe
pub const MAX_FRAME: usize = u16::MAX as usize;

const HEADER_LEN: usize = 2;

/// Length-prefixed packet codec
#[derive(Debug, Clone)]
pub struct PacketCodec {
    max_len: usize,
    /// Payload bytes still to drop from a rejected frame
    skipping: usize,
}

impl PacketCodec {
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len: max_len.min(MAX_FRAME),
            skipping: 0,
        }
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME)
    }
}

impl Decoder for PacketCodec {
    type Item = BytesMut;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, io::Error> {
        loop {
            if self.skipping > 0 {
                let n = self.skipping.min(src.len());
                src.advance(n);
                self.skipping -= n;
                if self.skipping > 0 {
                    return Ok(None);
                }
            }

            if src.len() < HEADER_LEN {
                return Ok(None);
            }

            let len = u16::from_be_bytes([src[0], src[1]]) as usize;
            if len == 0 {
                src.advance(HEADER_LEN);
                continue;
            }
            if len > self.max_len {
                warn!("Skipping oversized frame of {} bytes", len);
                src.advance(HEADER_LEN);
                self.skipping = len;
                continue;
            }

            if src.len() < HEADER_LEN + len {
                src.reserve(HEADER_LEN + len - src.len());
                return Ok(None);
            }

            src.advance(HEADER_LEN);
            return Ok(Some(src.split_to(len)));
        }
    }
}

impl<'a> Encoder<&'a [u8]> for PacketCodec {
    type Error = io::Error;

    fn encode(&mut self, packet: &'a [u8], dst: &mut BytesMut) -> Result<(), io::Error> {
        if packet.is_empty() || packet.len() > MAX_FRAME {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot frame a {} byte packet", packet.len()),
            ));
        }
        dst.reserve(HEADER_LEN + packet.len());
        dst.put_u16(packet.len() as u16);
        dst.extend_from_slice(packet);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    fn decode_all(codec: &mut PacketCodec, buf: &mut BytesMut) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(frame) = codec.decode(buf).unwrap() {
            out.push(frame.to_vec());
        }
        out
    }

    #[test]
    fn test_packets_survive_arbitrary_chunking() {
        let sizes = [1usize, 2, 20, 576, 1420, 1500, 9000, 32_768, 65_534, MAX_FRAME];
        let packets: Vec<Vec<u8>> = sizes.iter().enumerate().map(|(i, &n)| packet(n, i as u8)).collect();

        let mut encoder = PacketCodec::default();
        let mut wire = BytesMut::new();
        for p in &packets {
            encoder.encode(p.as_slice(), &mut wire).unwrap();
        }
        let wire = wire.freeze();

        for chunk in [1usize, 3, 1000, 4096, wire.len()] {
            let mut decoder = PacketCodec::default();
            let mut buf = BytesMut::new();
            let mut received = Vec::new();
            for piece in wire.chunks(chunk) {
                buf.extend_from_slice(piece);
                received.extend(decode_all(&mut decoder, &mut buf));
            }
            assert_eq!(received, packets, "chunk size {chunk}");
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_zero_length_frames_are_skipped() {
        let mut buf = BytesMut::from(&[0u8, 0, 0, 3, 7, 8, 9][..]);
        let frames = decode_all(&mut PacketCodec::default(), &mut buf);
        assert_eq!(frames, vec![vec![7, 8, 9]]);
    }

    #[test]
    fn test_oversized_frame_is_skipped_not_fatal() {
        let mut codec = PacketCodec::new(1500);
        let mut buf = BytesMut::new();
        buf.put_u16(4000);
        buf.extend_from_slice(&[0xAA; 1000]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());

        // rest of the bad payload, then a good frame
        buf.extend_from_slice(&[0xAA; 3000]);
        codec.encode(&[1u8, 2, 3][..], &mut buf).unwrap();
        assert_eq!(decode_all(&mut codec, &mut buf), vec![vec![1, 2, 3]]);
    }

    #[test]
    fn test_encode_rejects_empty() {
        let mut buf = BytesMut::new();
        assert!(PacketCodec::default().encode(&[][..], &mut buf).is_err());
        assert!(buf.is_empty());
    }
}
