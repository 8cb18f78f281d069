//! Per-connection stream framing for byte-stream transports.
//!
//! TCP and TLS carry frames as `[2-byte magic][2-byte big-endian length]`
//! followed by the payload. Datagram transports deliver message boundaries
//! themselves and skip this prefix.

use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};

/// Magic constant opening every stream frame.
pub const STREAM_MAGIC: [u8; 2] = [0xFF, 0xFF];

/// Size of the stream frame header.
pub const HEADER_SIZE: usize = 4;

/// Default lower bound on payload length.
pub const DEFAULT_MIN_FRAME: usize = 15;

/// Default upper bound on payload length (device MTU).
pub const DEFAULT_MAX_FRAME: usize = 1514;

/// Validates stream headers against the configured frame-size bounds.
///
/// A bad magic or an out-of-range length is fatal to the enclosing
/// connection (close + reconnect), never to the process.
#[derive(Debug, Clone, Copy)]
pub struct StreamCodec {
    min_size: usize,
    max_size: usize,
}

impl Default for StreamCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_FRAME, DEFAULT_MAX_FRAME)
    }
}

impl StreamCodec {
    /// Create a codec bounded by `min_size..=max_size` payload bytes.
    pub fn new(min_size: usize, max_size: usize) -> Self {
        Self { min_size, max_size }
    }

    /// Encode the header for a payload of `len` bytes.
    pub fn encode_header(len: usize) -> [u8; HEADER_SIZE] {
        let mut header = [0u8; HEADER_SIZE];
        header[..2].copy_from_slice(&STREAM_MAGIC);
        header[2..].copy_from_slice(&(len as u16).to_be_bytes());
        header
    }

    /// Encode header + payload into one buffer.
    pub fn encode(payload: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
        buf.put_slice(&Self::encode_header(payload.len()));
        buf.put_slice(payload);
        buf.to_vec()
    }

    /// Validate a header and return the payload length it announces.
    pub fn decode_header(&self, header: &[u8; HEADER_SIZE]) -> Result<usize> {
        if header[..2] != STREAM_MAGIC {
            return Err(Error::BadMagic([header[0], header[1]]));
        }
        let len = u16::from_be_bytes([header[2], header[3]]) as usize;
        if len < self.min_size || len > self.max_size {
            return Err(Error::LengthOutOfRange {
                len,
                min: self.min_size,
                max: self.max_size,
            });
        }
        Ok(len)
    }

    /// Upper payload bound, used to size read buffers.
    pub fn max_size(&self) -> usize {
        self.max_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let codec = StreamCodec::default();
        let header = StreamCodec::encode_header(60);
        assert_eq!(codec.decode_header(&header).unwrap(), 60);
    }

    #[test]
    fn test_encode_prefixes_payload() {
        let payload = vec![0xABu8; 42];
        let wire = StreamCodec::encode(&payload);
        assert_eq!(wire.len(), HEADER_SIZE + 42);
        assert_eq!(&wire[..2], &STREAM_MAGIC);
        assert_eq!(u16::from_be_bytes([wire[2], wire[3]]), 42);
        assert_eq!(&wire[4..], payload.as_slice());
    }

    #[test]
    fn test_bad_magic_rejected() {
        let codec = StreamCodec::default();
        let header = [0xDE, 0xAD, 0x00, 0x3C];
        assert!(matches!(
            codec.decode_header(&header),
            Err(Error::BadMagic(_))
        ));
    }

    #[test]
    fn test_length_bounds() {
        let codec = StreamCodec::new(15, 1514);

        let short = StreamCodec::encode_header(14);
        assert!(matches!(
            codec.decode_header(&short),
            Err(Error::LengthOutOfRange { len: 14, .. })
        ));

        let long = StreamCodec::encode_header(1515);
        assert!(matches!(
            codec.decode_header(&long),
            Err(Error::LengthOutOfRange { len: 1515, .. })
        ));

        let min = StreamCodec::encode_header(15);
        assert_eq!(codec.decode_header(&min).unwrap(), 15);
        let max = StreamCodec::encode_header(1514);
        assert_eq!(codec.decode_header(&max).unwrap(), 1514);
    }
}
