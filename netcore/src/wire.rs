//! Frame length prefix, packet header and MessagePack/zlib payload encoding.
//!
//! Wire layout of a single frame:
//!
//! ```text
//! offset  size  field
//!  0      4     length L          (uint32, big-endian)
//!  4      4     packet_id         (uint32, big-endian)
//!  8      2     flags             (uint16, big-endian)
//! 10      L-6   payload           (msgpack, optionally zlib-deflated)
//! ```

use std::io::{self, Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::value::Value;

/// Maximum representable frame body length (`2**32 - 1`).
pub const MAX_PACKETLENGTH: u64 = u32::MAX as u64;

/// Default compression threshold in bytes, applied to the serialized (pre-compression) payload.
pub const DEFAULT_COMPRESS_THRESHOLD: usize = 8 * 1024;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Flags(u16);

impl Flags {
    pub const COMPRESSED: Flags = Flags(1 << 0);
    pub const ENCRYPTED_AES: Flags = Flags(1 << 1);

    /// Bits 2..=15 are reserved and must be zero.
    const RESERVED_MASK: u16 = !0b11;

    #[inline]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[inline]
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    #[inline]
    pub const fn bits(self) -> u16 {
        self.0
    }

    #[inline]
    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn insert(&mut self, other: Flags) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn has_unknown_bits(self) -> bool {
        self.0 & Self::RESERVED_MASK != 0
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("msgpack encode: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("msgpack decode: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("frame of {0} bytes exceeds MAX_PACKETLENGTH")]
    FrameTooLarge(u64),
    #[error("unknown or reserved flag bits set: {0:#06x}")]
    UnknownFlags(u16),
    #[error("unsupported flag: ENCRYPTED_AES")]
    UnsupportedFlag,
}

/// Compression policy applied to outgoing frames.
#[derive(Clone, Copy, Debug)]
pub struct CompressionConfig {
    pub enabled: bool,
    pub threshold: usize,
    pub level: u32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: DEFAULT_COMPRESS_THRESHOLD,
            level: 6,
        }
    }
}

/// A decoded frame: packet id, flags and payload value.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub id: u32,
    pub flags: Flags,
    pub payload: Value,
}

/// Encodes `(id, payload)` into a complete on-wire frame (length prefix included).
pub fn encode(id: u32, payload: &Value, compression: CompressionConfig) -> Result<Vec<u8>, Error> {
    let body = rmp_serde::to_vec_named(payload)?;

    let mut flags = Flags::empty();
    let body = if compression.enabled && body.len() > compression.threshold {
        flags.insert(Flags::COMPRESSED);
        deflate(&body, compression.level)?
    } else {
        body
    };

    let total: u64 = 6 + body.len() as u64;
    if total > MAX_PACKETLENGTH {
        return Err(Error::FrameTooLarge(total));
    }

    let mut buf = Vec::with_capacity(4 + total as usize);
    buf.extend_from_slice(&(total as u32).to_be_bytes());
    buf.extend_from_slice(&id.to_be_bytes());
    buf.extend_from_slice(&flags.bits().to_be_bytes());
    buf.extend_from_slice(&body);

    Ok(buf)
}

/// Decodes a single frame body (everything after the 4-byte length prefix has already been read
/// into `body`).
pub fn decode(body: &[u8]) -> Result<Frame, Error> {
    if body.len() < 6 {
        // A frame shorter than the header can only be the legal zero-length case, which decodes
        // to an implicit empty header with no payload.
        return Ok(Frame {
            id: 0,
            flags: Flags::empty(),
            payload: Value::Nil,
        });
    }

    let id = u32::from_be_bytes(body[0..4].try_into().unwrap());
    let flags = Flags::from_bits(u16::from_be_bytes(body[4..6].try_into().unwrap()));

    if flags.has_unknown_bits() {
        return Err(Error::UnknownFlags(flags.bits()));
    }
    if flags.contains(Flags::ENCRYPTED_AES) {
        return Err(Error::UnsupportedFlag);
    }

    let raw = &body[6..];
    let payload = if flags.contains(Flags::COMPRESSED) {
        rmp_serde::from_slice(&inflate(raw)?)?
    } else {
        rmp_serde::from_slice(raw)?
    };

    Ok(Frame { id, flags, payload })
}

fn deflate(data: &[u8], level: u32) -> Result<Vec<u8>, Error> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(level));
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn inflate(data: &[u8]) -> Result<Vec<u8>, Error> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(payload: Value, compression: CompressionConfig) {
        let encoded = encode(42, &payload, compression).unwrap();

        let len = u32::from_be_bytes(encoded[0..4].try_into().unwrap()) as usize;
        assert_eq!(encoded.len(), 4 + len);

        let frame = decode(&encoded[4..]).unwrap();
        assert_eq!(frame.id, 42);
        assert_eq!(frame.payload, payload);
    }

    #[test]
    fn test_roundtrip_uncompressed() {
        roundtrip(
            Value::map([("hello", Value::String("world".into()))]),
            CompressionConfig {
                enabled: false,
                ..Default::default()
            },
        );
    }

    #[test]
    fn test_roundtrip_compressed() {
        let payload = Value::String("x".repeat(16 * 1024));
        let encoded = encode(
            1,
            &payload,
            CompressionConfig {
                enabled: true,
                threshold: DEFAULT_COMPRESS_THRESHOLD,
                level: 6,
            },
        )
        .unwrap();

        let frame = decode(&encoded[4..]).unwrap();
        assert!(frame.flags.contains(Flags::COMPRESSED));
        assert!(encoded.len() < 16 * 1024 + 10);
        assert_eq!(frame.payload, payload);
    }

    #[test]
    fn test_threshold_boundary() {
        // Exactly at the threshold: not compressed.
        let at = Value::Bytes(vec![0u8; DEFAULT_COMPRESS_THRESHOLD - 16]);
        let encoded = encode(1, &at, CompressionConfig::default()).unwrap();
        let frame = decode(&encoded[4..]).unwrap();
        assert!(!frame.flags.contains(Flags::COMPRESSED));

        // One byte larger than the threshold: compressed. We pad with incompressible-looking
        // content so the serialized size, not just the raw byte count, crosses the threshold.
        let over = Value::Bytes((0..DEFAULT_COMPRESS_THRESHOLD + 64).map(|i| i as u8).collect());
        let encoded = encode(1, &over, CompressionConfig::default()).unwrap();
        let frame = decode(&encoded[4..]).unwrap();
        assert!(frame.flags.contains(Flags::COMPRESSED));
    }

    #[test]
    fn test_unknown_flags_rejected() {
        let mut body = Vec::new();
        body.extend_from_slice(&1u32.to_be_bytes());
        body.extend_from_slice(&0b100u16.to_be_bytes());
        body.extend_from_slice(&rmp_serde::to_vec(&Value::Nil).unwrap());

        assert!(matches!(decode(&body), Err(Error::UnknownFlags(_))));
    }

    #[test]
    fn test_encrypted_flag_rejected() {
        let mut body = Vec::new();
        body.extend_from_slice(&1u32.to_be_bytes());
        body.extend_from_slice(&Flags::ENCRYPTED_AES.bits().to_be_bytes());
        body.extend_from_slice(&rmp_serde::to_vec(&Value::Nil).unwrap());

        assert!(matches!(decode(&body), Err(Error::UnsupportedFlag)));
    }

    #[test]
    fn test_empty_body_decodes_to_empty_header() {
        let frame = decode(&[]).unwrap();
        assert_eq!(frame.id, 0);
        assert_eq!(frame.payload, Value::Nil);
    }

    #[test]
    fn test_oversize_frame_rejected() {
        // A body whose declared total size would exceed MAX_PACKETLENGTH is rejected by the
        // encoder up front; decoding never sees it on this side.
        // (MAX_PACKETLENGTH is u32::MAX; constructing an actual oversized Vec is impractical in a
        // test, so we only assert the boundary constant lines up with the wire format.)
        assert_eq!(MAX_PACKETLENGTH, u32::MAX as u64);
    }
}
