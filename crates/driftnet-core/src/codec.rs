//! Array codec: flattens a [`NumericArray`] into bytes and back.
//!
//! Layout (header integers big-endian):
//!
//! ```text
//! compression u8 | dtype u8 | order u8 | rank u32 | shape u64 × rank
//! | element_len u64 | element bytes (compressed when compression != none)
//! ```
//!
//! `element_len` is always the uncompressed element byte length, so the
//! decoder can bound decompression and verify the result.

use std::fmt;
use std::str::FromStr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::array::{element_count, DType, NumericArray, Order};

/// zstd level used for outgoing payloads.
pub const ZSTD_LEVEL: i32 = 3;

/// Decoded element buffers larger than this are refused.
pub const MAX_ELEMENT_BYTES: usize = 1 << 30;

/// Compression applied to the element bytes. The discriminant is the on-wire tag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Compression {
    #[default]
    None = 0x00,
    Zstd = 0x01,
}

impl Compression {
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Result<Self, CodecError> {
        match tag {
            0x00 => Ok(Compression::None),
            0x01 => Ok(Compression::Zstd),
            other => Err(CodecError::UnknownCompression(other)),
        }
    }

    /// Look up a codec by its configured name.
    pub fn from_name(name: &str) -> Result<Self, CodecError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Compression::None),
            "zstd" => Ok(Compression::Zstd),
            _ => Err(CodecError::UnknownCompressionName(name.to_string())),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Zstd => "zstd",
        }
    }
}

impl FromStr for Compression {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s)
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Encode `array`, optionally compressing its elements.
pub fn encode(array: &NumericArray, compression: Compression) -> Result<Bytes, CodecError> {
    let elements = array.as_bytes();
    let rank = u32::try_from(array.rank()).map_err(|_| CodecError::ShapeOverflow)?;

    let mut buf = BytesMut::with_capacity(3 + 4 + 8 * array.rank() + 8 + elements.len());
    buf.put_u8(compression.tag());
    buf.put_u8(array.dtype() as u8);
    buf.put_u8(array.order() as u8);
    buf.put_u32(rank);
    for &dim in array.shape() {
        buf.put_u64(dim as u64);
    }
    buf.put_u64(elements.len() as u64);

    match compression {
        Compression::None => buf.put_slice(elements),
        Compression::Zstd => {
            let packed = zstd::bulk::compress(elements, ZSTD_LEVEL).map_err(CodecError::Compress)?;
            buf.put_slice(&packed);
        }
    }

    Ok(buf.freeze())
}

/// Decode bytes produced by [`encode`] into a fresh array.
pub fn decode(bytes: &[u8]) -> Result<NumericArray, CodecError> {
    decode_parts(bytes).map(|(_, array)| array)
}

/// Decode and also report which compression the payload declared.
pub fn decode_parts(bytes: &[u8]) -> Result<(Compression, NumericArray), CodecError> {
    let mut rest = bytes;

    need(&rest, 1)?;
    let compression = Compression::from_tag(rest.get_u8())?;
    need(&rest, 1)?;
    let dtype = DType::try_from(rest.get_u8())?;
    need(&rest, 1)?;
    let order = Order::try_from(rest.get_u8())?;
    need(&rest, 4)?;
    let rank = rest.get_u32();

    let mut shape = Vec::new();
    for _ in 0..rank {
        need(&rest, 8)?;
        shape.push(usize::try_from(rest.get_u64()).map_err(|_| CodecError::ShapeOverflow)?);
    }

    need(&rest, 8)?;
    let element_len = usize::try_from(rest.get_u64()).map_err(|_| CodecError::ShapeOverflow)?;

    let expected = element_count(&shape)
        .and_then(|n| n.checked_mul(dtype.size()))
        .ok_or(CodecError::ShapeOverflow)?;
    if element_len != expected {
        return Err(CodecError::ShapeMismatch {
            expected,
            actual: element_len,
        });
    }
    if expected > MAX_ELEMENT_BYTES {
        return Err(CodecError::TooLarge(expected));
    }

    let data = match compression {
        Compression::None => {
            if rest.len() < expected {
                return Err(CodecError::Truncated {
                    needed: expected,
                    available: rest.len(),
                });
            }
            if rest.len() > expected {
                return Err(CodecError::TrailingBytes(rest.len() - expected));
            }
            rest.to_vec()
        }
        Compression::Zstd => {
            let raw = zstd::bulk::decompress(rest, expected).map_err(CodecError::Decompress)?;
            if raw.len() != expected {
                return Err(CodecError::ShapeMismatch {
                    expected,
                    actual: raw.len(),
                });
            }
            raw
        }
    };

    let array = NumericArray::from_raw(shape, dtype, order, data)?;
    Ok((compression, array))
}

fn need(r: &impl Buf, needed: usize) -> Result<(), CodecError> {
    if r.remaining() < needed {
        return Err(CodecError::Truncated {
            needed,
            available: r.remaining(),
        });
    }
    Ok(())
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Failures encoding or decoding an array payload.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("payload truncated: needed {needed} more bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("{0} unexpected trailing bytes after element data")]
    TrailingBytes(usize),

    #[error("unknown element type tag: 0x{0:02x}")]
    UnknownElementType(u8),

    #[error("unknown element ordering tag: 0x{0:02x}")]
    UnknownOrdering(u8),

    #[error("unknown compression tag: 0x{0:02x}")]
    UnknownCompression(u8),

    #[error("unknown compression codec: {0:?}")]
    UnknownCompressionName(String),

    #[error("envelope declares {envelope} but payload is {payload}")]
    CompressionMismatch {
        envelope: Compression,
        payload: Compression,
    },

    #[error("element data is {actual} bytes, shape requires {expected}")]
    ShapeMismatch { expected: usize, actual: usize },

    #[error("shape does not fit in addressable memory")]
    ShapeOverflow,

    #[error("decoded element buffer of {0} bytes exceeds limit of {}", MAX_ELEMENT_BYTES)]
    TooLarge(usize),

    #[error("invalid partial update: {0}")]
    InvalidPartial(String),

    #[error("compression failed: {0}")]
    Compress(std::io::Error),

    #[error("decompression failed: {0}")]
    Decompress(std::io::Error),
}
