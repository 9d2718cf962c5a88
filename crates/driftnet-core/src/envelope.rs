//! Message envelope: one encoded array plus the metadata needed to apply it.
//!
//! Wire layout (integers big-endian):
//!
//! ```text
//! version u8 | kind u8 | compression u8 | reserved u8 | id [16] | payload_len u64
//! [kind 1 only: offset u64 | ndims u32 | dims u32 × ndims]
//! payload
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::array::NumericArray;
use crate::codec::{self, CodecError, Compression};
use crate::wire::MessageId;

/// Fixed part of the envelope header.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct EnvelopeHeader {
    pub version: u8,
    pub kind: u8,
    pub compression: u8,
    /// Must be zero.
    pub reserved: u8,
    pub message_id: [u8; 16],
    /// Length of the codec payload at the end of the envelope.
    pub payload_len: U64<BigEndian>,
}

assert_eq_size!(EnvelopeHeader, [u8; 28]);

/// Current envelope format version.
pub const ENVELOPE_VERSION: u8 = 0x01;

/// Size of the fixed part of the envelope header.
pub const ENVELOPE_HEADER_LEN: usize = std::mem::size_of::<EnvelopeHeader>();

const KIND_WHOLE: u8 = 0;
const KIND_PARTIAL: u8 = 1;

/// What the receiver should do with the array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateKind {
    /// Replace the target array entirely.
    WholeArray,
    /// Patch the sub-region of the target at `offset` along `dimensions`.
    Partial { offset: u64, dimensions: Vec<u32> },
}

impl UpdateKind {
    fn tag(&self) -> u8 {
        match self {
            UpdateKind::WholeArray => KIND_WHOLE,
            UpdateKind::Partial { .. } => KIND_PARTIAL,
        }
    }
}

/// A self-describing, serializable unit carrying exactly one encoded array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEnvelope {
    id: MessageId,
    kind: UpdateKind,
    compression: Compression,
    payload: Bytes,
}

/// A decoded envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayMessage {
    pub id: MessageId,
    pub kind: UpdateKind,
    pub array: NumericArray,
}

impl MessageEnvelope {
    /// Envelope replacing the receiver's array with `array`.
    pub fn whole_array_update(
        array: &NumericArray,
        compression: Compression,
    ) -> Result<Self, CodecError> {
        Self::build(array, UpdateKind::WholeArray, compression)
    }

    /// Envelope patching the receiver's array at `offset` along `dimensions`.
    ///
    /// Every dimension must be distinct and smaller than the rank of `array`.
    pub fn partial_update(
        array: &NumericArray,
        offset: u64,
        dimensions: Vec<u32>,
        compression: Compression,
    ) -> Result<Self, CodecError> {
        Self::build(array, UpdateKind::Partial { offset, dimensions }, compression)
    }

    /// Envelope of either kind.
    pub fn build(
        array: &NumericArray,
        kind: UpdateKind,
        compression: Compression,
    ) -> Result<Self, CodecError> {
        if let UpdateKind::Partial { dimensions, .. } = &kind {
            validate_dimensions(dimensions, array.rank())?;
        }
        Ok(Self {
            id: MessageId::generate(),
            kind,
            compression,
            payload: codec::encode(array, compression)?,
        })
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn kind(&self) -> &UpdateKind {
        &self.kind
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Length of [`to_bytes`](Self::to_bytes) output.
    pub fn encoded_len(&self) -> usize {
        let extra = match &self.kind {
            UpdateKind::WholeArray => 0,
            UpdateKind::Partial { dimensions, .. } => 8 + 4 + 4 * dimensions.len(),
        };
        ENVELOPE_HEADER_LEN + extra + self.payload.len()
    }

    pub fn to_bytes(&self) -> Bytes {
        let header = EnvelopeHeader {
            version: ENVELOPE_VERSION,
            kind: self.kind.tag(),
            compression: self.compression.tag(),
            reserved: 0,
            message_id: self.id.0,
            payload_len: U64::new(self.payload.len() as u64),
        };

        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_slice(header.as_bytes());
        if let UpdateKind::Partial { offset, dimensions } = &self.kind {
            buf.put_u64(*offset);
            buf.put_u32(dimensions.len() as u32);
            for &dim in dimensions {
                buf.put_u32(dim);
            }
        }
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let header = EnvelopeHeader::read_from_prefix(bytes).ok_or(EnvelopeError::Truncated {
            needed: ENVELOPE_HEADER_LEN,
            available: bytes.len(),
        })?;

        if header.version != ENVELOPE_VERSION {
            return Err(EnvelopeError::UnknownVersion(header.version));
        }
        let compression = Compression::from_tag(header.compression)
            .map_err(|_| EnvelopeError::UnknownCompression(header.compression))?;
        if header.reserved != 0 {
            return Err(EnvelopeError::ReservedByteSet(header.reserved));
        }
        let payload_len = header.payload_len.get();

        let mut rest = &bytes[ENVELOPE_HEADER_LEN..];
        let kind = match header.kind {
            KIND_WHOLE => UpdateKind::WholeArray,
            KIND_PARTIAL => {
                need(&rest, 8 + 4)?;
                let offset = rest.get_u64();
                let ndims = rest.get_u32() as usize;
                need(&rest, ndims.saturating_mul(4))?;
                let dimensions = (0..ndims).map(|_| rest.get_u32()).collect();
                UpdateKind::Partial { offset, dimensions }
            }
            other => return Err(EnvelopeError::UnknownKind(other)),
        };

        if payload_len != rest.len() as u64 {
            return Err(EnvelopeError::PayloadLength {
                declared: payload_len,
                available: rest.len(),
            });
        }

        Ok(Self {
            id: MessageId(header.message_id),
            kind,
            compression,
            payload: Bytes::copy_from_slice(rest),
        })
    }

    /// Decode the payload, checking it agrees with the envelope's compression tag.
    pub fn decode_array(&self) -> Result<NumericArray, CodecError> {
        let (payload_compression, array) = codec::decode_parts(&self.payload)?;
        if payload_compression != self.compression {
            return Err(CodecError::CompressionMismatch {
                envelope: self.compression,
                payload: payload_compression,
            });
        }
        if let UpdateKind::Partial { dimensions, .. } = &self.kind {
            validate_dimensions(dimensions, array.rank())?;
        }
        Ok(array)
    }

    pub fn into_message(self) -> Result<ArrayMessage, CodecError> {
        let array = self.decode_array()?;
        Ok(ArrayMessage {
            id: self.id,
            kind: self.kind,
            array,
        })
    }
}

fn validate_dimensions(dimensions: &[u32], rank: usize) -> Result<(), CodecError> {
    for (i, &dim) in dimensions.iter().enumerate() {
        if dim as usize >= rank {
            return Err(CodecError::InvalidPartial(format!(
                "dimension {dim} out of range for rank {rank}"
            )));
        }
        if dimensions[..i].contains(&dim) {
            return Err(CodecError::InvalidPartial(format!(
                "dimension {dim} listed twice"
            )));
        }
    }
    Ok(())
}

fn need(r: &impl Buf, needed: usize) -> Result<(), EnvelopeError> {
    if r.remaining() < needed {
        return Err(EnvelopeError::Truncated {
            needed,
            available: r.remaining(),
        });
    }
    Ok(())
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// A byte sequence that is not a well-formed envelope.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("malformed envelope: unknown version 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("malformed envelope: unknown kind tag {0}")]
    UnknownKind(u8),

    #[error("malformed envelope: unknown compression tag 0x{0:02x}")]
    UnknownCompression(u8),

    #[error("malformed envelope: reserved byte is 0x{0:02x}")]
    ReservedByteSet(u8),

    #[error("malformed envelope: declares {declared} payload bytes, {available} available")]
    PayloadLength { declared: u64, available: usize },
}
