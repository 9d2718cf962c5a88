//! driftnet wire format: the chunk datagram.
//!
//! Every datagram on the wire is one `ChunkHeader` followed by
//! `payload_len` bytes of a serialized envelope. The header alone is enough
//! to route the chunk, place it in the reassembly buffer and verify it.
//!
//! All multi-byte integers are big-endian (network order). The header is
//! `#[repr(C)]` over alignment-1 fields and uses zerocopy derives, so there
//! is no padding and no unsafe code in this module.

use std::fmt;

use bytes::Bytes;
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Message identity ─────────────────────────────────────────────────────────

/// Opaque identifier shared by every chunk of one logical message.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub [u8; 16]);

impl MessageId {
    /// A fresh random id.
    pub fn generate() -> Self {
        Self(rand::random())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", hex::encode(self.0))
    }
}

// ── Chunk Header ─────────────────────────────────────────────────────────────

/// Header preceding every chunk payload.
///
/// Wire size: 74 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct ChunkHeader {
    /// Wire format version. Currently 0x01.
    /// A receiver seeing an unknown version drops the chunk.
    pub version: u8,

    /// Reserved, must be zero.
    pub flags: u8,

    /// Id of the message this chunk belongs to.
    pub message_id: [u8; 16],

    /// Zero-based position of this chunk in the message.
    pub index: U32<BigEndian>,

    /// Total number of chunks in the message. Identical on every chunk.
    pub count: U32<BigEndian>,

    /// Payload size of every chunk except possibly the last.
    /// The payload of chunk `i` starts at byte `i * stride` of the envelope.
    pub stride: U32<BigEndian>,

    /// Length of the whole serialized envelope.
    pub total_len: U64<BigEndian>,

    /// Length of the payload following this header.
    pub payload_len: U32<BigEndian>,

    /// BLAKE3 hash of the payload bytes.
    /// A mismatch drops the chunk; nothing is sent back.
    pub content_hash: [u8; 32],
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(ChunkHeader, [u8; 74]);

// ── Constants ─────────────────────────────────────────────────────────────────

/// Current chunk format version.
pub const CHUNK_VERSION: u8 = 0x01;

/// Size of [`ChunkHeader`] on the wire.
pub const CHUNK_HEADER_LEN: usize = std::mem::size_of::<ChunkHeader>();

/// Largest UDP payload deliverable over IPv4.
pub const MAX_DATAGRAM: usize = 65_507;

/// Largest chunk payload that still fits one datagram with its header.
pub const MAX_CHUNK_PAYLOAD: usize = MAX_DATAGRAM - CHUNK_HEADER_LEN;

// ── Chunk ─────────────────────────────────────────────────────────────────────

/// One contiguous slice of a serialized envelope plus the metadata needed
/// to reassemble it without any other context.
///
/// Constructed only through [`Chunk::new`] or [`Chunk::decode`], both of
/// which enforce the geometry invariants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    message_id: MessageId,
    index: u32,
    count: u32,
    stride: u32,
    total_len: u64,
    payload: Bytes,
}

impl Chunk {
    pub fn new(
        message_id: MessageId,
        index: u32,
        count: u32,
        stride: u32,
        total_len: u64,
        payload: Bytes,
    ) -> Result<Self, WireError> {
        check_geometry(index, count, stride, total_len)?;
        let expected = expected_payload_len(index, count, stride, total_len);
        if payload.len() as u64 != expected {
            return Err(WireError::ChunkLength {
                index,
                expected,
                actual: payload.len(),
            });
        }
        Ok(Self {
            message_id,
            index,
            count,
            stride,
            total_len,
            payload,
        })
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn total_len(&self) -> u64 {
        self.total_len
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Byte offset of this chunk's payload inside the envelope.
    pub fn offset(&self) -> u64 {
        self.index as u64 * self.stride as u64
    }

    pub fn is_last(&self) -> bool {
        self.index + 1 == self.count
    }

    /// Header plus payload length.
    pub fn encoded_len(&self) -> usize {
        CHUNK_HEADER_LEN + self.payload.len()
    }

    fn header(&self) -> ChunkHeader {
        ChunkHeader {
            version: CHUNK_VERSION,
            flags: 0,
            message_id: self.message_id.0,
            index: U32::new(self.index),
            count: U32::new(self.count),
            stride: U32::new(self.stride),
            total_len: U64::new(self.total_len),
            payload_len: U32::new(self.payload.len() as u32),
            content_hash: *blake3::hash(&self.payload).as_bytes(),
        }
    }

    /// Serialize into one datagram.
    pub fn encode(&self) -> Bytes {
        let header = self.header();
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(header.as_bytes());
        buf.extend_from_slice(&self.payload);
        Bytes::from(buf)
    }

    /// Parse a datagram, slicing the payload out of it without copying.
    pub fn decode(datagram: Bytes) -> Result<Self, WireError> {
        let header = ChunkHeader::read_from_prefix(&datagram)
            .ok_or(WireError::TooShort(datagram.len()))?;

        if header.version != CHUNK_VERSION {
            return Err(WireError::UnknownVersion(header.version));
        }
        if header.flags != 0 {
            return Err(WireError::ReservedFlagsSet(header.flags));
        }

        let declared = header.payload_len.get() as usize;
        let actual = datagram.len() - CHUNK_HEADER_LEN;
        if declared != actual {
            return Err(WireError::PayloadLength { declared, actual });
        }

        // Chunks are built for one datagram each; a wider stride cannot come
        // from a well-behaved sender.
        let stride = header.stride.get();
        if stride as usize > MAX_CHUNK_PAYLOAD {
            return Err(WireError::InvalidStride(stride));
        }

        let payload = datagram.slice(CHUNK_HEADER_LEN..);
        if *blake3::hash(&payload).as_bytes() != header.content_hash {
            return Err(WireError::HashMismatch);
        }

        Self::new(
            MessageId(header.message_id),
            header.index.get(),
            header.count.get(),
            stride,
            header.total_len.get(),
            payload,
        )
    }
}

fn check_geometry(index: u32, count: u32, stride: u32, total_len: u64) -> Result<(), WireError> {
    if count == 0 || index >= count {
        return Err(WireError::IndexOutOfRange { index, count });
    }
    if stride == 0 {
        return Err(WireError::InvalidStride(stride));
    }
    // count chunks of `stride` bytes must cover total_len, and the last one
    // must not be empty.
    let full = (count as u64 - 1) * stride as u64;
    if total_len <= full || total_len > full + stride as u64 {
        return Err(WireError::Geometry {
            count,
            stride,
            total_len,
        });
    }
    Ok(())
}

fn expected_payload_len(index: u32, count: u32, stride: u32, total_len: u64) -> u64 {
    if index + 1 == count {
        total_len - (count as u64 - 1) * stride as u64
    } else {
        stride as u64
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Reasons a datagram is not a valid chunk.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("datagram of {0} bytes is shorter than the chunk header")]
    TooShort(usize),

    #[error("unknown chunk version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("reserved flags are non-zero: 0x{0:02x}")]
    ReservedFlagsSet(u8),

    #[error("header declares {declared} payload bytes, datagram carries {actual}")]
    PayloadLength { declared: usize, actual: usize },

    #[error("payload hash mismatch")]
    HashMismatch,

    #[error("chunk index {index} out of range for count {count}")]
    IndexOutOfRange { index: u32, count: u32 },

    #[error("invalid stride {0}")]
    InvalidStride(u32),

    #[error("{count} chunks of stride {stride} cannot hold {total_len} bytes")]
    Geometry { count: u32, stride: u32, total_len: u64 },

    #[error("chunk {index} carries {actual} bytes, expected {expected}")]
    ChunkLength {
        index: u32,
        expected: u64,
        actual: usize,
    },
}

// ── Tests ─────────────────────────────────────────────────────────────────────
