//! Message splitter: cuts a serialized envelope into datagram-sized chunks.

use bytes::Bytes;

use crate::envelope::MessageEnvelope;
use crate::wire::{Chunk, MessageId, WireError};

/// Serialize `envelope` and split it into chunks of at most `max_chunk_bytes`.
///
/// Chunks are returned in index order. Every chunk but the last carries
/// exactly `max_chunk_bytes`; an envelope that fits in one chunk still
/// produces a single-element vector.
pub fn split(envelope: &MessageEnvelope, max_chunk_bytes: usize) -> Result<Vec<Chunk>, SplitError> {
    split_bytes(envelope.id(), envelope.to_bytes(), max_chunk_bytes)
}

/// Split an already-serialized buffer under `id`.
///
/// Any positive `max_chunk_bytes` that fits a `u32` is accepted. Whether a
/// chunk fits one datagram is the transport's concern.
pub fn split_bytes(
    id: MessageId,
    buf: Bytes,
    max_chunk_bytes: usize,
) -> Result<Vec<Chunk>, SplitError> {
    let stride = u32::try_from(max_chunk_bytes)
        .ok()
        .filter(|&s| s > 0)
        .ok_or(SplitError::InvalidChunkSize(max_chunk_bytes))?;
    if buf.is_empty() {
        return Err(SplitError::Empty);
    }

    let count = chunk_count(buf.len(), max_chunk_bytes);
    let count = u32::try_from(count).map_err(|_| SplitError::TooManyChunks(count))?;
    let total_len = buf.len() as u64;

    (0..count)
        .map(|index| {
            let start = index as usize * max_chunk_bytes;
            let end = (start + max_chunk_bytes).min(buf.len());
            Chunk::new(id, index, count, stride, total_len, buf.slice(start..end))
                .map_err(SplitError::Wire)
        })
        .collect()
}

/// Number of chunks needed for `len` bytes at `max_chunk_bytes` per chunk.
pub fn chunk_count(len: usize, max_chunk_bytes: usize) -> usize {
    len.div_ceil(max_chunk_bytes)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SplitError {
    #[error("invalid chunk size {0}: must be between 1 and {}", u32::MAX)]
    InvalidChunkSize(usize),

    #[error("cannot split an empty buffer")]
    Empty,

    #[error("message needs {0} chunks, more than a chunk header can count")]
    TooManyChunks(usize),

    #[error(transparent)]
    Wire(WireError),
}
