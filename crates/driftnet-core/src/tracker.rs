//! Per-message reassembly.
//!
//! A `ChunksTracker` owns a buffer sized to the whole envelope and writes
//! each chunk straight to its offset, so arrival order does not matter.
//! Duplicates are detected with a per-index bitset and ignored.

use std::time::Instant;

use crate::codec::CodecError;
use crate::envelope::{ArrayMessage, EnvelopeError, MessageEnvelope};
use crate::wire::{Chunk, MessageId};

#[derive(Debug)]
pub struct ChunksTracker {
    id: MessageId,
    count: u32,
    stride: u32,
    total_len: u64,
    received: Vec<u64>,
    received_count: u32,
    buf: Vec<u8>,
    started_at: Instant,
    last_chunk_at: Instant,
}

impl ChunksTracker {
    /// Start tracking the message `first` belongs to, recording `first` itself.
    ///
    /// `first` may be any chunk of the message; its header carries the full
    /// geometry.
    pub fn new(first: &Chunk) -> Self {
        let now = Instant::now();
        let mut tracker = Self {
            id: first.message_id(),
            count: first.count(),
            stride: first.stride(),
            total_len: first.total_len(),
            received: vec![0u64; (first.count() as usize).div_ceil(64)],
            received_count: 0,
            buf: vec![0u8; first.total_len() as usize],
            started_at: now,
            last_chunk_at: now,
        };
        tracker.write(first);
        tracker
    }

    /// Record `chunk`.
    ///
    /// Returns `Ok(true)` if the index was new, `Ok(false)` for a duplicate,
    /// which leaves the tracker untouched.
    pub fn append(&mut self, chunk: &Chunk) -> Result<bool, TrackerError> {
        if chunk.message_id() != self.id {
            return Err(TrackerError::ChunkIdMismatch {
                expected: self.id,
                got: chunk.message_id(),
            });
        }
        if chunk.count() != self.count {
            return Err(TrackerError::ChunkCountMismatch {
                id: self.id,
                expected: self.count,
                got: chunk.count(),
            });
        }
        if chunk.stride() != self.stride || chunk.total_len() != self.total_len {
            return Err(TrackerError::ChunkGeometryMismatch { id: self.id });
        }
        if self.has(chunk.index()) {
            return Ok(false);
        }
        self.write(chunk);
        Ok(true)
    }

    // Chunk geometry was validated at construction and matches ours, so the
    // payload lands fully inside `buf`.
    fn write(&mut self, chunk: &Chunk) {
        let start = chunk.offset() as usize;
        let end = start + chunk.payload().len();
        self.buf[start..end].copy_from_slice(chunk.payload());
        let i = chunk.index() as usize;
        self.received[i / 64] |= 1 << (i % 64);
        self.received_count += 1;
        self.last_chunk_at = Instant::now();
    }

    fn has(&self, index: u32) -> bool {
        let i = index as usize;
        self.received[i / 64] & (1 << (i % 64)) != 0
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Number of chunks the message consists of.
    pub fn expected(&self) -> u32 {
        self.count
    }

    /// Number of distinct chunk indices received so far.
    pub fn received(&self) -> u32 {
        self.received_count
    }

    pub fn is_complete(&self) -> bool {
        self.received_count == self.count
    }

    /// Indices not yet received, ascending.
    pub fn missing(&self) -> Vec<u32> {
        (0..self.count).filter(|&i| !self.has(i)).collect()
    }

    /// Size of the reassembly buffer.
    pub fn total_len(&self) -> u64 {
        self.total_len
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn last_chunk_at(&self) -> Instant {
        self.last_chunk_at
    }

    /// The reassembled envelope bytes. Only available once complete.
    pub fn assembled(&self) -> Result<&[u8], TrackerError> {
        if !self.is_complete() {
            return Err(self.incomplete());
        }
        Ok(&self.buf)
    }

    /// Deserialize the reassembled envelope without decoding its payload.
    pub fn envelope(&self) -> Result<MessageEnvelope, TrackerError> {
        Ok(MessageEnvelope::from_bytes(self.assembled()?)?)
    }

    /// Deserialize and decode the reassembled message.
    pub fn get_message(&self) -> Result<ArrayMessage, TrackerError> {
        Ok(self.envelope()?.into_message()?)
    }

    fn incomplete(&self) -> TrackerError {
        TrackerError::IncompleteMessage {
            id: self.id,
            received: self.received_count,
            expected: self.count,
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("chunk for message {got} appended to tracker for {expected}")]
    ChunkIdMismatch { expected: MessageId, got: MessageId },

    #[error("message {id}: chunk declares {got} chunks, tracker expects {expected}")]
    ChunkCountMismatch {
        id: MessageId,
        expected: u32,
        got: u32,
    },

    #[error("message {id}: chunk stride or total length differs from earlier chunks")]
    ChunkGeometryMismatch { id: MessageId },

    #[error("message {id}: {received} of {expected} chunks received")]
    IncompleteMessage {
        id: MessageId,
        received: u32,
        expected: u32,
    },

    #[error("message {id}: {total_len} bytes exceeds reassembly limit of {limit}")]
    MessageTooLarge {
        id: MessageId,
        total_len: u64,
        limit: u64,
    },

    #[error("message {id}: {total_len} more bytes would exceed the in-flight budget of {limit}")]
    InFlightBudgetExceeded {
        id: MessageId,
        total_len: u64,
        limit: u64,
    },

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}
