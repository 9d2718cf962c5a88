//! Tracker registry: one reassembly tracker per in-flight message id.
//!
//! Shared by every task that ingests chunks. A message id moves through
//! `unseen → assembling → complete`, and from `assembling` to evicted once
//! it has been idle past the window. Completed ids are remembered for one
//! window so late duplicates are not mistaken for a new message.
//!
//! Every multi-chunk tracker reserves its full buffer size against a shared
//! in-flight budget until it completes or is evicted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use driftnet_core::tracker::{ChunksTracker, TrackerError};
use driftnet_core::wire::{Chunk, MessageId};

/// Result of handing one chunk to the registry.
#[derive(Debug)]
pub enum Ingest {
    /// First chunk of a multi-chunk message.
    Started { total: u32 },
    /// A new chunk for a message already being assembled.
    Progress { received: u32, total: u32 },
    /// The chunk index was already recorded.
    Duplicate,
    /// The message is complete. The tracker has left the registry.
    Complete(ChunksTracker),
    /// The message was completed recently; the chunk is a late straggler.
    AlreadyDelivered,
}

#[derive(Debug)]
pub struct TrackerRegistry {
    active: DashMap<MessageId, ChunksTracker>,
    completed: DashMap<MessageId, Instant>,
    max_message_bytes: u64,
    max_in_flight_bytes: u64,
    reserved: AtomicU64,
}

pub type SharedRegistry = Arc<TrackerRegistry>;

impl TrackerRegistry {
    pub fn new(max_message_bytes: u64, max_in_flight_bytes: u64) -> Self {
        Self {
            active: DashMap::new(),
            completed: DashMap::new(),
            max_message_bytes,
            max_in_flight_bytes,
            reserved: AtomicU64::new(0),
        }
    }

    pub fn shared(max_message_bytes: u64, max_in_flight_bytes: u64) -> SharedRegistry {
        Arc::new(Self::new(max_message_bytes, max_in_flight_bytes))
    }

    /// Route `chunk` to its tracker, creating one on first sight.
    ///
    /// Appends, the completeness check and removal all happen under the
    /// entry lock, so each message completes exactly once no matter how
    /// many tasks ingest concurrently.
    pub fn ingest(&self, chunk: &Chunk) -> Result<Ingest, TrackerError> {
        let id = chunk.message_id();
        if self.completed.contains_key(&id) {
            return Ok(Ingest::AlreadyDelivered);
        }

        match self.active.entry(id) {
            Entry::Vacant(slot) => {
                // Re-check under the entry lock: a completer records the id
                // before releasing it.
                if self.completed.contains_key(&id) {
                    return Ok(Ingest::AlreadyDelivered);
                }
                if chunk.total_len() > self.max_message_bytes {
                    return Err(TrackerError::MessageTooLarge {
                        id,
                        total_len: chunk.total_len(),
                        limit: self.max_message_bytes,
                    });
                }
                if chunk.count() == 1 {
                    self.completed.insert(id, Instant::now());
                    return Ok(Ingest::Complete(ChunksTracker::new(chunk)));
                }
                self.reserve(id, chunk.total_len())?;
                let tracker = ChunksTracker::new(chunk);
                let total = tracker.expected();
                slot.insert(tracker);
                Ok(Ingest::Started { total })
            }
            Entry::Occupied(mut slot) => {
                if !slot.get_mut().append(chunk)? {
                    return Ok(Ingest::Duplicate);
                }
                let tracker = slot.get();
                if tracker.is_complete() {
                    self.completed.insert(id, Instant::now());
                    let tracker = slot.remove();
                    self.release(tracker.total_len());
                    return Ok(Ingest::Complete(tracker));
                }
                Ok(Ingest::Progress {
                    received: tracker.received(),
                    total: tracker.expected(),
                })
            }
        }
    }

    /// Drop trackers that have seen no new chunk within `window`, and forget
    /// completed ids older than it. Returns how many trackers were dropped.
    pub fn evict_idle(&self, window: Duration) -> usize {
        let mut evicted = 0;
        self.active.retain(|id, tracker| {
            let idle = tracker.last_chunk_at().elapsed() >= window;
            if idle {
                evicted += 1;
                self.release(tracker.total_len());
                tracing::debug!(
                    message_id = hex::encode(id.as_bytes()),
                    received = tracker.received(),
                    expected = tracker.expected(),
                    "evicting idle tracker"
                );
            }
            !idle
        });
        self.completed.retain(|_, at| at.elapsed() < window);
        evicted
    }

    fn reserve(&self, id: MessageId, bytes: u64) -> Result<(), TrackerError> {
        self.reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |held| {
                held.checked_add(bytes)
                    .filter(|&sum| sum <= self.max_in_flight_bytes)
            })
            .map(|_| ())
            .map_err(|_| TrackerError::InFlightBudgetExceeded {
                id,
                total_len: bytes,
                limit: self.max_in_flight_bytes,
            })
    }

    fn release(&self, bytes: u64) {
        self.reserved.fetch_sub(bytes, Ordering::AcqRel);
    }

    /// Buffer bytes currently reserved by in-flight trackers.
    pub fn in_flight_bytes(&self) -> u64 {
        self.reserved.load(Ordering::Acquire)
    }

    /// Number of messages currently being assembled.
    pub fn in_flight(&self) -> usize {
        self.active.len()
    }

    pub fn is_assembling(&self, id: &MessageId) -> bool {
        self.active.contains_key(id)
    }

    /// Missing chunk indices of an in-flight message.
    pub fn missing(&self, id: &MessageId) -> Option<Vec<u32>> {
        self.active.get(id).map(|t| t.missing())
    }
}
