//! What the subscriber hands to the application, and receive-side counters.

use std::sync::atomic::{AtomicU64, Ordering};

use driftnet_core::array::NumericArray;
use driftnet_core::envelope::{ArrayMessage, UpdateKind};
use driftnet_core::wire::MessageId;

/// One event on the delivery channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// A complete whole-array update.
    Full(ArrayMessage),
    /// A complete partial update: `array` patches the target at `offset`
    /// along `dimensions`.
    Partial {
        id: MessageId,
        array: NumericArray,
        offset: u64,
        dimensions: Vec<u32>,
    },
    /// Reassembly progress for a message not yet complete.
    Progress {
        id: MessageId,
        received: u32,
        total: u32,
    },
}

impl Delivery {
    pub fn id(&self) -> MessageId {
        match self {
            Delivery::Full(msg) => msg.id,
            Delivery::Partial { id, .. } | Delivery::Progress { id, .. } => *id,
        }
    }
}

impl From<ArrayMessage> for Delivery {
    fn from(msg: ArrayMessage) -> Self {
        match msg.kind {
            UpdateKind::WholeArray => Delivery::Full(msg),
            UpdateKind::Partial { offset, dimensions } => Delivery::Partial {
                id: msg.id,
                array: msg.array,
                offset,
                dimensions,
            },
        }
    }
}

/// Receive-side counters, shared between the subscriber and whoever reports.
#[derive(Debug, Default)]
pub struct ReceiveStats {
    datagrams: AtomicU64,
    malformed: AtomicU64,
    rejected: AtomicU64,
    duplicates: AtomicU64,
    delivered: AtomicU64,
    undecodable: AtomicU64,
    evicted: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub datagrams: u64,
    /// Datagrams that did not parse as a chunk.
    pub malformed: u64,
    /// Well-formed chunks refused by a tracker.
    pub rejected: u64,
    pub duplicates: u64,
    pub delivered: u64,
    /// Complete messages whose envelope or payload failed to decode.
    pub undecodable: u64,
    pub evicted: u64,
}

impl ReceiveStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn datagram(&self) {
        self.datagrams.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn undecodable(&self) {
        self.undecodable.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn evicted(&self, n: usize) {
        self.evicted.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            datagrams: self.datagrams.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            undecodable: self.undecodable.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }

    /// Log current counters. Quiet until the first datagram arrives.
    pub fn log(&self) {
        let s = self.snapshot();
        if s.datagrams == 0 {
            return;
        }
        tracing::info!(
            datagrams = s.datagrams,
            malformed = s.malformed,
            rejected = s.rejected,
            duplicates = s.duplicates,
            delivered = s.delivered,
            undecodable = s.undecodable,
            evicted = s.evicted,
            "receive stats"
        );
    }
}
