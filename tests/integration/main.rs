//! driftnet integration test harness.
//!
//! Everything runs in-process: loopback UDP for the real socket path, and
//! in-memory channels wrapped in a fault-injecting sink for loss, reordering
//! and duplication.
//!
//!   cargo test --test integration

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use driftnet_core::array::NumericArray;
use driftnet_core::config::ReassemblyConfig;
use driftnet_services::{ChunkSink, Delivery, ReceiveStats, SharedRegistry, Subscriber};

mod concurrency;
mod loopback;
mod timeout;

// ── Harness ───────────────────────────────────────────────────────────────────

/// How long a test waits for a delivery before failing.
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// The 10×1000 gradient used throughout: 10000 values from 1 to 100000.
pub fn gradient() -> NumericArray {
    NumericArray::linspace(1.0, 100_000.0, 10_000)
        .reshape(vec![10, 1_000])
        .expect("10×1000 matches 10000 elements")
}

/// A running subscriber fed through an in-memory channel.
pub struct Harness {
    pub inbound: mpsc::Sender<Bytes>,
    pub deliveries: mpsc::Receiver<Delivery>,
    pub stats: Arc<ReceiveStats>,
    pub registry: SharedRegistry,
    pub shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl Harness {
    pub fn start(config: ReassemblyConfig) -> Self {
        let stats = Arc::new(ReceiveStats::new());
        let (subscriber, deliveries) = Subscriber::new(&config, stats.clone());
        let registry = subscriber.registry();
        let (inbound, inbound_rx) = mpsc::channel(4_096);
        let (shutdown, _) = broadcast::channel(1);
        let task = tokio::spawn(subscriber.run(inbound_rx, shutdown.subscribe()));
        Self {
            inbound,
            deliveries,
            stats,
            registry,
            shutdown,
            task,
        }
    }

    pub async fn next_delivery(&mut self) -> Result<Delivery> {
        next_delivery(&mut self.deliveries).await
    }

    /// Assert nothing arrives within `wait`.
    pub async fn expect_silence(&mut self, wait: Duration) {
        if let Ok(Some(d)) = tokio::time::timeout(wait, self.deliveries.recv()).await {
            panic!("unexpected delivery: {d:?}");
        }
    }

    pub async fn stop(self) -> Result<()> {
        let _ = self.shutdown.send(());
        tokio::time::timeout(DELIVERY_TIMEOUT, self.task)
            .await
            .context("subscriber did not stop")?
            .context("subscriber task panicked")
    }
}

pub async fn next_delivery(rx: &mut mpsc::Receiver<Delivery>) -> Result<Delivery> {
    tokio::time::timeout(DELIVERY_TIMEOUT, rx.recv())
        .await
        .context("timed out waiting for a delivery")?
        .context("delivery channel closed")
}

/// Poll `cond` until it holds or `limit` passes.
pub async fn eventually(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

// ── Fault injection ───────────────────────────────────────────────────────────

/// A sink that holds datagrams back, then releases them shuffled, with
/// seeded random loss and duplication.
pub struct ChaosSink {
    inner: mpsc::Sender<Bytes>,
    rng: Mutex<StdRng>,
    drop_pct: u32,
    dup_pct: u32,
    skip: Option<usize>,
    seen: Mutex<usize>,
    held: Mutex<Vec<Bytes>>,
    dropped: Mutex<Vec<Bytes>>,
}

impl ChaosSink {
    pub fn new(inner: mpsc::Sender<Bytes>, seed: u64) -> Self {
        Self {
            inner,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            drop_pct: 0,
            dup_pct: 0,
            skip: None,
            seen: Mutex::new(0),
            held: Mutex::new(Vec::new()),
            dropped: Mutex::new(Vec::new()),
        }
    }

    pub fn drop_pct(mut self, pct: u32) -> Self {
        self.drop_pct = pct;
        self
    }

    pub fn dup_pct(mut self, pct: u32) -> Self {
        self.dup_pct = pct;
        self
    }

    /// Always lose the `n`th datagram (0-based) handed to this sink.
    pub fn skip(mut self, n: usize) -> Self {
        self.skip = Some(n);
        self
    }

    /// Datagrams the sink has lost so far.
    pub fn dropped(&self) -> Vec<Bytes> {
        self.dropped.lock().unwrap().clone()
    }

    /// Release everything held, in shuffled order.
    pub async fn flush(&self) -> Result<usize> {
        let mut batch = std::mem::take(&mut *self.held.lock().unwrap());
        batch.shuffle(&mut *self.rng.lock().unwrap());
        let n = batch.len();
        for d in batch {
            self.inner.send(d).await.context("subscriber inbound closed")?;
        }
        Ok(n)
    }
}

impl ChunkSink for ChaosSink {
    async fn send_datagram(&self, datagram: &[u8]) -> std::io::Result<()> {
        let datagram = Bytes::copy_from_slice(datagram);
        let index = {
            let mut seen = self.seen.lock().unwrap();
            *seen += 1;
            *seen - 1
        };
        let (lose, duplicate) = {
            let mut rng = self.rng.lock().unwrap();
            (
                rng.gen_range(0..100) < self.drop_pct,
                rng.gen_range(0..100) < self.dup_pct,
            )
        };

        if lose || self.skip == Some(index) {
            self.dropped.lock().unwrap().push(datagram);
            return Ok(());
        }
        let mut held = self.held.lock().unwrap();
        if duplicate {
            held.push(datagram.clone());
        }
        held.push(datagram);
        Ok(())
    }
}
