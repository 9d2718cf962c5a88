//! Subscriber: turns a stream of chunk datagrams into deliveries.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};

use driftnet_core::config::ReassemblyConfig;
use driftnet_core::tracker::ChunksTracker;
use driftnet_core::wire::{Chunk, MessageId};

use crate::delivery::{Delivery, ReceiveStats};
use crate::registry::{Ingest, SharedRegistry, TrackerRegistry};

pub struct Subscriber {
    registry: SharedRegistry,
    deliveries: mpsc::Sender<Delivery>,
    stats: Arc<ReceiveStats>,
    idle_eviction: Duration,
    notify_progress: bool,
}

impl Subscriber {
    /// Build a subscriber and the receiving end of its delivery channel.
    pub fn new(
        config: &ReassemblyConfig,
        stats: Arc<ReceiveStats>,
    ) -> (Self, mpsc::Receiver<Delivery>) {
        let (tx, rx) = mpsc::channel(config.delivery_queue.max(1));
        let subscriber = Self {
            registry: TrackerRegistry::shared(
                config.max_message_bytes,
                config.max_in_flight_bytes,
            ),
            deliveries: tx,
            stats,
            idle_eviction: config.idle_eviction(),
            notify_progress: config.notify_progress,
        };
        (subscriber, rx)
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    /// Consume `inbound` until shutdown, until the inbound channel closes, or
    /// until the delivery receiver is dropped. Trackers still assembling
    /// when the loop ends are abandoned.
    pub async fn run(
        self,
        mut inbound: mpsc::Receiver<Bytes>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut sweep = tokio::time::interval(sweep_period(self.idle_eviction));

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!(
                        in_flight = self.registry.in_flight(),
                        "subscriber shutting down"
                    );
                    return;
                }

                datagram = inbound.recv() => {
                    let Some(datagram) = datagram else {
                        tracing::info!("inbound channel closed, subscriber exiting");
                        return;
                    };
                    if !self.handle_datagram(datagram).await {
                        tracing::info!("delivery receiver dropped, subscriber exiting");
                        return;
                    }
                }

                _ = sweep.tick() => {
                    let evicted = self.registry.evict_idle(self.idle_eviction);
                    if evicted > 0 {
                        self.stats.evicted(evicted);
                        tracing::debug!(evicted, "idle trackers evicted");
                    }
                }
            }
        }
    }

    /// Process one datagram. Returns false once nobody is listening for
    /// deliveries.
    pub async fn handle_datagram(&self, datagram: Bytes) -> bool {
        self.stats.datagram();

        let chunk = match Chunk::decode(datagram) {
            Ok(c) => c,
            Err(e) => {
                self.stats.malformed();
                tracing::trace!(error = %e, "malformed chunk, discarding");
                return true;
            }
        };
        let id = chunk.message_id();

        match self.registry.ingest(&chunk) {
            Ok(Ingest::Started { total }) => self.progress(id, 1, total).await,
            Ok(Ingest::Progress { received, total }) => self.progress(id, received, total).await,
            Ok(Ingest::Duplicate) | Ok(Ingest::AlreadyDelivered) => {
                self.stats.duplicate();
                tracing::debug!(
                    message_id = hex::encode(id.as_bytes()),
                    index = chunk.index(),
                    "duplicate chunk ignored"
                );
                true
            }
            Ok(Ingest::Complete(tracker)) => self.complete(tracker).await,
            Err(e) => {
                self.stats.rejected();
                tracing::warn!(
                    message_id = hex::encode(id.as_bytes()),
                    index = chunk.index(),
                    error = %e,
                    "chunk rejected"
                );
                true
            }
        }
    }

    async fn progress(&self, id: MessageId, received: u32, total: u32) -> bool {
        if !self.notify_progress {
            return true;
        }
        self.deliver(Delivery::Progress {
            id,
            received,
            total,
        })
        .await
    }

    async fn complete(&self, tracker: ChunksTracker) -> bool {
        let id = tracker.id();
        let message = match tracker.get_message() {
            Ok(m) => m,
            Err(e) => {
                self.stats.undecodable();
                tracing::warn!(
                    message_id = hex::encode(id.as_bytes()),
                    error = %e,
                    "reassembled message failed to decode"
                );
                return true;
            }
        };

        self.stats.delivered();
        tracing::info!(
            message_id = hex::encode(id.as_bytes()),
            chunks = tracker.expected(),
            bytes = tracker.total_len(),
            shape = ?message.array.shape(),
            dtype = %message.array.dtype(),
            elapsed_ms = tracker.started_at().elapsed().as_millis() as u64,
            "message delivered"
        );
        self.deliver(Delivery::from(message)).await
    }

    // Awaiting here lets a slow consumer push back on intake.
    async fn deliver(&self, delivery: Delivery) -> bool {
        self.deliveries.send(delivery).await.is_ok()
    }
}

fn sweep_period(idle_eviction: Duration) -> Duration {
    (idle_eviction / 2).clamp(Duration::from_millis(10), Duration::from_secs(1))
}
