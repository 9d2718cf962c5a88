//! Publisher: encode, split, and send one array per call.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use driftnet_core::array::NumericArray;
use driftnet_core::codec::{CodecError, Compression};
use driftnet_core::config::{ConfigError, TransportConfig};
use driftnet_core::envelope::{MessageEnvelope, UpdateKind};
use driftnet_core::splitter::{split, SplitError};
use driftnet_core::wire::{MessageId, MAX_CHUNK_PAYLOAD};

use crate::transport::ChunkSink;

const INITIAL_BACKOFF: Duration = Duration::from_millis(1);
const MAX_BACKOFF: Duration = Duration::from_millis(100);

/// How the receiver should apply the published array.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PublishKind {
    #[default]
    WholeArray,
    Partial { offset: u64, dimensions: Vec<u32> },
}

impl From<PublishKind> for UpdateKind {
    fn from(kind: PublishKind) -> Self {
        match kind {
            PublishKind::WholeArray => UpdateKind::WholeArray,
            PublishKind::Partial { offset, dimensions } => UpdateKind::Partial { offset, dimensions },
        }
    }
}

/// Proof that every chunk of a message was handed to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishReceipt {
    pub id: MessageId,
    pub chunks: u32,
    /// Serialized envelope size.
    pub bytes: usize,
    /// Transient send failures that were retried.
    pub retries: u32,
}

/// Sends arrays through a shared sink. Cheap to share across tasks: all
/// methods take `&self`.
#[derive(Debug)]
pub struct Publisher<S> {
    sink: Arc<S>,
    compression: Compression,
    max_chunk_bytes: usize,
    retry_timeout: Duration,
}

impl<S: ChunkSink> Publisher<S> {
    pub fn new(
        sink: Arc<S>,
        compression: Compression,
        max_chunk_bytes: usize,
        retry_timeout: Duration,
    ) -> Result<Self, PublishError> {
        if max_chunk_bytes == 0 || max_chunk_bytes > MAX_CHUNK_PAYLOAD {
            return Err(PublishError::Split(SplitError::InvalidChunkSize(max_chunk_bytes)));
        }
        Ok(Self {
            sink,
            compression,
            max_chunk_bytes,
            retry_timeout,
        })
    }

    pub fn from_config(sink: Arc<S>, config: &TransportConfig) -> Result<Self, PublishError> {
        Self::new(
            sink,
            config.compression()?,
            config.max_chunk_bytes,
            config.publish_retry_timeout(),
        )
    }

    pub fn sink(&self) -> &Arc<S> {
        &self.sink
    }

    /// Encode `array` as one message and send all of its chunks.
    ///
    /// Success means every chunk was accepted by the sink, not that the
    /// peer received it. Transient sink errors are retried with capped
    /// exponential backoff until the retry timeout, measured from the
    /// start of this call, runs out. A send still pending at the deadline
    /// is abandoned.
    pub async fn publish(
        &self,
        array: &NumericArray,
        kind: PublishKind,
    ) -> Result<PublishReceipt, PublishError> {
        let envelope = MessageEnvelope::build(array, kind.into(), self.compression)?;
        let id = envelope.id();
        let bytes = envelope.encoded_len();
        let chunks = split(&envelope, self.max_chunk_bytes)?;
        let total = chunks.len() as u32;
        let deadline = Instant::now() + self.retry_timeout;

        let mut retries = 0;
        for (sent, chunk) in chunks.iter().enumerate() {
            let datagram = chunk.encode();
            retries += self
                .send_with_retry(&datagram, deadline)
                .await
                .map_err(|e| match e {
                    SendFailure::Timeout => PublishError::PublishTimeout {
                        id,
                        sent: sent as u32,
                        total,
                    },
                    SendFailure::Io(source) => PublishError::Send {
                        id,
                        index: chunk.index(),
                        source,
                    },
                })?;
        }

        tracing::debug!(
            message_id = hex::encode(id.as_bytes()),
            chunks = total,
            bytes,
            retries,
            compression = %self.compression,
            "message published"
        );

        Ok(PublishReceipt {
            id,
            chunks: total,
            bytes,
            retries,
        })
    }

    async fn send_with_retry(&self, datagram: &[u8], deadline: Instant) -> Result<u32, SendFailure> {
        let mut backoff = INITIAL_BACKOFF;
        let mut retries = 0;
        loop {
            let Ok(sent) =
                tokio::time::timeout_at(deadline, self.sink.send_datagram(datagram)).await
            else {
                return Err(SendFailure::Timeout);
            };
            match sent {
                Ok(()) => return Ok(retries),
                Err(e) if is_transient(&e) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(SendFailure::Timeout);
                    }
                    tracing::trace!(error = %e, ?backoff, "transient send failure, retrying");
                    tokio::time::sleep(backoff.min(deadline - now)).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    retries += 1;
                }
                Err(e) => return Err(SendFailure::Io(e)),
            }
        }
    }
}

enum SendFailure {
    Timeout,
    Io(io::Error),
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::OutOfMemory
    )
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("failed to encode message: {0}")]
    Encode(#[from] CodecError),

    #[error("failed to split message: {0}")]
    Split(#[from] SplitError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("message {id}: sending chunk {index} failed: {source}")]
    Send {
        id: MessageId,
        index: u32,
        #[source]
        source: io::Error,
    },

    #[error("message {id}: publish timed out after {sent} of {total} chunks")]
    PublishTimeout { id: MessageId, sent: u32, total: u32 },
}
