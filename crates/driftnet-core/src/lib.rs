//! driftnet-core: array codec, envelope, chunk wire format, splitting and
//! reassembly. Pure and synchronous; the services crate adds transport.

pub mod array;
pub mod codec;
pub mod config;
pub mod envelope;
pub mod splitter;
pub mod tracker;
pub mod wire;

pub use array::{DType, Element, NumericArray, Order};
pub use codec::{CodecError, Compression};
pub use config::{ConfigError, DriftnetConfig};
pub use envelope::{ArrayMessage, EnvelopeError, MessageEnvelope, UpdateKind};
pub use splitter::{split, SplitError};
pub use tracker::{ChunksTracker, TrackerError};
pub use wire::{Chunk, MessageId, WireError, MAX_CHUNK_PAYLOAD};
