//! driftnet-services: async transport around the core codec. Publishing
//! over a datagram sink, and reassembling inbound chunks into deliveries.

pub mod delivery;
pub mod publisher;
pub mod registry;
pub mod subscriber;
pub mod transport;

pub use delivery::{Delivery, ReceiveStats, StatsSnapshot};
pub use publisher::{PublishError, PublishKind, PublishReceipt, Publisher};
pub use registry::{Ingest, SharedRegistry, TrackerRegistry};
pub use subscriber::Subscriber;
pub use transport::{udp_pump, ChunkSink, UdpSink};
