//! Mainline networking: identity, envelopes, routing, transport, processors.

pub mod envelope;
pub mod identity;
pub mod peer_cache;
pub mod processors;
pub mod routing;
pub mod senders;
pub mod transport;

pub use envelope::{Envelope, EnvelopeKind};
pub use identity::{parse_id, Identity, MinPeer, Peer};
pub use peer_cache::{PeerCache, PeerFlags};
pub use routing::{PeerEntry, RoutingTable, BUCKET_CAPACITY, BUCKET_COUNT};
pub use transport::Transport;
