//! mesh-core: self-organizing full-mesh membership for peer-to-peer swarms.
//!
//! This crate provides the core functionality for:
//! - Tracking which peers a participant is connected to
//! - Guarding connection setup against self links and duplicates
//! - Gossiping peer lists so every participant ends up linked to every other
//! - Broadcasting application messages and attaching local media to links
//! - A `Transport` trait abstraction, with an in-process implementation

pub mod config;
pub mod discovery;
pub mod events;
pub mod lifecycle;
pub mod media;
pub mod memory;
pub mod node;
pub mod peer_id;
pub mod protocol;
pub mod registry;
pub mod swarm;
pub mod transport;

pub use config::{ConfigError, MeshConfig};
pub use events::{EventBus, EventStream, MeshEvent, Subscription};
pub use lifecycle::SkipReason;
pub use media::{MediaCapture, MediaError, MediaHandle};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use node::{MeshHandle, MeshNode};
pub use peer_id::{PeerId, PeerIdError};
pub use protocol::ConnectMetadata;
pub use registry::{ConnectionDirection, ConnectionRegistry, Member};
pub use swarm::{DialOutcome, MeshError, Swarm};
pub use transport::{ConnectionId, Transport, TransportError, TransportEvent};
