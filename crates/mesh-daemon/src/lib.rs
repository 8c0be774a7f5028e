//! mesh-daemon library: WebSocket transport for mesh-core.
//!
//! This is a thin library layer over the daemon components,
//! allowing integration tests to access internal types.

pub mod chat;
pub mod connection;
pub mod message;
pub mod outgoing;
pub mod server;
pub mod transport;

// Re-export key types for convenience
pub use chat::ChatMessage;
pub use connection::LinkTable;
pub use message::{Frame, MAX_MESSAGE_SIZE};
pub use transport::WsTransport;
