//! Transport trait for peer-to-peer connections.
//!
//! The mesh never touches sockets. A transport establishes point-to-point
//! channels and reports what happens to them as [`TransportEvent`]s; the mesh
//! reacts to those events and calls back into the transport.
//!
//! Implementations:
//! - In-process: [`crate::memory::MemoryNetwork`] (tests, embedding)
//! - WebSocket: `mesh-daemon`

use crate::protocol::ConnectMetadata;
use crate::PeerId;
use serde::Serialize;
use std::fmt::{self, Display, Formatter};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Transport closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Handle for one connection, assigned by the transport.
///
/// Only meaningful to the transport that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Something that happened at the transport level.
///
/// Per connection, `Open`, `Close` and `Error` are reported at most once
/// each; `Data` may recur.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Signaling finished; this is our identity for the rest of the process
    Identity(PeerId),
    /// A remote peer dialed us. Not open until we call [`Transport::accept`].
    Incoming {
        conn: ConnectionId,
        remote: PeerId,
        metadata: Option<ConnectMetadata>,
    },
    /// The connection is ready for data
    Open { conn: ConnectionId },
    /// Either side closed the connection
    Close { conn: ConnectionId },
    /// The connection failed; terminal
    Error { conn: ConnectionId, message: String },
    /// A payload arrived
    Data {
        conn: ConnectionId,
        payload: serde_json::Value,
    },
}

/// Point-to-point transport used by the mesh.
///
/// Every method is fire-and-forget and must not block: results show up later
/// as [`TransportEvent`]s on the stream that accompanies the transport.
pub trait Transport: Send + Sync {
    /// Start dialing a peer, attaching connect-time metadata.
    fn dial(&self, peer: &PeerId, metadata: ConnectMetadata) -> Result<ConnectionId>;

    /// Accept an incoming connection request.
    fn accept(&self, conn: ConnectionId) -> Result<()>;

    /// Queue a payload on a connection.
    fn send(&self, conn: ConnectionId, payload: &serde_json::Value) -> Result<()>;

    /// Close (or reject) a connection. Unknown connections are ignored.
    fn close(&self, conn: ConnectionId);
}
