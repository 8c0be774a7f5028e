//! Media attachment for mesh links.
//!
//! When a link opens, the mesh can ask a [`MediaCapture`] for a local media
//! handle and offer it to the remote side. Acquisition is optional and may
//! fail (no device, permission denied); failures never affect membership.

use crate::transport::ConnectionId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Media permission denied")]
    PermissionDenied,
    #[error("No media device available")]
    NoDevice,
    #[error("Media unavailable: {0}")]
    Unavailable(String),
}

/// Opaque media handle produced by a capture device.
///
/// The mesh only moves it around; its content is up to the capture side and
/// whoever renders it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MediaHandle(serde_json::Value);

impl MediaHandle {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }
}

/// Source of local media handles.
#[async_trait]
pub trait MediaCapture: Send + Sync {
    /// Acquire a handle. No completion deadline is implied.
    async fn acquire(&self) -> Result<MediaHandle, MediaError>;
}

/// Outcome of an acquisition started for a specific link.
#[derive(Debug)]
pub struct MediaAcquired {
    pub conn: ConnectionId,
    pub result: Result<MediaHandle, MediaError>,
}

/// Per-link bookkeeping so each link carries at most one outbound offer and
/// surfaces at most one inbound offer.
#[derive(Debug, Default)]
pub struct MediaLinks {
    requested: HashSet<ConnectionId>,
    offered: HashSet<ConnectionId>,
    received: HashSet<ConnectionId>,
}

impl MediaLinks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark that acquisition was started for a link. False if it already was.
    pub fn begin_request(&mut self, conn: ConnectionId) -> bool {
        self.requested.insert(conn)
    }

    /// Claim the single outbound offer for a link. False if already used or
    /// the link was never requested (e.g. it closed in the meantime).
    pub fn claim_outbound(&mut self, conn: ConnectionId) -> bool {
        self.requested.contains(&conn) && self.offered.insert(conn)
    }

    /// Claim the single inbound offer for a link. False on repeats.
    pub fn claim_inbound(&mut self, conn: ConnectionId) -> bool {
        self.received.insert(conn)
    }

    /// Drop all state for a closed link.
    pub fn forget(&mut self, conn: ConnectionId) {
        self.requested.remove(&conn);
        self.offered.remove(&conn);
        self.received.remove(&conn);
    }
}
