//! Connection lifecycle: Pending -> Open -> Closed.
//!
//! A [`Link`] is owned by the [`LifecycleController`] while it is pending.
//! Opening it moves it out of the controller so the caller can hand it to the
//! registry; closing a pending link drops it. Each transition can happen once,
//! which is what keeps admission and eviction from firing twice for the same
//! connection.

use crate::protocol::ConnectMetadata;
use crate::registry::{ConnectionDirection, ConnectionRegistry};
use crate::transport::ConnectionId;
use crate::PeerId;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use web_time::Instant;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("Invalid transition for {conn}: {from:?} -> {to:?}")]
    InvalidTransition {
        conn: ConnectionId,
        from: LinkState,
        to: LinkState,
    },
}

/// State of a single connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LinkState {
    /// Dial issued or request received, not yet open
    Pending,
    /// Both sides can exchange data
    Open,
    /// Closed by either side, or failed
    Closed,
}

/// A connection moving through its lifecycle.
#[derive(Debug, Clone)]
pub struct Link {
    pub conn: ConnectionId,
    pub remote: PeerId,
    pub direction: ConnectionDirection,
    /// Peers the remote side already knows about: the metadata it sent us
    /// (incoming) or the snapshot we sent it when dialing (outgoing).
    pub known_by_remote: Vec<PeerId>,
    state: LinkState,
    created_at: Instant,
}

impl Link {
    /// A link we dialed, carrying the snapshot sent as connect metadata.
    pub fn outgoing(conn: ConnectionId, remote: PeerId, snapshot: Vec<PeerId>) -> Self {
        Self::new(conn, remote, ConnectionDirection::Outgoing, snapshot)
    }

    /// A link the remote side dialed, carrying its connect metadata.
    pub fn incoming(conn: ConnectionId, remote: PeerId, metadata: Option<ConnectMetadata>) -> Self {
        let peers = metadata.map(|m| m.peers).unwrap_or_default();
        Self::new(conn, remote, ConnectionDirection::Incoming, peers)
    }

    fn new(
        conn: ConnectionId,
        remote: PeerId,
        direction: ConnectionDirection,
        known_by_remote: Vec<PeerId>,
    ) -> Self {
        Self {
            conn,
            remote,
            direction,
            known_by_remote,
            state: LinkState::Pending,
            created_at: Instant::now(),
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Time since the link was created.
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    /// Pending -> Open.
    pub fn open(&mut self) -> Result<(), LifecycleError> {
        self.transition(LinkState::Open)
    }

    /// Pending | Open -> Closed.
    pub fn close(&mut self) -> Result<(), LifecycleError> {
        self.transition(LinkState::Closed)
    }

    fn transition(&mut self, to: LinkState) -> Result<(), LifecycleError> {
        let allowed = matches!(
            (self.state, to),
            (LinkState::Pending, LinkState::Open)
                | (LinkState::Pending, LinkState::Closed)
                | (LinkState::Open, LinkState::Closed)
        );
        if !allowed {
            return Err(LifecycleError::InvalidTransition {
                conn: self.conn,
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }
}

/// Why a dial was not issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Identity not assigned yet
    NoIdentity,
    /// Target is our own peer ID
    SelfDial,
    /// Target is already in the swarm
    AlreadyConnected,
    /// An outgoing dial to the target is still pending
    AlreadyDialing,
}

/// Outcome of the outgoing guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialDecision {
    /// Dial with this metadata
    Dial(ConnectMetadata),
    Skip(SkipReason),
}

/// Outcome of the incoming guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingDecision {
    Accept,
    Reject(SkipReason),
}

/// Tracks pending links and applies the dial/accept guards.
#[derive(Debug, Default)]
pub struct LifecycleController {
    pending: HashMap<ConnectionId, Link>,
}

impl LifecycleController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether to dial `target`.
    ///
    /// The metadata is a snapshot of the swarm before this connection exists.
    pub fn plan_outgoing(&self, registry: &ConnectionRegistry, target: &PeerId) -> DialDecision {
        let Some(local) = registry.local_peer_id() else {
            return DialDecision::Skip(SkipReason::NoIdentity);
        };
        if local == target {
            return DialDecision::Skip(SkipReason::SelfDial);
        }
        if registry.contains(target) {
            return DialDecision::Skip(SkipReason::AlreadyConnected);
        }
        if self.is_dialing(target) {
            return DialDecision::Skip(SkipReason::AlreadyDialing);
        }
        DialDecision::Dial(ConnectMetadata::new(registry.current_peers()))
    }

    /// Decide whether to accept a connection request from `remote`.
    pub fn plan_incoming(&self, registry: &ConnectionRegistry, remote: &PeerId) -> IncomingDecision {
        let Some(local) = registry.local_peer_id() else {
            return IncomingDecision::Reject(SkipReason::NoIdentity);
        };
        if local == remote {
            return IncomingDecision::Reject(SkipReason::SelfDial);
        }
        if registry.contains(remote) {
            return IncomingDecision::Reject(SkipReason::AlreadyConnected);
        }
        IncomingDecision::Accept
    }

    /// Start tracking a pending link.
    pub fn track(&mut self, link: Link) {
        self.pending.insert(link.conn, link);
    }

    /// Whether an outgoing dial to `peer` is pending.
    pub fn is_dialing(&self, peer: &PeerId) -> bool {
        self.pending
            .values()
            .any(|l| l.direction == ConnectionDirection::Outgoing && &l.remote == peer)
    }

    pub fn pending_link(&self, conn: ConnectionId) -> Option<&Link> {
        self.pending.get(&conn)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Open a pending link, handing ownership to the caller.
    ///
    /// `None` for unknown connections, including ones already opened.
    pub fn open(&mut self, conn: ConnectionId) -> Option<Link> {
        let mut link = self.pending.remove(&conn)?;
        link.open().ok()?;
        Some(link)
    }

    /// Close a pending link. `None` if it isn't pending.
    pub fn close(&mut self, conn: ConnectionId) -> Option<Link> {
        let mut link = self.pending.remove(&conn)?;
        link.close().ok()?;
        Some(link)
    }

    /// Pending links older than `timeout`.
    pub fn expired(&self, now: Instant, timeout: Duration) -> Vec<ConnectionId> {
        let mut expired: Vec<_> = self
            .pending
            .values()
            .filter(|l| l.age(now) >= timeout)
            .map(|l| l.conn)
            .collect();
        expired.sort();
        expired
    }
}
