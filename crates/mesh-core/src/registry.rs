//! Connection registry: the set of open connections that make up our swarm.
//!
//! `ConnectionRegistry` is the only writer of swarm membership. It is owned
//! by a single task (see [`crate::node`]), so every check-then-act sequence
//! against it is serialized without locks.

use crate::transport::ConnectionId;
use crate::PeerId;
use serde::Serialize;
use thiserror::Error;

/// Errors that can occur when admitting a connection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Already connected to {0}")]
    DuplicateMembership(PeerId),
    #[error("Refusing connection to our own peer ID {0}")]
    SelfConnection(PeerId),
}

/// Connection direction from our perspective.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionDirection {
    Incoming,
    Outgoing,
}

/// An open connection admitted into the swarm.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    /// Remote peer's identifier
    pub peer_id: PeerId,
    /// Transport handle for the connection
    pub conn: ConnectionId,
    /// Who dialed whom
    pub direction: ConnectionDirection,
    /// When the connection was admitted (ms since epoch)
    pub admitted_at: f64,
}

impl Member {
    pub fn new(peer_id: PeerId, conn: ConnectionId, direction: ConnectionDirection) -> Self {
        Self {
            peer_id,
            conn,
            direction,
            admitted_at: now_ms(),
        }
    }
}

/// Result of checking a newly opened connection against an existing one to
/// the same peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateCheckResult {
    /// No existing connection, admit normally
    NoDuplicate,
    /// Keep the existing connection, close the new one
    CloseThis,
    /// Keep the new connection, close the existing one
    CloseOther,
}

/// Decide which of two connections to the same peer survives.
///
/// Both ends must reach the same answer without talking to each other, so the
/// rule only looks at things both sides know: the connection dialed by the
/// peer with the smaller ID wins. Two connections in the same direction can't
/// be told apart that way, and the existing one is kept.
pub fn check_duplicate_connection(
    local: &PeerId,
    remote: &PeerId,
    new_direction: ConnectionDirection,
    existing_direction: Option<ConnectionDirection>,
) -> DuplicateCheckResult {
    let Some(existing_direction) = existing_direction else {
        return DuplicateCheckResult::NoDuplicate;
    };

    if existing_direction == new_direction {
        return DuplicateCheckResult::CloseThis;
    }

    let preferred = if local < remote {
        ConnectionDirection::Outgoing
    } else {
        ConnectionDirection::Incoming
    };

    if new_direction == preferred {
        DuplicateCheckResult::CloseOther
    } else {
        DuplicateCheckResult::CloseThis
    }
}

/// Registry of open connections, in admission order.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    local: Option<PeerId>,
    members: Vec<Member>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Our identity, once signaling has assigned it.
    pub fn local_peer_id(&self) -> Option<&PeerId> {
        self.local.as_ref()
    }

    /// Record our identity. Only the first assignment sticks.
    ///
    /// Returns false if an identity was already set.
    pub fn set_local_peer_id(&mut self, peer_id: PeerId) -> bool {
        if self.local.is_some() {
            return false;
        }
        self.local = Some(peer_id);
        true
    }

    /// Every connected peer followed by our own identity (if known).
    pub fn current_peers(&self) -> Vec<PeerId> {
        self.members
            .iter()
            .map(|m| m.peer_id.clone())
            .chain(self.local.iter().cloned())
            .collect()
    }

    /// Check whether a peer is part of the swarm, counting ourselves.
    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.local.as_ref() == Some(peer_id) || self.member(peer_id).is_some()
    }

    /// Open connection to a peer, if any.
    pub fn member(&self, peer_id: &PeerId) -> Option<&Member> {
        self.members.iter().find(|m| &m.peer_id == peer_id)
    }

    /// Member owning a connection handle, if any.
    pub fn member_by_conn(&self, conn: ConnectionId) -> Option<&Member> {
        self.members.iter().find(|m| m.conn == conn)
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    /// Number of open connections (not counting ourselves).
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Admit an open connection into the swarm.
    ///
    /// Re-validates the membership invariants even though callers check
    /// before dialing: no duplicate peer IDs, never ourselves.
    pub fn admit(&mut self, member: Member) -> Result<(), RegistryError> {
        if self.local.as_ref() == Some(&member.peer_id) {
            return Err(RegistryError::SelfConnection(member.peer_id));
        }
        if self.member(&member.peer_id).is_some() {
            return Err(RegistryError::DuplicateMembership(member.peer_id));
        }
        self.members.push(member);
        Ok(())
    }

    /// Remove a peer's entry if it belongs to `conn`.
    ///
    /// No-op (returns `None`) if the peer is absent or registered under a
    /// different connection, so closing a rejected duplicate can never take
    /// the surviving link with it.
    pub fn evict(&mut self, peer_id: &PeerId, conn: ConnectionId) -> Option<Member> {
        let index = self
            .members
            .iter()
            .position(|m| &m.peer_id == peer_id && m.conn == conn)?;
        Some(self.members.remove(index))
    }

    /// Remove whichever member owns `conn`. No-op if none does.
    pub fn evict_connection(&mut self, conn: ConnectionId) -> Option<Member> {
        let peer_id = self.member_by_conn(conn)?.peer_id.clone();
        self.evict(&peer_id, conn)
    }
}

fn now_ms() -> f64 {
    web_time::SystemTime::now()
        .duration_since(web_time::UNIX_EPOCH)
        .map(|d| d.as_millis() as f64)
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(s: &str) -> PeerId {
        s.parse().unwrap()
    }

    fn member(peer: &str, conn: u64) -> Member {
        Member::new(pid(peer), ConnectionId::new(conn), ConnectionDirection::Outgoing)
    }

    fn registry_as(local: &str) -> ConnectionRegistry {
        let mut registry = ConnectionRegistry::new();
        registry.set_local_peer_id(pid(local));
        registry
    }

    #[test]
    fn test_empty_registry_without_identity() {
        let registry = ConnectionRegistry::new();
        assert!(registry.current_peers().is_empty());
        assert!(registry.local_peer_id().is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_current_peers_lists_local_last() {
        let mut registry = registry_as("a");
        registry.admit(member("b", 1)).unwrap();
        registry.admit(member("c", 2)).unwrap();

        assert_eq!(registry.current_peers(), vec![pid("b"), pid("c"), pid("a")]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_identity_is_set_once() {
        let mut registry = registry_as("a");
        assert!(!registry.set_local_peer_id(pid("z")));
        assert_eq!(registry.local_peer_id(), Some(&pid("a")));
    }

    #[test]
    fn test_admit_duplicate_fails() {
        let mut registry = registry_as("a");
        registry.admit(member("b", 1)).unwrap();

        let result = registry.admit(member("b", 2));
        assert_eq!(result, Err(RegistryError::DuplicateMembership(pid("b"))));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.member(&pid("b")).unwrap().conn, ConnectionId::new(1));
    }

    #[test]
    fn test_admit_self_fails() {
        let mut registry = registry_as("a");
        let result = registry.admit(member("a", 1));
        assert_eq!(result, Err(RegistryError::SelfConnection(pid("a"))));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_contains_counts_local() {
        let mut registry = registry_as("a");
        registry.admit(member("b", 1)).unwrap();

        assert!(registry.contains(&pid("a")));
        assert!(registry.contains(&pid("b")));
        assert!(!registry.contains(&pid("c")));
    }

    #[test]
    fn test_evict_removes_member() {
        let mut registry = registry_as("a");
        registry.admit(member("b", 1)).unwrap();
        registry.admit(member("c", 2)).unwrap();

        let evicted = registry.evict(&pid("b"), ConnectionId::new(1)).unwrap();
        assert_eq!(evicted.peer_id, pid("b"));
        assert_eq!(registry.current_peers(), vec![pid("c"), pid("a")]);
    }

    #[test]
    fn test_evict_twice_is_noop() {
        let mut registry = registry_as("a");
        registry.admit(member("b", 1)).unwrap();
        registry.admit(member("c", 2)).unwrap();

        assert!(registry.evict_connection(ConnectionId::new(1)).is_some());
        assert!(registry.evict_connection(ConnectionId::new(1)).is_none());
        assert_eq!(registry.current_peers(), vec![pid("c"), pid("a")]);
    }

    #[test]
    fn test_evict_never_admitted_is_noop() {
        let mut registry = registry_as("a");
        registry.admit(member("b", 1)).unwrap();

        assert!(registry.evict(&pid("zz"), ConnectionId::new(9)).is_none());
        assert!(registry.evict_connection(ConnectionId::new(9)).is_none());
        assert_eq!(registry.current_peers(), vec![pid("b"), pid("a")]);
    }

    #[test]
    fn test_evict_other_connection_keeps_member() {
        let mut registry = registry_as("a");
        registry.admit(member("b", 1)).unwrap();

        // A rejected duplicate to b closes later under its own handle
        assert!(registry.evict(&pid("b"), ConnectionId::new(2)).is_none());
        assert!(registry.contains(&pid("b")));
    }

    #[test]
    fn test_member_by_conn() {
        let mut registry = registry_as("a");
        registry.admit(member("b", 4)).unwrap();
        assert_eq!(registry.member_by_conn(ConnectionId::new(4)).unwrap().peer_id, pid("b"));
        assert!(registry.member_by_conn(ConnectionId::new(5)).is_none());
    }

    // ========== Duplicate resolution ==========

    #[test]
    fn test_no_existing_connection() {
        assert_eq!(
            check_duplicate_connection(&pid("a"), &pid("b"), ConnectionDirection::Incoming, None),
            DuplicateCheckResult::NoDuplicate
        );
    }

    #[test]
    fn test_same_direction_keeps_existing() {
        assert_eq!(
            check_duplicate_connection(
                &pid("a"),
                &pid("b"),
                ConnectionDirection::Outgoing,
                Some(ConnectionDirection::Outgoing)
            ),
            DuplicateCheckResult::CloseThis
        );
    }

    #[test]
    fn test_smaller_peer_dial_wins_on_both_sides() {
        // On "a": a < b, so a's outgoing dial survives
        let on_a = check_duplicate_connection(
            &pid("a"),
            &pid("b"),
            ConnectionDirection::Incoming,
            Some(ConnectionDirection::Outgoing),
        );
        assert_eq!(on_a, DuplicateCheckResult::CloseThis);

        // On "b": the incoming connection is the one a dialed
        let on_b = check_duplicate_connection(
            &pid("b"),
            &pid("a"),
            ConnectionDirection::Incoming,
            Some(ConnectionDirection::Outgoing),
        );
        assert_eq!(on_b, DuplicateCheckResult::CloseOther);
    }
}
