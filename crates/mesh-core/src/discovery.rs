//! Peer discovery: exchanging "who I know" lists to grow a full mesh.
//!
//! # Protocol Overview
//!
//! When a connection X opens, and `M` is the peer list the remote side is
//! known to have (the metadata it dialed us with, or the snapshot we dialed it
//! with):
//! 1. Dial every peer in `M` we aren't connected to yet.
//! 2. Send X the peers we know that it doesn't:
//!    `current_peers - (M ∪ {local} ∪ {X.remote})`, if any.
//!
//! A discovery message received later on an open connection is handled like
//! step 1. Fan-out only ever dials unknown peers and the swarm only grows, so
//! the flood stops once every participant knows every other.

use crate::PeerId;
use std::collections::HashSet;

/// Peers from `advertised` that aren't in `current`, deduplicated, in
/// advertised order.
pub fn unknown_peers(advertised: &[PeerId], current: &[PeerId]) -> Vec<PeerId> {
    let mut seen: HashSet<&PeerId> = current.iter().collect();
    advertised
        .iter()
        .filter(|p| seen.insert(*p))
        .cloned()
        .collect()
}

/// Peers we know that the remote end of a new link doesn't.
pub fn unique_peers(
    current: &[PeerId],
    known_by_remote: &[PeerId],
    local: &PeerId,
    remote: &PeerId,
) -> Vec<PeerId> {
    let excluded: HashSet<&PeerId> = known_by_remote
        .iter()
        .chain([local, remote])
        .collect();
    current
        .iter()
        .filter(|p| !excluded.contains(p))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers(ids: &[&str]) -> Vec<PeerId> {
        ids.iter().map(|id| id.parse().unwrap()).collect()
    }

    fn pid(s: &str) -> PeerId {
        s.parse().unwrap()
    }

    #[test]
    fn test_unknown_peers_filters_current() {
        let result = unknown_peers(&peers(&["a", "b", "c"]), &peers(&["b", "z"]));
        assert_eq!(result, peers(&["a", "c"]));
    }

    #[test]
    fn test_unknown_peers_dedups() {
        let result = unknown_peers(&peers(&["c", "c", "d", "c"]), &peers(&["a"]));
        assert_eq!(result, peers(&["c", "d"]));
    }

    #[test]
    fn test_unknown_peers_redelivery_is_empty() {
        // Same payload processed twice: second time everything is known
        let current = peers(&["b", "c", "a"]);
        assert!(unknown_peers(&peers(&["b", "c"]), &current).is_empty());
    }

    #[test]
    fn test_unique_peers_for_new_joiner() {
        // A knows B; C dials A with metadata [C]
        let current = peers(&["b", "c", "a"]);
        let result = unique_peers(&current, &peers(&["c"]), &pid("a"), &pid("c"));
        assert_eq!(result, peers(&["b"]));
    }

    #[test]
    fn test_unique_peers_nothing_new() {
        let current = peers(&["a", "c", "b"]);
        let result = unique_peers(&current, &peers(&["a", "c"]), &pid("b"), &pid("c"));
        assert!(result.is_empty());
    }

    #[test]
    fn test_unique_peers_never_includes_local_or_remote() {
        let current = peers(&["x", "y", "me"]);
        let result = unique_peers(&current, &[], &pid("me"), &pid("x"));
        assert_eq!(result, peers(&["y"]));
    }
}
