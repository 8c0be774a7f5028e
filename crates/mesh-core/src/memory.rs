//! In-process transport.
//!
//! A [`MemoryNetwork`] plays the role of the signaling service: it hands out
//! identities and routes connection requests between transports in the same
//! process. Used by the integration tests and for embedding several mesh
//! nodes in one program.

use crate::protocol::ConnectMetadata;
use crate::transport::{ConnectionId, Result, Transport, TransportError, TransportEvent};
use crate::PeerId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

/// One end of an in-process connection.
#[derive(Debug)]
struct Half {
    owner: PeerId,
    counterpart: ConnectionId,
    open: bool,
}

#[derive(Debug, Default)]
struct NetworkState {
    nodes: HashMap<PeerId, mpsc::UnboundedSender<TransportEvent>>,
    halves: HashMap<ConnectionId, Half>,
    next_conn: u64,
}

impl NetworkState {
    fn allocate(&mut self) -> ConnectionId {
        self.next_conn += 1;
        ConnectionId::new(self.next_conn)
    }

    fn deliver(&self, peer: &PeerId, event: TransportEvent) {
        if let Some(tx) = self.nodes.get(peer) {
            let _ = tx.send(event);
        }
    }

    /// Tear down both ends of a connection, notifying each owner once.
    fn close_pair(&mut self, conn: ConnectionId) {
        let Some(half) = self.halves.remove(&conn) else {
            return;
        };
        if let Some(other) = self.halves.remove(&half.counterpart) {
            self.deliver(&other.owner, TransportEvent::Close {
                conn: half.counterpart,
            });
        }
        self.deliver(&half.owner, TransportEvent::Close { conn });
    }
}

/// Shared in-process network.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join with a freshly generated identity.
    pub fn join(&self) -> (Arc<MemoryTransport>, mpsc::UnboundedReceiver<TransportEvent>) {
        loop {
            if let Ok(joined) = self.join_as(PeerId::generate()) {
                return joined;
            }
        }
    }

    /// Join with a chosen identity. Fails if the ID is taken.
    ///
    /// The identity is announced as the first event on the returned stream.
    pub fn join_as(
        &self,
        peer_id: PeerId,
    ) -> Result<(Arc<MemoryTransport>, mpsc::UnboundedReceiver<TransportEvent>)> {
        let mut state = self.lock();
        if state.nodes.contains_key(&peer_id) {
            return Err(TransportError::ConnectionFailed(format!(
                "Peer ID {} is already taken",
                peer_id
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(TransportEvent::Identity(peer_id.clone()));
        state.nodes.insert(peer_id.clone(), tx);
        debug!("{} joined the in-process network", peer_id);

        let transport = Arc::new(MemoryTransport {
            peer_id,
            state: Arc::clone(&self.state),
        });
        Ok((transport, rx))
    }

    /// Drop a participant: all of its connections close and it can no longer
    /// be dialed.
    pub fn leave(&self, peer_id: &PeerId) {
        let mut state = self.lock();
        let owned: Vec<_> = state
            .halves
            .iter()
            .filter(|(_, h)| &h.owner == peer_id)
            .map(|(conn, _)| *conn)
            .collect();
        for conn in owned {
            state.close_pair(conn);
        }
        state.nodes.remove(peer_id);
        debug!("{} left the in-process network", peer_id);
    }

    /// Number of live connection ends.
    pub fn connection_count(&self) -> usize {
        self.lock().halves.len()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A participant's view of a [`MemoryNetwork`].
#[derive(Debug)]
pub struct MemoryTransport {
    peer_id: PeerId,
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryTransport {
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn owned_half<'a>(&self, state: &'a NetworkState, conn: ConnectionId) -> Result<&'a Half> {
        state
            .halves
            .get(&conn)
            .filter(|h| h.owner == self.peer_id)
            .ok_or(TransportError::UnknownConnection(conn))
    }
}

impl Transport for MemoryTransport {
    fn dial(&self, peer: &PeerId, metadata: ConnectMetadata) -> Result<ConnectionId> {
        let mut state = self.lock();
        if !state.nodes.contains_key(&self.peer_id) {
            return Err(TransportError::Closed);
        }

        let local = state.allocate();
        if !state.nodes.contains_key(peer) {
            // Unreachable peers fail asynchronously, like a real signaling server
            state.deliver(&self.peer_id, TransportEvent::Error {
                conn: local,
                message: format!("Could not connect to peer {}", peer),
            });
            return Ok(local);
        }

        let remote = state.allocate();
        state.halves.insert(local, Half {
            owner: self.peer_id.clone(),
            counterpart: remote,
            open: false,
        });
        state.halves.insert(remote, Half {
            owner: peer.clone(),
            counterpart: local,
            open: false,
        });
        state.deliver(peer, TransportEvent::Incoming {
            conn: remote,
            remote: self.peer_id.clone(),
            metadata: Some(metadata),
        });
        Ok(local)
    }

    fn accept(&self, conn: ConnectionId) -> Result<()> {
        let mut state = self.lock();
        let counterpart = self.owned_half(&state, conn)?.counterpart;
        let dialer = state
            .halves
            .get(&counterpart)
            .map(|h| h.owner.clone())
            .ok_or(TransportError::UnknownConnection(conn))?;

        for end in [conn, counterpart] {
            if let Some(half) = state.halves.get_mut(&end) {
                half.open = true;
            }
        }
        state.deliver(&self.peer_id, TransportEvent::Open { conn });
        state.deliver(&dialer, TransportEvent::Open { conn: counterpart });
        Ok(())
    }

    fn send(&self, conn: ConnectionId, payload: &serde_json::Value) -> Result<()> {
        let state = self.lock();
        let half = self.owned_half(&state, conn)?;
        if !half.open {
            return Err(TransportError::SendFailed(format!("{} is not open", conn)));
        }
        let remote = state
            .halves
            .get(&half.counterpart)
            .ok_or(TransportError::UnknownConnection(conn))?;
        state.deliver(&remote.owner, TransportEvent::Data {
            conn: half.counterpart,
            payload: payload.clone(),
        });
        Ok(())
    }

    fn close(&self, conn: ConnectionId) {
        let mut state = self.lock();
        if self.owned_half(&state, conn).is_ok() {
            state.close_pair(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pid(s: &str) -> PeerId {
        s.parse().unwrap()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Vec<TransportEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[test]
    fn test_join_announces_identity() {
        let network = MemoryNetwork::new();
        let (transport, mut rx) = network.join_as(pid("a")).unwrap();
        assert_eq!(transport.peer_id(), &pid("a"));
        assert_eq!(drain(&mut rx), vec![TransportEvent::Identity(pid("a"))]);
    }

    #[test]
    fn test_join_rejects_taken_id() {
        let network = MemoryNetwork::new();
        let _a = network.join_as(pid("a")).unwrap();
        assert!(network.join_as(pid("a")).is_err());
    }

    #[test]
    fn test_join_generates_distinct_ids() {
        let network = MemoryNetwork::new();
        let (a, _) = network.join();
        let (b, _) = network.join();
        assert_ne!(a.peer_id(), b.peer_id());
    }

    #[test]
    fn test_dial_accept_send() {
        let network = MemoryNetwork::new();
        let (a, mut a_rx) = network.join_as(pid("a")).unwrap();
        let (b, mut b_rx) = network.join_as(pid("b")).unwrap();
        drain(&mut a_rx);
        drain(&mut b_rx);

        let metadata = ConnectMetadata::new(vec![pid("a")]);
        let a_conn = a.dial(&pid("b"), metadata.clone()).unwrap();

        let incoming = drain(&mut b_rx);
        let [TransportEvent::Incoming { conn: b_conn, remote, metadata: got }] = incoming.as_slice()
        else {
            panic!("expected one incoming event, got {:?}", incoming);
        };
        assert_eq!(remote, &pid("a"));
        assert_eq!(got.as_ref(), Some(&metadata));

        // Not open yet
        assert!(a.send(a_conn, &json!({})).is_err());

        b.accept(*b_conn).unwrap();
        assert_eq!(drain(&mut a_rx), vec![TransportEvent::Open { conn: a_conn }]);
        assert_eq!(drain(&mut b_rx), vec![TransportEvent::Open { conn: *b_conn }]);

        a.send(a_conn, &json!({"hello": 1})).unwrap();
        assert_eq!(
            drain(&mut b_rx),
            vec![TransportEvent::Data {
                conn: *b_conn,
                payload: json!({"hello": 1})
            }]
        );
    }

    #[test]
    fn test_dial_unknown_peer_errors() {
        let network = MemoryNetwork::new();
        let (a, mut a_rx) = network.join_as(pid("a")).unwrap();
        drain(&mut a_rx);

        let conn = a.dial(&pid("ghost"), ConnectMetadata::default()).unwrap();
        assert!(matches!(
            drain(&mut a_rx).as_slice(),
            [TransportEvent::Error { conn: c, .. }] if *c == conn
        ));
    }

    #[test]
    fn test_close_notifies_both_ends_once() {
        let network = MemoryNetwork::new();
        let (a, mut a_rx) = network.join_as(pid("a")).unwrap();
        let (b, mut b_rx) = network.join_as(pid("b")).unwrap();
        let a_conn = a.dial(&pid("b"), ConnectMetadata::default()).unwrap();
        drain(&mut a_rx);
        let b_conn = match drain(&mut b_rx).pop() {
            Some(TransportEvent::Incoming { conn, .. }) => conn,
            other => panic!("expected incoming, got {:?}", other),
        };

        a.close(a_conn);
        a.close(a_conn);
        b.close(b_conn);

        assert_eq!(drain(&mut a_rx), vec![TransportEvent::Close { conn: a_conn }]);
        assert_eq!(drain(&mut b_rx), vec![TransportEvent::Close { conn: b_conn }]);
        assert_eq!(network.connection_count(), 0);
    }

    #[test]
    fn test_cannot_touch_other_peers_connections() {
        let network = MemoryNetwork::new();
        let (a, _a_rx) = network.join_as(pid("a")).unwrap();
        let (b, _b_rx) = network.join_as(pid("b")).unwrap();
        let a_conn = a.dial(&pid("b"), ConnectMetadata::default()).unwrap();

        assert!(b.accept(a_conn).is_err());
        b.close(a_conn);
        assert_eq!(network.connection_count(), 2);
    }

    #[test]
    fn test_leave_closes_connections() {
        let network = MemoryNetwork::new();
        let (a, mut a_rx) = network.join_as(pid("a")).unwrap();
        let (_b, _b_rx) = network.join_as(pid("b")).unwrap();
        let a_conn = a.dial(&pid("b"), ConnectMetadata::default()).unwrap();
        drain(&mut a_rx);

        network.leave(&pid("b"));
        assert_eq!(drain(&mut a_rx), vec![TransportEvent::Close { conn: a_conn }]);

        // b can no longer be dialed
        let conn = a.dial(&pid("b"), ConnectMetadata::default()).unwrap();
        assert!(matches!(
            drain(&mut a_rx).as_slice(),
            [TransportEvent::Error { conn: c, .. }] if *c == conn
        ));
    }
}
