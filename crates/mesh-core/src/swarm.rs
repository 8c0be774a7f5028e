//! Swarm: the per-participant state machine.
//!
//! `Swarm` reacts to [`TransportEvent`]s and application commands. It owns
//! the registry and the pending links, so it must be driven from a single
//! task; [`crate::node::MeshNode`] does exactly that.
//!
//! Flow for a new connection:
//! 1. `connect()` (outgoing) or an `Incoming` event passes the guards and the
//!    link is tracked as pending
//! 2. `Open` moves the link into the registry (after duplicate resolution)
//! 3. Discovery runs once for the link, then media attachment
//! 4. `Close`/`Error` evicts it, once

use crate::discovery;
use crate::events::{EventBus, MeshEvent};
use crate::lifecycle::{DialDecision, IncomingDecision, LifecycleController, Link, SkipReason};
use crate::media::{MediaAcquired, MediaCapture, MediaLinks};
use crate::protocol::{classify, ConnectMetadata, DiscoveryMessage, Inbound, MediaOfferMessage};
use crate::registry::{
    check_duplicate_connection, ConnectionDirection, ConnectionRegistry, DuplicateCheckResult,
    Member,
};
use crate::transport::{ConnectionId, Transport, TransportError, TransportEvent};
use crate::PeerId;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use web_time::Instant;

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("Not connected to {0}")]
    NotConnected(PeerId),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Mesh node has stopped")]
    Stopped,
}

/// Result of asking the swarm to connect to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialOutcome {
    /// Dial issued; completion arrives as a later event
    Dialing(ConnectionId),
    /// A guard prevented the dial
    Skipped(SkipReason),
    /// The transport refused to start the dial
    Failed(String),
}

pub struct Swarm {
    transport: Arc<dyn Transport>,
    registry: ConnectionRegistry,
    lifecycle: LifecycleController,
    events: Arc<EventBus>,
    media: Option<Arc<dyn MediaCapture>>,
    media_links: MediaLinks,
    media_tx: mpsc::UnboundedSender<MediaAcquired>,
    dial_timeout: Option<Duration>,
}

impl Swarm {
    /// Create a swarm. Media acquisitions report back on the returned channel,
    /// which must be fed into [`Swarm::on_media_acquired`].
    pub fn new(
        transport: Arc<dyn Transport>,
        events: Arc<EventBus>,
        media: Option<Arc<dyn MediaCapture>>,
        dial_timeout: Option<Duration>,
    ) -> (Self, mpsc::UnboundedReceiver<MediaAcquired>) {
        let (media_tx, media_rx) = mpsc::unbounded_channel();
        (
            Self {
                transport,
                registry: ConnectionRegistry::new(),
                lifecycle: LifecycleController::new(),
                events,
                media,
                media_links: MediaLinks::new(),
                media_tx,
                dial_timeout,
            },
            media_rx,
        )
    }

    pub fn local_peer_id(&self) -> Option<&PeerId> {
        self.registry.local_peer_id()
    }

    /// Every connected peer plus ourselves.
    pub fn current_peers(&self) -> Vec<PeerId> {
        self.registry.current_peers()
    }

    pub fn members(&self) -> &[Member] {
        self.registry.members()
    }

    pub fn pending_count(&self) -> usize {
        self.lifecycle.pending_count()
    }

    /// Process one transport event.
    pub fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Identity(peer_id) => self.on_identity(peer_id),
            TransportEvent::Incoming {
                conn,
                remote,
                metadata,
            } => self.on_incoming(conn, remote, metadata),
            TransportEvent::Open { conn } => self.on_open(conn),
            TransportEvent::Close { conn } => self.on_closed(conn, None),
            TransportEvent::Error { conn, message } => self.on_closed(conn, Some(message)),
            TransportEvent::Data { conn, payload } => self.on_data(conn, payload),
        }
    }

    /// Dial a peer unless it is ourselves, already connected, or already being
    /// dialed.
    pub fn connect(&mut self, target: &PeerId) -> DialOutcome {
        let metadata = match self.lifecycle.plan_outgoing(&self.registry, target) {
            DialDecision::Dial(metadata) => metadata,
            DialDecision::Skip(reason) => {
                match reason {
                    SkipReason::NoIdentity => {
                        warn!("Cannot dial {} before our peer ID is assigned", target)
                    }
                    SkipReason::AlreadyConnected => {
                        info!("Already connected to {}. Aborting.", target)
                    }
                    SkipReason::SelfDial => debug!("Not dialing our own peer ID {}", target),
                    SkipReason::AlreadyDialing => debug!("Dial to {} already pending", target),
                }
                return DialOutcome::Skipped(reason);
            }
        };

        let snapshot = metadata.peers.clone();
        match self.transport.dial(target, metadata) {
            Ok(conn) => {
                info!("Dialing {} ({})", target, conn);
                self.lifecycle
                    .track(Link::outgoing(conn, target.clone(), snapshot));
                DialOutcome::Dialing(conn)
            }
            Err(e) => {
                warn!("Dial to {} failed: {}", target, e);
                DialOutcome::Failed(e.to_string())
            }
        }
    }

    /// Send a payload to every open connection. Returns how many sends were
    /// queued.
    pub fn broadcast(&self, payload: &serde_json::Value) -> usize {
        let mut sent = 0;
        for member in self.registry.members() {
            match self.transport.send(member.conn, payload) {
                Ok(()) => sent += 1,
                Err(e) => warn!("Failed to broadcast to {}: {}", member.peer_id, e),
            }
        }
        sent
    }

    /// Send a payload to one member.
    pub fn send_to(&self, peer_id: &PeerId, payload: &serde_json::Value) -> Result<(), MeshError> {
        let member = self
            .registry
            .member(peer_id)
            .ok_or_else(|| MeshError::NotConnected(peer_id.clone()))?;
        self.transport.send(member.conn, payload)?;
        Ok(())
    }

    /// Close pending links older than the dial timeout. Returns how many were
    /// dropped.
    pub fn expire_pending(&mut self, now: Instant) -> usize {
        let Some(timeout) = self.dial_timeout else {
            return 0;
        };

        let expired = self.lifecycle.expired(now, timeout);
        for conn in &expired {
            if let Some(link) = self.lifecycle.close(*conn) {
                warn!(
                    "Connection to {} ({}) still pending after {:?}, giving up",
                    link.remote, conn, timeout
                );
                self.transport.close(*conn);
            }
        }
        expired.len()
    }

    /// Close every link, pending or open. Open links are evicted.
    pub fn close_all(&mut self) {
        let open: Vec<_> = self.registry.members().iter().map(|m| m.conn).collect();
        for conn in open {
            self.transport.close(conn);
            self.on_closed(conn, None);
        }
        for conn in self.lifecycle.expired(Instant::now(), Duration::ZERO) {
            self.lifecycle.close(conn);
            self.transport.close(conn);
        }
    }

    /// Finish a media acquisition started when a link opened.
    pub fn on_media_acquired(&mut self, acquired: MediaAcquired) {
        let MediaAcquired { conn, result } = acquired;
        let handle = match result {
            Ok(handle) => handle,
            Err(e) => {
                debug!("Proceeding without media on {}: {}", conn, e);
                return;
            }
        };

        let Some(member) = self.registry.member_by_conn(conn) else {
            debug!("Media ready for {} after it closed, dropping", conn);
            return;
        };
        if !self.media_links.claim_outbound(conn) {
            return;
        }

        let offer = MediaOfferMessage::new(handle).to_value();
        if let Err(e) = self.transport.send(conn, &offer) {
            warn!("Failed to send media to {}: {}", member.peer_id, e);
        } else {
            debug!("Sent media offer to {}", member.peer_id);
        }
    }

    fn on_identity(&mut self, peer_id: PeerId) {
        if self.registry.set_local_peer_id(peer_id.clone()) {
            info!("Local peer ID: {}", peer_id);
            self.events.emit(MeshEvent::Ready { peer_id });
        } else {
            warn!("Ignoring second identity announcement ({})", peer_id);
        }
    }

    fn on_incoming(&mut self, conn: ConnectionId, remote: PeerId, metadata: Option<ConnectMetadata>) {
        match self.lifecycle.plan_incoming(&self.registry, &remote) {
            IncomingDecision::Accept => {
                debug!("Accepting connection from {} ({})", remote, conn);
                self.lifecycle.track(Link::incoming(conn, remote, metadata));
                if let Err(e) = self.transport.accept(conn) {
                    warn!("Failed to accept {}: {}", conn, e);
                    self.lifecycle.close(conn);
                }
            }
            IncomingDecision::Reject(reason) => {
                match reason {
                    SkipReason::AlreadyConnected => {
                        info!("Already connected to {}. Closing connection.", remote)
                    }
                    _ => debug!("Rejecting connection from {} ({:?})", remote, reason),
                }
                self.transport.close(conn);
            }
        }
    }

    fn on_open(&mut self, conn: ConnectionId) {
        let Some(link) = self.lifecycle.open(conn) else {
            debug!("Open event for untracked connection {}, ignoring", conn);
            return;
        };
        let Some(local) = self.registry.local_peer_id().cloned() else {
            self.transport.close(conn);
            return;
        };

        let existing = self
            .registry
            .member(&link.remote)
            .map(|m| (m.conn, m.direction));

        match check_duplicate_connection(&local, &link.remote, link.direction, existing.map(|e| e.1)) {
            DuplicateCheckResult::NoDuplicate => {}
            DuplicateCheckResult::CloseThis => {
                info!(
                    "Duplicate connection to {} detected, closing {} (keeping existing)",
                    link.remote, conn
                );
                self.transport.close(conn);
                return;
            }
            DuplicateCheckResult::CloseOther => {
                if let Some((old_conn, _)) = existing {
                    info!(
                        "Duplicate connection to {} detected, closing {} (keeping {})",
                        link.remote, old_conn, conn
                    );
                    self.registry.evict(&link.remote, old_conn);
                    self.media_links.forget(old_conn);
                    self.transport.close(old_conn);
                }
            }
        }

        let member = Member::new(link.remote.clone(), conn, link.direction);
        if let Err(e) = self.registry.admit(member) {
            warn!("Closing {}: {}", conn, e);
            self.transport.close(conn);
            return;
        }

        info!("Peer connected: {} ({:?})", link.remote, link.direction);
        if existing.is_none() {
            self.events.emit(MeshEvent::PeerJoined {
                peer_id: link.remote.clone(),
            });
        }

        self.run_discovery(&link, &local);
        self.attach_media(conn);
    }

    fn run_discovery(&mut self, link: &Link, local: &PeerId) {
        // Only an incoming link carries a list we haven't seen; an outgoing
        // link's list is the snapshot we sent ourselves.
        if link.direction == ConnectionDirection::Incoming {
            let unknown = discovery::unknown_peers(&link.known_by_remote, &self.current_peers());
            for peer in unknown {
                self.connect(&peer);
            }
        }

        let unique = discovery::unique_peers(
            &self.current_peers(),
            &link.known_by_remote,
            local,
            &link.remote,
        );
        if unique.is_empty() {
            return;
        }

        debug!("Telling {} about {} peer(s)", link.remote, unique.len());
        let msg = DiscoveryMessage::new(unique).to_value();
        if let Err(e) = self.transport.send(link.conn, &msg) {
            warn!("Failed to send discovery to {}: {}", link.remote, e);
        }
    }

    fn attach_media(&mut self, conn: ConnectionId) {
        let Some(capture) = self.media.clone() else {
            return;
        };
        if !self.media_links.begin_request(conn) {
            return;
        }

        let tx = self.media_tx.clone();
        tokio::spawn(async move {
            let result = capture.acquire().await;
            let _ = tx.send(MediaAcquired { conn, result });
        });
    }

    fn on_closed(&mut self, conn: ConnectionId, error: Option<String>) {
        if let Some(link) = self.lifecycle.close(conn) {
            match error {
                Some(message) => warn!("Connection to {} failed: {}", link.remote, message),
                None => info!("Connection to {} closed before opening", link.remote),
            }
            return;
        }

        let Some(member) = self.registry.evict_connection(conn) else {
            debug!("Close for unknown connection {}, ignoring", conn);
            return;
        };

        self.media_links.forget(conn);
        match error {
            Some(message) => {
                warn!("Connection to {} failed: {}", member.peer_id, message);
                self.transport.close(conn);
            }
            None => info!("Peer disconnected: {}", member.peer_id),
        }
        self.events.emit(MeshEvent::PeerLeft {
            peer_id: member.peer_id,
        });
    }

    fn on_data(&mut self, conn: ConnectionId, payload: serde_json::Value) {
        let Some(from) = self.registry.member_by_conn(conn).map(|m| m.peer_id.clone()) else {
            debug!("Dropping data on {} (not an open connection)", conn);
            return;
        };

        match classify(payload) {
            Inbound::Discovery(peers) => {
                let unknown = discovery::unknown_peers(&peers, &self.current_peers());
                debug!(
                    "Discovery from {}: {} peer(s), {} new",
                    from,
                    peers.len(),
                    unknown.len()
                );
                for peer in unknown {
                    self.connect(&peer);
                }
            }
            Inbound::MalformedDiscovery => {
                warn!("Dropping malformed discovery message from {}", from);
            }
            Inbound::MediaOffer { handle, payload } => {
                if self.media_links.claim_inbound(conn) {
                    self.events.emit(MeshEvent::Media {
                        from: from.clone(),
                        handle,
                    });
                } else {
                    debug!("Repeated media offer from {}, passing through as data", from);
                }
                self.events.emit(MeshEvent::Message { from, payload });
            }
            Inbound::Application(payload) => {
                self.events.emit(MeshEvent::Message { from, payload });
            }
        }
    }
}
