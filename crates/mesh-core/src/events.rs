//! Event infrastructure for the mesh.
//!
//! Provides `MeshEvent` for application consumers and `EventBus` for
//! subscriptions. Discovery traffic never shows up here.

use crate::media::MediaHandle;
use crate::PeerId;
use futures::Stream;
use serde::Serialize;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Events surfaced to the application.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MeshEvent {
    /// Signaling assigned our identity.
    Ready {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },
    /// A connection to a peer opened and was admitted into the swarm.
    PeerJoined {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },
    /// A peer's connection closed or failed.
    PeerLeft {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },
    /// Application payload received from a peer, unmodified.
    Message {
        from: PeerId,
        payload: serde_json::Value,
    },
    /// Media handle received from a peer.
    Media { from: PeerId, handle: MediaHandle },
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

type Callback = Arc<dyn Fn(MeshEvent) + Send + Sync>;

/// Event bus for publishing mesh events to subscribers.
///
/// Wrap in `Arc` to enable subscriptions.
#[derive(Default)]
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    ///
    /// Requires `self` to be wrapped in `Arc`.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(MeshEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    /// Subscribe through a channel instead of a callback.
    pub fn stream(self: &Arc<Self>) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(move |event| {
            let _ = tx.send(event);
        });
        EventStream {
            rx,
            _subscription: subscription,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // emit() drops the read lock before running callbacks, so this can block
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(i, _)| *i != id);
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.callbacks.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: MeshEvent) {
        // Clone the callback list so a callback may subscribe without deadlocking
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }
}

/// Channel-backed subscription. Unsubscribes when dropped.
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<MeshEvent>,
    _subscription: Subscription,
}

impl EventStream {
    /// Wait for the next event.
    pub async fn recv(&mut self) -> Option<MeshEvent> {
        self.rx.recv().await
    }

    /// Take an event if one is already queued.
    pub fn try_recv(&mut self) -> Option<MeshEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for EventStream {
    type Item = MeshEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
