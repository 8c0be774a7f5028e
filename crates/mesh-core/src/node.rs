//! Mesh node: runs a [`Swarm`] on its own task.
//!
//! All swarm state lives on one task. Transport events, media results, the
//! dial-timeout sweep and application commands are processed one at a time,
//! so handlers never interleave. Applications talk to the node through a
//! cloneable [`MeshHandle`].

use crate::config::MeshConfig;
use crate::events::{EventBus, EventStream, MeshEvent, Subscription};
use crate::media::MediaCapture;
use crate::swarm::{DialOutcome, MeshError, Swarm};
use crate::transport::{Transport, TransportEvent};
use crate::PeerId;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

enum Command {
    Connect {
        peer: PeerId,
        reply: oneshot::Sender<DialOutcome>,
    },
    Broadcast {
        payload: serde_json::Value,
        reply: oneshot::Sender<usize>,
    },
    Send {
        peer: PeerId,
        payload: serde_json::Value,
        reply: oneshot::Sender<Result<(), MeshError>>,
    },
    CurrentPeers {
        reply: oneshot::Sender<Vec<PeerId>>,
    },
    LocalPeerId {
        reply: oneshot::Sender<Option<PeerId>>,
    },
    Shutdown,
}

/// A mesh participant that hasn't started yet.
pub struct MeshNode {
    transport: Arc<dyn Transport>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    config: MeshConfig,
    media: Option<Arc<dyn MediaCapture>>,
    events: Arc<EventBus>,
}

impl MeshNode {
    pub fn new(
        transport: Arc<dyn Transport>,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        config: MeshConfig,
    ) -> Self {
        Self {
            transport,
            transport_events,
            config,
            media: None,
            events: Arc::new(EventBus::new()),
        }
    }

    /// Attach local media to every link once it opens.
    pub fn with_media(mut self, capture: Arc<dyn MediaCapture>) -> Self {
        self.media = Some(capture);
        self
    }

    /// Subscribe before the node starts, so no event (including `Ready`) is
    /// missed.
    pub fn events(&self) -> EventStream {
        self.events.stream()
    }

    /// Start the node on the current Tokio runtime.
    pub fn spawn(self) -> (MeshHandle, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let handle = MeshHandle {
            commands: commands_tx,
            events: Arc::clone(&self.events),
        };
        let task = tokio::spawn(self.run(commands_rx));
        (handle, task)
    }

    async fn run(self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let MeshNode {
            transport,
            mut transport_events,
            config,
            media,
            events,
        } = self;

        let (mut swarm, mut media_rx) = Swarm::new(transport, events, media, config.dial_timeout());
        let mut sweep = tokio::time::interval(config.sweep_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                // Transport first: identity is always processed before a queued
                // connect command
                biased;

                event = transport_events.recv() => match event {
                    Some(event) => swarm.handle_event(event),
                    None => {
                        info!("Transport event stream ended, stopping mesh node");
                        break;
                    }
                },

                Some(acquired) = media_rx.recv() => swarm.on_media_acquired(acquired),

                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => {
                        info!("Shutting down mesh node");
                        break;
                    }
                    Some(command) => handle_command(&mut swarm, command),
                },

                _ = sweep.tick() => {
                    let expired = swarm.expire_pending(web_time::Instant::now());
                    if expired > 0 {
                        debug!("Dropped {} stale pending connection(s)", expired);
                    }
                }
            }
        }

        swarm.close_all();
    }
}

fn handle_command(swarm: &mut Swarm, command: Command) {
    match command {
        Command::Connect { peer, reply } => {
            let _ = reply.send(swarm.connect(&peer));
        }
        Command::Broadcast { payload, reply } => {
            let _ = reply.send(swarm.broadcast(&payload));
        }
        Command::Send {
            peer,
            payload,
            reply,
        } => {
            let _ = reply.send(swarm.send_to(&peer, &payload));
        }
        Command::CurrentPeers { reply } => {
            let _ = reply.send(swarm.current_peers());
        }
        Command::LocalPeerId { reply } => {
            let _ = reply.send(swarm.local_peer_id().cloned());
        }
        Command::Shutdown => {}
    }
}

/// Cloneable handle to a running [`MeshNode`].
#[derive(Clone)]
pub struct MeshHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: Arc<EventBus>,
}

impl MeshHandle {
    /// Dial a peer. Completion shows up as a `PeerJoined` event.
    pub async fn connect(&self, peer: &PeerId) -> Result<DialOutcome, MeshError> {
        let peer = peer.clone();
        self.request(|reply| Command::Connect { peer, reply }).await
    }

    /// Send a payload to every connected peer. Returns the number of peers it
    /// was queued for.
    pub async fn broadcast(&self, payload: serde_json::Value) -> Result<usize, MeshError> {
        self.request(|reply| Command::Broadcast { payload, reply })
            .await
    }

    /// Send a payload to a single connected peer.
    pub async fn send(&self, peer: &PeerId, payload: serde_json::Value) -> Result<(), MeshError> {
        let peer = peer.clone();
        self.request(|reply| Command::Send {
            peer,
            payload,
            reply,
        })
        .await?
    }

    /// Connected peers followed by our own ID.
    pub async fn current_peers(&self) -> Result<Vec<PeerId>, MeshError> {
        self.request(|reply| Command::CurrentPeers { reply }).await
    }

    pub async fn local_peer_id(&self) -> Result<Option<PeerId>, MeshError> {
        self.request(|reply| Command::LocalPeerId { reply }).await
    }

    /// Register a callback for mesh events. Drop the subscription to stop.
    pub fn subscribe(&self, callback: impl Fn(MeshEvent) + Send + Sync + 'static) -> Subscription {
        self.events.subscribe(callback)
    }

    /// Receive mesh events through a channel.
    pub fn events(&self) -> EventStream {
        self.events.stream()
    }

    /// Stop the node. Open connections are closed.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    async fn request<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> Command,
    ) -> Result<R, MeshError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .map_err(|_| MeshError::Stopped)?;
        rx.await.map_err(|_| MeshError::Stopped)
    }
}
