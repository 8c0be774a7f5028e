//! Individual WebSocket links.
//!
//! Each link splits its WebSocket stream: a write task drains a queue of
//! outgoing frames, and a read loop turns incoming frames into
//! [`TransportEvent`]s. Live links are tracked in a shared [`LinkTable`];
//! whoever removes a link from the table reports how it ended, so a link's
//! `Close`/`Error` is emitted exactly once.

use crate::message::Frame;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use mesh_core::{ConnectionId, PeerId, TransportError, TransportEvent};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_tungstenite::{
    tungstenite::{Error as WsError, Message},
    WebSocketStream,
};
use tracing::{debug, warn};

/// Where a link is in its connect/accept exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireState {
    /// We dialed; waiting for the socket and the remote `accept`
    Dialing,
    /// Socket accepted; waiting for the remote `connect` frame
    AwaitingConnect,
    /// `connect` received; waiting for the mesh to accept or close
    AwaitingAccept,
    /// Data may flow both ways
    Open,
}

/// Which side of the exchange we are on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Dialer,
    Acceptor,
}

struct LinkEntry {
    writer: mpsc::UnboundedSender<Message>,
    state: WireState,
    task: Option<AbortHandle>,
}

/// Live links, keyed by connection ID.
pub struct LinkTable {
    links: Mutex<HashMap<ConnectionId, LinkEntry>>,
    next_conn: AtomicU64,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl LinkTable {
    pub fn new(events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            links: Mutex::new(HashMap::new()),
            next_conn: AtomicU64::new(1),
            events,
        }
    }

    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    /// Start tracking a link. Frames queued on it are written once its
    /// socket exists.
    pub fn register(&self, state: WireState) -> (ConnectionId, mpsc::UnboundedReceiver<Message>) {
        let conn = ConnectionId::new(self.next_conn.fetch_add(1, Ordering::Relaxed));
        let (writer, rx) = mpsc::unbounded_channel();
        self.lock().insert(
            conn,
            LinkEntry {
                writer,
                state,
                task: None,
            },
        );
        (conn, rx)
    }

    /// Remember the task driving a link so closing it can stop the task.
    pub fn set_task(&self, conn: ConnectionId, task: AbortHandle) {
        if let Some(entry) = self.lock().get_mut(&conn) {
            entry.task = Some(task);
        }
    }

    pub fn state(&self, conn: ConnectionId) -> Option<WireState> {
        self.lock().get(&conn).map(|e| e.state)
    }

    /// Move a link from one state to the next. False if it isn't in `from`.
    pub fn advance(&self, conn: ConnectionId, from: WireState, to: WireState) -> bool {
        match self.lock().get_mut(&conn) {
            Some(entry) if entry.state == from => {
                entry.state = to;
                true
            }
            _ => false,
        }
    }

    /// Queue a frame regardless of link state.
    pub fn queue(&self, conn: ConnectionId, frame: &Frame) -> Result<(), TransportError> {
        let links = self.lock();
        let entry = links
            .get(&conn)
            .ok_or(TransportError::UnknownConnection(conn))?;
        entry
            .writer
            .send(Message::Text(frame.to_text()))
            .map_err(|_| TransportError::SendFailed(format!("{} writer has stopped", conn)))
    }

    /// Accept a link whose `connect` frame has arrived.
    pub fn accept(&self, conn: ConnectionId, local: &PeerId) -> Result<(), TransportError> {
        if !self.advance(conn, WireState::AwaitingAccept, WireState::Open) {
            return Err(TransportError::UnknownConnection(conn));
        }
        self.queue(conn, &Frame::Accept {
            peer_id: local.clone(),
        })?;
        self.emit(TransportEvent::Open { conn });
        Ok(())
    }

    /// Queue a mesh payload on an open link.
    pub fn send_data(&self, conn: ConnectionId, payload: &serde_json::Value) -> Result<(), TransportError> {
        match self.state(conn) {
            Some(WireState::Open) => self.queue(conn, &Frame::Data {
                payload: payload.clone(),
            }),
            Some(_) => Err(TransportError::SendFailed(format!("{} is not open", conn))),
            None => Err(TransportError::UnknownConnection(conn)),
        }
    }

    /// Report that a link ended. Only the first report for a link is emitted.
    pub fn finish(&self, conn: ConnectionId, event: TransportEvent) {
        if self.lock().remove(&conn).is_some() {
            self.emit(event);
        }
    }

    /// Close a link from our side: send a close frame, stop its task and
    /// report the close.
    pub fn close(&self, conn: ConnectionId) {
        let Some(entry) = self.lock().remove(&conn) else {
            return;
        };
        self.shut(conn, entry);
    }

    /// Close a link only if it is still in `state`. False if it moved on or
    /// is already gone.
    pub fn close_if(&self, conn: ConnectionId, state: WireState) -> bool {
        let entry = {
            let mut links = self.lock();
            match links.get(&conn) {
                Some(entry) if entry.state == state => links.remove(&conn),
                _ => None,
            }
        };
        match entry {
            Some(entry) => {
                self.shut(conn, entry);
                true
            }
            None => false,
        }
    }

    fn shut(&self, conn: ConnectionId, entry: LinkEntry) {
        let _ = entry.writer.send(Message::Close(None));
        if let Some(task) = entry.task {
            task.abort();
        }
        debug!("Closed {}", conn);
        self.emit(TransportEvent::Close { conn });
    }

    /// Close every link.
    pub fn close_all(&self) {
        let conns: Vec<_> = self.lock().keys().copied().collect();
        for conn in conns {
            self.close(conn);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, LinkEntry>> {
        self.links.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Drive a link until it ends: spawn its writer, run the read loop, then
/// report the outcome.
pub async fn run_link<S>(
    table: Arc<LinkTable>,
    conn: ConnectionId,
    ws_stream: WebSocketStream<S>,
    outgoing: mpsc::UnboundedReceiver<Message>,
    role: Role,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (write, read) = ws_stream.split();
    tokio::spawn(write_loop(conn, write, outgoing));

    let ended = read_loop(&table, conn, read, role).await;
    table.finish(conn, ended);
}

/// Write queued frames until the queue closes or a close frame goes out.
async fn write_loop<S>(
    conn: ConnectionId,
    mut write: SplitSink<WebSocketStream<S>, Message>,
    mut outgoing: mpsc::UnboundedReceiver<Message>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(msg) = outgoing.recv().await {
        let is_close = matches!(msg, Message::Close(_));
        if let Err(e) = write.send(msg).await {
            debug!("Write on {} failed: {}", conn, e);
            return;
        }
        if is_close {
            return;
        }
    }
    let _ = write.close().await;
}

/// Read frames, translating them into transport events. Returns the event
/// describing how the link ended.
async fn read_loop<S>(
    table: &LinkTable,
    conn: ConnectionId,
    mut read: SplitStream<WebSocketStream<S>>,
    role: Role,
) -> TransportEvent
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let text = match read.next().await {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    warn!("Dropping non UTF-8 frame on {}", conn);
                    continue;
                }
            },
            Some(Ok(Message::Close(_))) => {
                debug!("Received close frame on {}", conn);
                return TransportEvent::Close { conn };
            }
            Some(Ok(_)) => continue,
            Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                debug!("Connection {} stream ended", conn);
                return TransportEvent::Close { conn };
            }
            Some(Err(e)) => {
                warn!("WebSocket error on {}: {}", conn, e);
                return TransportEvent::Error {
                    conn,
                    message: e.to_string(),
                };
            }
        };

        let Some(frame) = Frame::from_text(&text) else {
            warn!("Dropping unparseable frame on {}", conn);
            continue;
        };

        match (role, frame) {
            (Role::Acceptor, Frame::Connect { peer_id, metadata }) => {
                if table.advance(conn, WireState::AwaitingConnect, WireState::AwaitingAccept) {
                    debug!("Connect request from {} on {}", peer_id, conn);
                    table.emit(TransportEvent::Incoming {
                        conn,
                        remote: peer_id,
                        metadata: Some(metadata),
                    });
                }
            }
            (Role::Dialer, Frame::Accept { peer_id }) => {
                if table.advance(conn, WireState::Dialing, WireState::Open) {
                    debug!("{} accepted {}", peer_id, conn);
                    table.emit(TransportEvent::Open { conn });
                }
            }
            (_, Frame::Data { payload }) if table.state(conn) == Some(WireState::Open) => {
                table.emit(TransportEvent::Data { conn, payload });
            }
            (_, frame) => {
                debug!("Ignoring unexpected frame on {}: {:?}", conn, frame);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table() -> (LinkTable, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (LinkTable::new(tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Vec<TransportEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[test]
    fn test_finish_reports_once() {
        let (table, mut rx) = table();
        let (conn, _frames) = table.register(WireState::Dialing);

        table.finish(conn, TransportEvent::Close { conn });
        table.finish(conn, TransportEvent::Error {
            conn,
            message: "late".into(),
        });
        table.close(conn);

        assert_eq!(drain(&mut rx), vec![TransportEvent::Close { conn }]);
        assert!(table.is_empty());
    }

    #[test]
    fn test_close_sends_close_frame() {
        let (table, mut rx) = table();
        let (conn, mut frames) = table.register(WireState::Open);

        table.close(conn);

        assert!(matches!(frames.try_recv(), Ok(Message::Close(None))));
        assert_eq!(drain(&mut rx), vec![TransportEvent::Close { conn }]);
    }

    #[test]
    fn test_accept_requires_connect_frame() {
        let (table, mut rx) = table();
        let local: PeerId = "ws://127.0.0.1:1".parse().unwrap();
        let (conn, mut frames) = table.register(WireState::AwaitingConnect);

        assert!(table.accept(conn, &local).is_err());

        assert!(table.advance(conn, WireState::AwaitingConnect, WireState::AwaitingAccept));
        table.accept(conn, &local).unwrap();

        let Ok(Message::Text(text)) = frames.try_recv() else {
            panic!("expected accept frame");
        };
        assert_eq!(Frame::from_text(&text), Some(Frame::Accept { peer_id: local }));
        assert_eq!(drain(&mut rx), vec![TransportEvent::Open { conn }]);
    }

    #[test]
    fn test_close_if_only_in_given_state() {
        let (table, mut rx) = table();
        let (waiting, _w) = table.register(WireState::AwaitingConnect);
        let (moved_on, _m) = table.register(WireState::AwaitingConnect);
        table.advance(moved_on, WireState::AwaitingConnect, WireState::AwaitingAccept);

        assert!(table.close_if(waiting, WireState::AwaitingConnect));
        assert!(!table.close_if(moved_on, WireState::AwaitingConnect));
        assert!(!table.close_if(waiting, WireState::AwaitingConnect));

        assert_eq!(drain(&mut rx), vec![TransportEvent::Close { conn: waiting }]);
        assert_eq!(table.state(moved_on), Some(WireState::AwaitingAccept));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_send_data_only_when_open() {
        let (table, _rx) = table();
        let (conn, mut frames) = table.register(WireState::Dialing);

        assert!(matches!(
            table.send_data(conn, &json!({})),
            Err(TransportError::SendFailed(_))
        ));
        assert!(matches!(
            table.send_data(ConnectionId::new(999), &json!({})),
            Err(TransportError::UnknownConnection(_))
        ));

        table.advance(conn, WireState::Dialing, WireState::Open);
        table.send_data(conn, &json!({"n": 1})).unwrap();
        let Ok(Message::Text(text)) = frames.try_recv() else {
            panic!("expected data frame");
        };
        assert_eq!(
            Frame::from_text(&text),
            Some(Frame::Data {
                payload: json!({"n": 1})
            })
        );
    }
}
