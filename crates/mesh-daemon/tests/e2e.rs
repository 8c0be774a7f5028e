//! End-to-end tests for mesh-daemon.
//!
//! Runs real mesh nodes over WebSocket links on localhost, plus a raw
//! WebSocket client speaking the wire frames directly.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use mesh_core::{ConnectMetadata, EventStream, MeshConfig, MeshEvent, MeshHandle, MeshNode, PeerId};
use mesh_daemon::{ChatMessage, Frame, WsTransport, MAX_MESSAGE_SIZE};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

const SETTLE: Duration = Duration::from_secs(10);

/// A mesh node listening on an ephemeral localhost port.
struct TestNode {
    handle: MeshHandle,
    transport: Arc<WsTransport>,
    events: EventStream,
}

impl TestNode {
    async fn start() -> Self {
        let (transport, transport_events) = WsTransport::bind("127.0.0.1:0", None)
            .await
            .expect("Failed to bind");
        let node = MeshNode::new(transport.clone(), transport_events, MeshConfig::default());
        let events = node.events();
        let (handle, _task) = node.spawn();
        Self {
            handle,
            transport,
            events,
        }
    }

    fn peer_id(&self) -> PeerId {
        self.transport.peer_id().clone()
    }

    async fn peer_set(&self) -> BTreeSet<PeerId> {
        self.handle
            .current_peers()
            .await
            .expect("node running")
            .into_iter()
            .collect()
    }

    async fn wait_for_peers(&self, expected: &BTreeSet<PeerId>) {
        let result = timeout(SETTLE, async {
            while &self.peer_set().await != expected {
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(
            result.is_ok(),
            "{} never reached {:?}, has {:?}",
            self.peer_id(),
            expected,
            self.peer_set().await
        );
    }

    async fn next_message(&mut self) -> (PeerId, serde_json::Value) {
        timeout(SETTLE, async {
            loop {
                match self.events.recv().await {
                    Some(MeshEvent::Message { from, payload }) => return (from, payload),
                    Some(_) => continue,
                    None => panic!("event stream closed"),
                }
            }
        })
        .await
        .expect("Timeout waiting for message")
    }
}

async fn wait_for_full_mesh(nodes: &[&TestNode]) {
    let expected: BTreeSet<_> = nodes.iter().map(|n| n.peer_id()).collect();
    for node in nodes {
        node.wait_for_peers(&expected).await;
    }
}

/// Raw client that speaks the frame protocol by hand.
struct RawClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl RawClient {
    async fn connect(target: &PeerId) -> Self {
        let (ws, _) = connect_async(target.as_str()).await.expect("Failed to connect");
        Self { ws }
    }

    async fn send_frame(&mut self, frame: &Frame) {
        self.ws
            .send(Message::Text(frame.to_text()))
            .await
            .expect("Failed to send");
    }

    /// Next frame, or None once the server closed the socket.
    async fn recv_frame(&mut self) -> Option<Frame> {
        timeout(SETTLE, async {
            loop {
                match self.ws.next().await {
                    Some(Ok(Message::Text(text))) => return Frame::from_text(&text),
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await
        .expect("Timeout waiting for frame")
    }
}

// ==================== Mesh formation ====================

#[tokio::test]
async fn test_three_nodes_form_full_mesh() {
    let a = TestNode::start().await;
    let b = TestNode::start().await;
    let c = TestNode::start().await;

    b.handle.connect(&a.peer_id()).await.unwrap();
    wait_for_full_mesh(&[&a, &b]).await;

    // c only knows a
    c.handle.connect(&a.peer_id()).await.unwrap();
    wait_for_full_mesh(&[&a, &b, &c]).await;
}

#[tokio::test]
async fn test_chat_broadcast_over_websocket() {
    let a = TestNode::start().await;
    let mut b = TestNode::start().await;
    let mut c = TestNode::start().await;

    b.handle.connect(&a.peer_id()).await.unwrap();
    c.handle.connect(&b.peer_id()).await.unwrap();
    wait_for_full_mesh(&[&a, &b, &c]).await;

    let chat = ChatMessage::new("hello mesh").to_value();
    assert_eq!(a.handle.broadcast(chat.clone()).await.unwrap(), 2);

    assert_eq!(b.next_message().await, (a.peer_id(), chat.clone()));
    assert_eq!(c.next_message().await, (a.peer_id(), chat));
}

#[tokio::test]
async fn test_shutdown_evicts_peer() {
    let a = TestNode::start().await;
    let b = TestNode::start().await;

    b.handle.connect(&a.peer_id()).await.unwrap();
    wait_for_full_mesh(&[&a, &b]).await;

    b.handle.shutdown();
    b.transport.shutdown();
    wait_for_full_mesh(&[&a]).await;
}

#[tokio::test]
async fn test_unreachable_seed_is_not_admitted() {
    let a = TestNode::start().await;
    // Bind and drop to get a port nobody listens on
    let closed_port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let ghost: PeerId = format!("ws://127.0.0.1:{}", closed_port).parse().unwrap();

    a.handle.connect(&ghost).await.unwrap();
    sleep(Duration::from_millis(200)).await;

    assert_eq!(a.peer_set().await, BTreeSet::from([a.peer_id()]));
    assert_eq!(a.transport.link_count(), 0);
}

// ==================== Wire protocol ====================

#[tokio::test]
async fn test_raw_client_joins_and_learns_peers() {
    let a = TestNode::start().await;
    let b = TestNode::start().await;
    b.handle.connect(&a.peer_id()).await.unwrap();
    wait_for_full_mesh(&[&a, &b]).await;

    let me: PeerId = "ws://127.0.0.1:1".parse().unwrap();
    let mut client = RawClient::connect(&a.peer_id()).await;
    client
        .send_frame(&Frame::Connect {
            peer_id: me.clone(),
            metadata: ConnectMetadata::new(vec![me.clone()]),
        })
        .await;

    assert_eq!(
        client.recv_frame().await,
        Some(Frame::Accept {
            peer_id: a.peer_id()
        })
    );

    // a tells us about b, the one peer we didn't list
    assert_eq!(
        client.recv_frame().await,
        Some(Frame::Data {
            payload: serde_json::json!({
                "type": "peer discovery",
                "payload": {"peers": [b.peer_id()]}
            })
        })
    );
}

#[tokio::test]
async fn test_silent_socket_closed_after_connect_deadline() {
    let (transport, _events) =
        WsTransport::bind_with("127.0.0.1:0", None, Duration::from_millis(200))
            .await
            .expect("Failed to bind");

    // Upgrade but never send a connect frame
    let mut client = RawClient::connect(transport.peer_id()).await;
    assert_eq!(client.recv_frame().await, None);
    assert_eq!(transport.link_count(), 0);
}

#[tokio::test]
async fn test_oversized_message_fails_link() {
    let a = TestNode::start().await;
    let me: PeerId = "ws://127.0.0.1:1".parse().unwrap();

    let mut client = RawClient::connect(&a.peer_id()).await;
    client
        .send_frame(&Frame::Connect {
            peer_id: me.clone(),
            metadata: ConnectMetadata::default(),
        })
        .await;
    assert_eq!(
        client.recv_frame().await,
        Some(Frame::Accept {
            peer_id: a.peer_id()
        })
    );
    a.wait_for_peers(&BTreeSet::from([a.peer_id(), me])).await;

    let huge = "x".repeat(MAX_MESSAGE_SIZE + 1);
    let _ = client
        .ws
        .send(Message::Text(
            Frame::Data {
                payload: serde_json::json!({"blob": huge}),
            }
            .to_text(),
        ))
        .await;

    while client.recv_frame().await.is_some() {}
    a.wait_for_peers(&BTreeSet::from([a.peer_id()])).await;
}

#[tokio::test]
async fn test_duplicate_peer_id_is_rejected() {
    let a = TestNode::start().await;
    let b = TestNode::start().await;
    b.handle.connect(&a.peer_id()).await.unwrap();
    wait_for_full_mesh(&[&a, &b]).await;

    // Claim to be b, which a is already linked to
    let mut client = RawClient::connect(&a.peer_id()).await;
    client
        .send_frame(&Frame::Connect {
            peer_id: b.peer_id(),
            metadata: ConnectMetadata::default(),
        })
        .await;

    assert_eq!(client.recv_frame().await, None);
    assert_eq!(a.peer_set().await.len(), 2);
}
