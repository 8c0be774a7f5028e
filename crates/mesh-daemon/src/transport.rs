//! WebSocket implementation of the mesh transport.

use crate::connection::LinkTable;
use crate::{outgoing, server};
use anyhow::{Context, Result};
use mesh_core::transport;
use mesh_core::{ConnectMetadata, ConnectionId, PeerId, Transport, TransportEvent};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

/// Mesh transport over WebSockets.
///
/// The local peer ID is the URL other peers dial to reach us.
pub struct WsTransport {
    peer_id: PeerId,
    local_addr: SocketAddr,
    table: Arc<LinkTable>,
    accept_task: JoinHandle<()>,
}

impl WsTransport {
    /// Listen on `listen_addr` and start accepting links.
    ///
    /// `advertise` is the URL peers should dial; it defaults to
    /// `ws://<bound address>`. The identity is the first event on the
    /// returned stream.
    pub async fn bind(
        listen_addr: &str,
        advertise: Option<&str>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>)> {
        Self::bind_with(listen_addr, advertise, server::CONNECT_DEADLINE).await
    }

    /// Like [`WsTransport::bind`], closing accepted sockets that send no
    /// `connect` frame within `connect_deadline`.
    pub async fn bind_with(
        listen_addr: &str,
        advertise: Option<&str>,
        connect_deadline: Duration,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>)> {
        let listener = server::bind(listen_addr).await?;
        let local_addr = listener.local_addr()?;

        let url = match advertise {
            Some(url) => url.to_string(),
            None => format!("ws://{}", local_addr),
        };
        let peer_id: PeerId = url
            .parse()
            .with_context(|| format!("Invalid advertise address {:?}", url))?;
        info!("Advertising as {}", peer_id);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let table = Arc::new(LinkTable::new(events_tx));
        table.emit(TransportEvent::Identity(peer_id.clone()));

        let accept_task = tokio::spawn(server::accept_loop(
            listener,
            Arc::clone(&table),
            connect_deadline,
        ));

        Ok((
            Arc::new(Self {
                peer_id,
                local_addr,
                table,
                accept_task,
            }),
            events_rx,
        ))
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of links in any state.
    pub fn link_count(&self) -> usize {
        self.table.len()
    }

    /// Stop listening and close every link.
    pub fn shutdown(&self) {
        self.accept_task.abort();
        self.table.close_all();
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

impl Transport for WsTransport {
    fn dial(&self, peer: &PeerId, metadata: ConnectMetadata) -> transport::Result<ConnectionId> {
        Ok(outgoing::dial(&self.table, &self.peer_id, peer, metadata))
    }

    fn accept(&self, conn: ConnectionId) -> transport::Result<()> {
        self.table.accept(conn, &self.peer_id)
    }

    fn send(&self, conn: ConnectionId, payload: &serde_json::Value) -> transport::Result<()> {
        self.table.send_data(conn, payload)
    }

    fn close(&self, conn: ConnectionId) {
        self.table.close(conn);
    }
}
