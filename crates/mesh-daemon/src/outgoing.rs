//! Outgoing links: connections we initiate to remote peers.
//!
//! A peer's ID is the WebSocket URL it listens on, so dialing is a
//! WebSocket connect to that URL followed by the `connect` frame. The frame is
//! queued before the socket exists and goes out as soon as it does.

use crate::connection::{run_link, LinkTable, Role, WireState};
use crate::message::{ws_config, Frame};
use mesh_core::{ConnectMetadata, ConnectionId, PeerId, TransportEvent};
use std::sync::Arc;
use tokio_tungstenite::connect_async_with_config;
use tracing::{debug, warn};

/// Start dialing `target`. Completion is reported through the link table's
/// event channel.
pub fn dial(
    table: &Arc<LinkTable>,
    local: &PeerId,
    target: &PeerId,
    metadata: ConnectMetadata,
) -> ConnectionId {
    let (conn, outgoing) = table.register(WireState::Dialing);
    let _ = table.queue(conn, &Frame::Connect {
        peer_id: local.clone(),
        metadata,
    });

    let url = target.to_string();
    let task_table = Arc::clone(table);
    let task = tokio::spawn(async move {
        match connect_async_with_config(url.as_str(), Some(ws_config()), false).await {
            Ok((ws_stream, _)) => {
                debug!("Connected to {} ({}), waiting for accept", url, conn);
                run_link(task_table, conn, ws_stream, outgoing, Role::Dialer).await;
            }
            Err(e) => {
                warn!("Failed to connect to {}: {}", url, e);
                task_table.finish(conn, TransportEvent::Error {
                    conn,
                    message: e.to_string(),
                });
            }
        }
    });
    table.set_task(conn, task.abort_handle());

    conn
}
