//! WebSocket listener for incoming links.
//!
//! Every accepted socket becomes a link waiting for the remote `connect`
//! frame; the mesh decides whether to accept it once that arrives. Sockets
//! that stay silent past the connect deadline are closed.

use crate::connection::{run_link, LinkTable, Role, WireState};
use crate::message::ws_config;
use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_async_with_config;

/// How long an accepted socket may take to send its `connect` frame.
pub const CONNECT_DEADLINE: Duration = Duration::from_secs(10);
use tracing::{debug, error, info};

/// Bind to an address and return the TCP listener.
pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
    let listener = TcpListener::bind(listen_addr).await?;
    info!("WebSocket server listening on {}", listener.local_addr()?);
    Ok(listener)
}

/// Accept connections until the task is aborted.
pub async fn accept_loop(listener: TcpListener, table: Arc<LinkTable>, connect_deadline: Duration) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                tokio::spawn(accept_connection(
                    Arc::clone(&table),
                    stream,
                    addr,
                    connect_deadline,
                ));
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

/// Upgrade a TCP connection to WebSocket and start its link.
async fn accept_connection(
    table: Arc<LinkTable>,
    stream: TcpStream,
    addr: SocketAddr,
    connect_deadline: Duration,
) {
    let ws_stream = match accept_async_with_config(stream, Some(ws_config())).await {
        Ok(ws) => ws,
        Err(e) => {
            // Health checks (like `nc -z`) connect and immediately close without
            // completing the WebSocket handshake. Log these as debug, not error.
            let err_str = e.to_string();
            if err_str.contains("Handshake not finished")
                || err_str.contains("Connection reset")
                || err_str.contains("unexpected EOF")
            {
                debug!("Connection closed before handshake from {}", addr);
            } else {
                error!("WebSocket upgrade failed for {}: {}", addr, e);
            }
            return;
        }
    };

    let (conn, outgoing) = table.register(WireState::AwaitingConnect);
    info!("New connection from {} ({})", addr, conn);

    let task = tokio::spawn(run_link(Arc::clone(&table), conn, ws_stream, outgoing, Role::Acceptor));
    table.set_task(conn, task.abort_handle());

    tokio::spawn(async move {
        tokio::time::sleep(connect_deadline).await;
        if table.close_if(conn, WireState::AwaitingConnect) {
            info!("No connect frame from {} ({}) within {:?}, closing", addr, conn, connect_deadline);
        }
    });
}
