//! Wire frames exchanged over a WebSocket link.
//!
//! Frames are JSON sent as text WebSocket frames. A link starts with the
//! dialer's `connect` frame (its peer ID plus connect metadata); the acceptor
//! answers with `accept` or closes the socket. After that only `data` frames
//! flow, each carrying one mesh payload.

use mesh_core::{ConnectMetadata, PeerId};
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

/// Maximum frame size (16MB) to prevent memory exhaustion from malicious peers.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Socket settings for every link. Oversized messages fail the link while
/// they are being read instead of after they are buffered.
pub fn ws_config() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(MAX_MESSAGE_SIZE);
    config.max_frame_size = Some(MAX_MESSAGE_SIZE);
    config
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    /// First frame from the dialing side
    Connect {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
        #[serde(default)]
        metadata: ConnectMetadata,
    },
    /// Acceptor agreed to open the link
    Accept {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },
    /// Mesh payload on an open link
    Data { payload: serde_json::Value },
}

impl Frame {
    pub fn to_text(&self) -> String {
        // Frames only hold strings and JSON values, which always serialize
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Parse a frame. Returns None for anything that isn't one.
    pub fn from_text(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}
