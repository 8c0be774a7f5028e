//! Chat messages exchanged by the CLI node.

use mesh_core::MeshEvent;
use serde::{Deserialize, Serialize};

pub const CHAT_TYPE: &str = "chat";

/// `{"type": "chat", "text": ...}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(rename = "type")]
    msg_type: String,
    pub text: String,
}

impl ChatMessage {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            msg_type: CHAT_TYPE.to_string(),
            text: text.into(),
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({"type": CHAT_TYPE, "text": self.text})
    }

    /// Parse a chat message. Returns None for other payloads.
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        let msg: Self = serde_json::from_value(value.clone()).ok()?;
        (msg.msg_type == CHAT_TYPE).then_some(msg)
    }
}

/// One line of terminal output for an event.
pub fn describe(event: &MeshEvent) -> String {
    match event {
        MeshEvent::Ready { peer_id } => format!("* ready as {}", peer_id),
        MeshEvent::PeerJoined { peer_id } => format!("* {} joined", peer_id),
        MeshEvent::PeerLeft { peer_id } => format!("* {} left", peer_id),
        MeshEvent::Message { from, payload } => match ChatMessage::from_value(payload) {
            Some(chat) => format!("<{}> {}", from, chat.text),
            None => format!("<{}> {}", from, payload),
        },
        MeshEvent::Media { from, handle } => {
            format!("* media from {}: {}", from, handle.as_value())
        }
    }
}
