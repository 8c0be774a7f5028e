//! Wire protocol envelope types for mesh messages.
//!
//! These types define the JSON wire format for the messages the mesh itself
//! sends. Everything else that crosses a connection is application data and
//! passes through untouched.

use crate::media::MediaHandle;
use crate::PeerId;
use serde::{Deserialize, Serialize};

/// `type` tag of discovery messages.
pub const PEER_DISCOVERY_TYPE: &str = "peer discovery";

/// `type` tag of media offers.
pub const MEDIA_OFFER_TYPE: &str = "media offer";

/// Metadata attached to an outgoing dial.
///
/// Wire format: `{"peers":["a","b"]}`
///
/// Carries a snapshot of everything the dialer knew before the connection
/// existed, so the accepting side can start discovery straight away.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectMetadata {
    #[serde(default)]
    pub peers: Vec<PeerId>,
}

impl ConnectMetadata {
    pub fn new(peers: Vec<PeerId>) -> Self {
        Self { peers }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct DiscoveryBody {
    #[serde(default)]
    peers: Vec<PeerId>,
}

/// A follow-up discovery message sent on an open connection.
///
/// Wire format: `{"type":"peer discovery","payload":{"peers":[...]}}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryMessage {
    #[serde(rename = "type")]
    msg_type: String,
    payload: DiscoveryBody,
}

impl DiscoveryMessage {
    pub fn new(peers: Vec<PeerId>) -> Self {
        Self {
            msg_type: PEER_DISCOVERY_TYPE.to_string(),
            payload: DiscoveryBody { peers },
        }
    }

    pub fn peers(&self) -> &[PeerId] {
        &self.payload.peers
    }

    pub fn into_peers(self) -> Vec<PeerId> {
        self.payload.peers
    }

    /// Convert to the transport's generic message representation.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "type": PEER_DISCOVERY_TYPE,
            "payload": { "peers": self.payload.peers },
        })
    }

    /// Try to parse from a generic message.
    ///
    /// Returns `None` if the `type` field isn't `"peer discovery"` or the
    /// payload doesn't have the expected shape.
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        let msg: Self = serde_json::from_value(value.clone()).ok()?;
        if msg.msg_type == PEER_DISCOVERY_TYPE {
            Some(msg)
        } else {
            None
        }
    }
}

/// A media handle offered to the remote side of a connection.
///
/// Wire format: `{"type":"media offer","payload":<handle>}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaOfferMessage {
    #[serde(rename = "type")]
    msg_type: String,
    pub payload: MediaHandle,
}

impl MediaOfferMessage {
    pub fn new(handle: MediaHandle) -> Self {
        Self {
            msg_type: MEDIA_OFFER_TYPE.to_string(),
            payload: handle,
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "type": MEDIA_OFFER_TYPE,
            "payload": self.payload,
        })
    }

    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        let msg: Self = serde_json::from_value(value.clone()).ok()?;
        if msg.msg_type == MEDIA_OFFER_TYPE {
            Some(msg)
        } else {
            None
        }
    }
}
