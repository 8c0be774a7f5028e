//! Inbound payload classification.
//!
//! Every payload arriving on an open connection is one of:
//! - **Discovery**: handled by the mesh, never shown to the application
//! - **Media offer**: forwarded unmodified, and also surfaced as a media event
//! - **Application**: anything else, forwarded unmodified

use super::envelope::{
    DiscoveryMessage, MediaOfferMessage, MEDIA_OFFER_TYPE, PEER_DISCOVERY_TYPE,
};
use crate::media::MediaHandle;
use crate::PeerId;

/// A classified inbound payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Peer list from a discovery message
    Discovery(Vec<PeerId>),
    /// A discovery-tagged payload that didn't parse; dropped by the caller
    MalformedDiscovery,
    /// Media handle offered by the remote side, with the payload it came in
    MediaOffer {
        handle: MediaHandle,
        payload: serde_json::Value,
    },
    /// Application payload, untouched
    Application(serde_json::Value),
}

/// Read the `type` tag of a payload, if it has one.
pub fn message_type(payload: &serde_json::Value) -> Option<&str> {
    payload.get("type").and_then(|t| t.as_str())
}

/// Classify an inbound payload.
pub fn classify(payload: serde_json::Value) -> Inbound {
    match message_type(&payload) {
        Some(PEER_DISCOVERY_TYPE) => match DiscoveryMessage::from_value(&payload) {
            Some(msg) => Inbound::Discovery(msg.into_peers()),
            None => Inbound::MalformedDiscovery,
        },
        Some(MEDIA_OFFER_TYPE) => match MediaOfferMessage::from_value(&payload) {
            Some(msg) => Inbound::MediaOffer {
                handle: msg.payload,
                payload,
            },
            None => Inbound::Application(payload),
        },
        _ => Inbound::Application(payload),
    }
}
