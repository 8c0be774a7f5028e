//! Protocol definitions for mesh peers.
//!
//! This module defines what travels over a connection:
//! - Connect-time metadata attached to every outgoing dial
//! - Discovery and media envelopes exchanged on open connections
//! - Classification of inbound payloads (protocol vs. application)

pub mod encoding;
pub mod envelope;

pub use encoding::{classify, Inbound};
pub use envelope::{
    ConnectMetadata, DiscoveryMessage, MediaOfferMessage, MEDIA_OFFER_TYPE, PEER_DISCOVERY_TYPE,
};
