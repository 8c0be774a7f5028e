//! PeerId: Unique identifier for a participant in the mesh.
//!
//! Peer IDs are opaque strings handed out by the signaling side of the
//! transport when a participant joins. The mesh never interprets them beyond
//! equality and ordering.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeerIdError {
    #[error("Peer ID cannot be empty")]
    Empty,
    #[error("Peer ID cannot contain whitespace: {0:?}")]
    Whitespace(String),
}

/// A unique identifier for a participant in the mesh.
///
/// Ordering is lexicographic on the underlying string. The mesh relies on it
/// only to break ties between simultaneous dials, so any total order that both
/// sides agree on would do.
///
/// # Examples
/// ```
/// use mesh_core::PeerId;
///
/// let peer_id: PeerId = "ws://10.0.0.7:9427".parse().unwrap();
/// assert_eq!(peer_id.as_str(), "ws://10.0.0.7:9427");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    /// Generate a new random peer ID (UUID v4).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PeerId {
    type Err = PeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(PeerIdError::Empty);
        }
        if s.chars().any(char::is_whitespace) {
            return Err(PeerIdError::Whitespace(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl AsRef<str> for PeerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// Serialize as a plain string so wire payloads stay `["a","b"]`
impl serde::Serialize for PeerId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for PeerId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
