//! Peer identity: installation-unique peer ID and the discovered peer record.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Opaque, installation-unique peer ID. Carried in discovery datagrams and the invite frame.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Generate a fresh random ID (UUID v4, hyphenated).
    pub fn generate() -> Self {
        PeerId(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// IDs travel inside colon-delimited datagrams, so they must be non-empty and colon-free.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty() && !self.0.contains(':')
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        PeerId(s)
    }
}

/// A peer found on the local segment. Ephemeral: rebuilt every discovery cycle, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub id: PeerId,
    pub display_name: String,
    /// Source address of the discovery response this record came from.
    pub ip_address: IpAddr,
}

impl PeerRecord {
    pub fn new(id: PeerId, display_name: impl Into<String>, ip_address: IpAddr) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            ip_address,
        }
    }
}
