//! Discovery datagrams: ASCII, colon-delimited request/response exchanged over UDP broadcast.

use std::net::IpAddr;
use std::time::Duration;

use crate::identity::{PeerId, PeerRecord};

/// Discovery UDP port.
pub const DEFAULT_DISCOVERY_PORT: u16 = 8888;
/// Receive buffer for one datagram.
pub const RECV_BUFFER_SIZE: usize = 1024;
/// How long `discover` collects responses.
pub const DEFAULT_DISCOVERY_WINDOW: Duration = Duration::from_secs(5);

pub const REQUEST_TAG: &str = "DISCOVER_CHATAPP_REQUEST";
pub const RESPONSE_TAG: &str = "CHATAPP_RESPONSE";

/// One discovery datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datagram {
    /// Broadcast by a peer looking for others.
    Request { peer_id: PeerId, name: String },
    /// Unicast reply from a serving peer.
    Response { peer_id: PeerId, name: String },
}

impl Datagram {
    pub fn request(peer_id: PeerId, name: impl Into<String>) -> Self {
        Datagram::Request {
            peer_id,
            name: name.into(),
        }
    }

    pub fn response(peer_id: PeerId, name: impl Into<String>) -> Self {
        Datagram::Response {
            peer_id,
            name: name.into(),
        }
    }

    /// `<TAG>:<id>:<name>` as bytes.
    pub fn encode(&self) -> Vec<u8> {
        let (tag, peer_id, name) = match self {
            Datagram::Request { peer_id, name } => (REQUEST_TAG, peer_id, name),
            Datagram::Response { peer_id, name } => (RESPONSE_TAG, peer_id, name),
        };
        format!("{}:{}:{}", tag, peer_id, name).into_bytes()
    }

    /// Parse a datagram. The ID may not contain ':'; the name is everything after the second ':'.
    pub fn parse(bytes: &[u8]) -> Result<Self, DatagramError> {
        let text = std::str::from_utf8(bytes).map_err(|_| DatagramError::NotUtf8)?;
        let mut parts = text.splitn(3, ':');
        let tag = parts.next().unwrap_or_default();
        let (Some(id), Some(name)) = (parts.next(), parts.next()) else {
            return Err(DatagramError::MissingField);
        };
        if id.is_empty() {
            return Err(DatagramError::MissingField);
        }
        let peer_id = PeerId::new(id);
        let name = name.to_string();
        match tag {
            REQUEST_TAG => Ok(Datagram::Request { peer_id, name }),
            RESPONSE_TAG => Ok(Datagram::Response { peer_id, name }),
            _ => Err(DatagramError::UnknownTag),
        }
    }
}

/// Malformed discovery datagram. Callers drop these silently.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DatagramError {
    #[error("datagram is not valid UTF-8")]
    NotUtf8,
    #[error("datagram is missing a field")]
    MissingField,
    #[error("unknown datagram tag")]
    UnknownTag,
}

/// Turn a received datagram into a peer record if it is a well-formed response from someone else.
/// `from` must be the UDP source address of the datagram.
pub fn peer_from_response(bytes: &[u8], from: IpAddr, self_id: &PeerId) -> Option<PeerRecord> {
    match Datagram::parse(bytes).ok()? {
        Datagram::Response { peer_id, name } if peer_id != *self_id => {
            Some(PeerRecord::new(peer_id, name, from))
        }
        _ => None,
    }
}
