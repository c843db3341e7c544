//! Session wire protocol: opcodes and message types.

use crate::identity::PeerId;

/// One-byte opcodes, fixed and agreed by both peers.
pub mod opcode {
    pub const CHAT: u8 = 0x01;
    pub const TRANSFER_REQUEST: u8 = 0x02;
    pub const TRANSFER_RESPONSE: u8 = 0x03;
    pub const TRANSFER_CHUNK: u8 = 0x04;
    pub const END_SESSION: u8 = 0x05;
    pub const INVITE: u8 = 0x06;
    pub const INVITE_RESPONSE: u8 = 0x07;
    pub const TRANSFER_COMPLETE: u8 = 0x08;
    pub const TRANSFER_ACK: u8 = 0x09;
}

/// All session frames. Encoding is `[opcode][payload]`; see the wire module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// Chat text.
    Chat(String),
    /// Offer to send a blob of known size.
    TransferRequest { name: String, size: u64 },
    /// Answer to an offer. `true` also means the receiver's sink is open and ready.
    TransferResponse { accepted: bool },
    /// Blob bytes. An empty chunk terminates the stream.
    TransferChunk(Vec<u8>),
    /// Orderly end of the session.
    EndSession,
    /// First frame on every connection: who is inviting.
    InviteRequest { peer_id: PeerId, peer_name: String },
    /// Answer to the invite.
    InviteResponse { accepted: bool },
    /// Sender finished streaming `name`.
    TransferComplete { name: String },
    /// Receiver persisted `name`.
    TransferAck { name: String },
}

impl WireMessage {
    /// The zero-length chunk that ends a blob stream.
    pub fn end_of_stream() -> Self {
        WireMessage::TransferChunk(Vec::new())
    }

    pub fn opcode(&self) -> u8 {
        match self {
            WireMessage::Chat(_) => opcode::CHAT,
            WireMessage::TransferRequest { .. } => opcode::TRANSFER_REQUEST,
            WireMessage::TransferResponse { .. } => opcode::TRANSFER_RESPONSE,
            WireMessage::TransferChunk(_) => opcode::TRANSFER_CHUNK,
            WireMessage::EndSession => opcode::END_SESSION,
            WireMessage::InviteRequest { .. } => opcode::INVITE,
            WireMessage::InviteResponse { .. } => opcode::INVITE_RESPONSE,
            WireMessage::TransferComplete { .. } => opcode::TRANSFER_COMPLETE,
            WireMessage::TransferAck { .. } => opcode::TRANSFER_ACK,
        }
    }

    /// Short name for logs and protocol errors.
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Chat(_) => "Chat",
            WireMessage::TransferRequest { .. } => "TransferRequest",
            WireMessage::TransferResponse { .. } => "TransferResponse",
            WireMessage::TransferChunk(_) => "TransferChunk",
            WireMessage::EndSession => "EndSession",
            WireMessage::InviteRequest { .. } => "InviteRequest",
            WireMessage::InviteResponse { .. } => "InviteResponse",
            WireMessage::TransferComplete { .. } => "TransferComplete",
            WireMessage::TransferAck { .. } => "TransferAck",
        }
    }

    /// Chat and transfer frames; only legal once the invite handshake has completed.
    pub fn requires_handshake(&self) -> bool {
        !matches!(
            self,
            WireMessage::EndSession
                | WireMessage::InviteRequest { .. }
                | WireMessage::InviteResponse { .. }
        )
    }

    /// Payload of a `TransferChunk`, if this is one.
    pub fn chunk_data(&self) -> Option<&[u8]> {
        match self {
            WireMessage::TransferChunk(data) => Some(data),
            _ => None,
        }
    }

    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, WireMessage::TransferChunk(data) if data.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_frames_are_exempt() {
        assert!(!WireMessage::EndSession.requires_handshake());
        assert!(!WireMessage::InviteResponse { accepted: true }.requires_handshake());
        assert!(WireMessage::Chat("hi".into()).requires_handshake());
        assert!(WireMessage::end_of_stream().requires_handshake());
    }

    #[test]
    fn end_of_stream_is_empty_chunk() {
        assert!(WireMessage::end_of_stream().is_end_of_stream());
        assert!(!WireMessage::TransferChunk(vec![0]).is_end_of_stream());
        assert_eq!(WireMessage::end_of_stream().chunk_data(), Some(&[][..]));
    }
}
