//! Host-driven state controller: ChatCore folds connection-state changes and inbound frames
//! into caller-facing chat, invitation and transfer state, and returns actions for the host.

use std::net::SocketAddr;

use crate::identity::PeerId;
use crate::protocol::WireMessage;
use crate::session::{ConnectionState, EndReason};
use crate::transfer::{TransferMachine, TransferState};

/// Chat-level view of the session. Any connection loss while active becomes `Ended`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ChatState {
    #[default]
    Inactive,
    Active {
        peer_id: Option<PeerId>,
    },
    Ended(EndReason),
}

/// Invitation flow as seen by the application.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum InviteState {
    #[default]
    None,
    Sent {
        peer_id: Option<PeerId>,
        address: SocketAddr,
    },
    Received {
        peer_id: PeerId,
        peer_name: String,
    },
    Rejected,
    Failed(String),
}

/// What the host must do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Write one frame on the live connection.
    Send(WireMessage),
    /// Start streaming the selected blob for this attempt.
    StartStreaming {
        attempt: u64,
        name: String,
        size: u64,
    },
    /// Append bytes to the open receive sink.
    WriteChunk(Vec<u8>),
    /// Flush and close the receive sink; the blob stays at its temporary location.
    FinalizeSink,
    /// Close and delete the receive sink.
    DiscardSink,
    /// Hand chat text to subscribers.
    DeliverChat(String),
}

/// Main coordinator. Host passes events; core returns actions.
#[derive(Default)]
pub struct ChatCore {
    chat: ChatState,
    invite: InviteState,
    transfer: TransferMachine,
}

impl ChatCore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chat_state(&self) -> &ChatState {
        &self.chat
    }

    pub fn invite_state(&self) -> &InviteState {
        &self.invite
    }

    pub fn transfer_state(&self) -> &TransferState {
        self.transfer.state()
    }

    pub fn transfer(&self) -> &TransferMachine {
        &self.transfer
    }

    pub fn transfer_mut(&mut self) -> &mut TransferMachine {
        &mut self.transfer
    }

    /// The host dialled `address` and sent an invite.
    pub fn on_invite_sent(&mut self, peer_id: Option<PeerId>, address: SocketAddr) {
        self.invite = InviteState::Sent { peer_id, address };
    }

    /// Dialling failed before any invite went out.
    pub fn on_invite_failed(&mut self, message: impl Into<String>) {
        self.invite = InviteState::Failed(message.into());
    }

    /// Local decision on a received invite has been sent.
    pub fn on_invite_answered(&mut self) {
        if matches!(self.invite, InviteState::Received { .. }) {
            self.invite = InviteState::None;
        }
    }

    /// Engine connection state changed.
    pub fn on_connection_state(&mut self, state: &ConnectionState) -> Vec<Action> {
        match state {
            ConnectionState::HandshakeReceived { peer_id, peer_name } => {
                self.invite = InviteState::Received {
                    peer_id: peer_id.clone(),
                    peer_name: peer_name.clone(),
                };
                Vec::new()
            }
            ConnectionState::Active { peer_id } => {
                self.chat = ChatState::Active {
                    peer_id: peer_id.clone(),
                };
                self.invite = InviteState::None;
                Vec::new()
            }
            ConnectionState::Closed(reason) => self.on_closed(reason),
            ConnectionState::Idle | ConnectionState::Connecting | ConnectionState::HandshakeSent => {
                Vec::new()
            }
        }
    }

    fn on_closed(&mut self, reason: &EndReason) -> Vec<Action> {
        if matches!(self.chat, ChatState::Active { .. }) {
            self.chat = ChatState::Ended(reason.clone());
        }
        self.invite = match (&self.invite, reason) {
            (InviteState::Sent { .. }, EndReason::Rejected) => InviteState::Rejected,
            (InviteState::Sent { .. }, other) => InviteState::Failed(other.to_string()),
            (InviteState::Received { .. }, _) => InviteState::None,
            (current, _) => current.clone(),
        };
        self.transfer.on_session_ended()
    }

    /// A frame delivered by the engine after the handshake.
    pub fn on_message(&mut self, msg: WireMessage) -> Vec<Action> {
        match msg {
            WireMessage::Chat(text) => vec![Action::DeliverChat(text)],
            WireMessage::TransferRequest { .. }
            | WireMessage::TransferResponse { .. }
            | WireMessage::TransferChunk(_)
            | WireMessage::TransferComplete { .. }
            | WireMessage::TransferAck { .. } => self.transfer.on_message(msg),
            // Handshake and session-end frames are consumed by the engine.
            WireMessage::EndSession
            | WireMessage::InviteRequest { .. }
            | WireMessage::InviteResponse { .. } => Vec::new(),
        }
    }

    /// Logout/reset: forget everything and drop any receive sink.
    pub fn reset(&mut self) -> Vec<Action> {
        self.chat = ChatState::Inactive;
        self.invite = InviteState::None;
        self.transfer.reset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)), 9999)
    }

    #[test]
    fn disconnect_while_active_ends_chat() {
        let mut core = ChatCore::new();
        core.on_connection_state(&ConnectionState::Active {
            peer_id: Some(PeerId::new("bob")),
        });
        assert!(matches!(core.chat_state(), ChatState::Active { .. }));
        core.on_connection_state(&ConnectionState::Closed(EndReason::PeerDisconnected));
        assert_eq!(
            core.chat_state(),
            &ChatState::Ended(EndReason::PeerDisconnected)
        );
    }

    #[test]
    fn closing_before_active_does_not_end_chat() {
        let mut core = ChatCore::new();
        core.on_connection_state(&ConnectionState::Closed(EndReason::Io("reset".into())));
        assert_eq!(core.chat_state(), &ChatState::Inactive);
    }

    #[test]
    fn rejected_invite() {
        let mut core = ChatCore::new();
        core.on_invite_sent(Some(PeerId::new("bob")), addr());
        core.on_connection_state(&ConnectionState::HandshakeSent);
        core.on_connection_state(&ConnectionState::Closed(EndReason::Rejected));
        assert_eq!(core.invite_state(), &InviteState::Rejected);
        assert_eq!(core.chat_state(), &ChatState::Inactive);
    }

    #[test]
    fn invite_lost_to_io_error_is_failed() {
        let mut core = ChatCore::new();
        core.on_invite_sent(None, addr());
        core.on_connection_state(&ConnectionState::Closed(EndReason::PeerDisconnected));
        assert!(matches!(core.invite_state(), InviteState::Failed(_)));
    }

    #[test]
    fn received_invite_cleared_on_active() {
        let mut core = ChatCore::new();
        core.on_connection_state(&ConnectionState::HandshakeReceived {
            peer_id: PeerId::new("alice"),
            peer_name: "Alice".into(),
        });
        assert!(matches!(core.invite_state(), InviteState::Received { .. }));
        core.on_connection_state(&ConnectionState::Active {
            peer_id: Some(PeerId::new("alice")),
        });
        assert_eq!(core.invite_state(), &InviteState::None);
    }

    #[test]
    fn chat_and_transfer_routing() {
        let mut core = ChatCore::new();
        core.on_connection_state(&ConnectionState::Active { peer_id: None });
        assert_eq!(
            core.on_message(WireMessage::Chat("hello".into())),
            vec![Action::DeliverChat("hello".into())]
        );
        core.on_message(WireMessage::TransferRequest {
            name: "a.txt".into(),
            size: 3,
        });
        assert!(matches!(
            core.transfer_state(),
            TransferState::ReceivingRequest { .. }
        ));
        assert!(core.on_message(WireMessage::EndSession).is_empty());
    }

    #[test]
    fn disconnect_mid_receive_discards_sink() {
        let mut core = ChatCore::new();
        core.on_connection_state(&ConnectionState::Active { peer_id: None });
        core.on_message(WireMessage::TransferRequest {
            name: "a.txt".into(),
            size: 30,
        });
        core.transfer_mut()
            .accept(std::path::PathBuf::from("/tmp/a.part"))
            .unwrap();
        core.on_message(WireMessage::TransferChunk(vec![1; 10]));
        let actions =
            core.on_connection_state(&ConnectionState::Closed(EndReason::PeerDisconnected));
        assert_eq!(actions, vec![Action::DiscardSink]);
        assert_eq!(
            core.transfer_state(),
            &TransferState::Error {
                message: "session ended".into()
            }
        );
    }

    #[test]
    fn reset_returns_to_initial_state() {
        let mut core = ChatCore::new();
        core.on_connection_state(&ConnectionState::Active { peer_id: None });
        core.transfer_mut().select("x", 1).unwrap();
        core.reset();
        assert_eq!(core.chat_state(), &ChatState::Inactive);
        assert_eq!(core.transfer_state(), &TransferState::Idle);
    }
}
