//! Per-connection session state machine: invite handshake, frame legality, session end.
//!
//! `Idle -> Connecting -> HandshakeSent | HandshakeReceived -> Active -> Closed`.
//! `Closed` is terminal; a new connection gets a new machine.

use crate::identity::PeerId;
use crate::protocol::WireMessage;

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Connected out and sent the invite.
    Inviter,
    /// Accepted the socket and waits for the invite.
    Invitee,
}

/// Why a connection ended. Diagnostic only: every variant means "session ended".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// We closed it.
    LocalClose,
    /// Peer sent `EndSession`.
    RemoteEnded,
    /// Peer closed the socket without `EndSession`.
    PeerDisconnected,
    /// The invite was declined (by either side).
    Rejected,
    Io(String),
    ProtocolViolation(String),
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndReason::LocalClose => f.write_str("closed locally"),
            EndReason::RemoteEnded => f.write_str("peer ended the session"),
            EndReason::PeerDisconnected => f.write_str("peer disconnected"),
            EndReason::Rejected => f.write_str("invitation rejected"),
            EndReason::Io(e) => write!(f, "i/o error: {}", e),
            EndReason::ProtocolViolation(e) => write!(f, "protocol violation: {}", e),
        }
    }
}

/// Observable connection state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    HandshakeSent,
    HandshakeReceived {
        peer_id: PeerId,
        peer_name: String,
    },
    /// `peer_id` is unknown when an inviter dialled a bare address.
    Active {
        peer_id: Option<PeerId>,
    },
    Closed(EndReason),
}

impl ConnectionState {
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Active { .. })
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::Closed(_))
    }
}

/// What an inbound frame means to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Invite arrived on an accepted connection; waiting for the local decision.
    Invite { peer_id: PeerId, peer_name: String },
    /// Our invite was accepted; the session is active.
    Accepted,
    /// Our invite was declined. Host should close with `EndReason::Rejected`.
    Rejected,
    /// Peer sent `EndSession`. Host should close with `EndReason::RemoteEnded`.
    Ended,
    /// Ordinary chat/transfer frame for the subscribers.
    Deliver(WireMessage),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session is not active")]
    NotActive,
    #[error("session is closed")]
    Closed,
    #[error("expected InviteRequest as first frame, got {0}")]
    ExpectedInvite(&'static str),
    #[error("unexpected {frame} while {state}")]
    UnexpectedFrame {
        frame: &'static str,
        state: &'static str,
    },
    #[error("no invitation is pending")]
    NoPendingInvite,
}

pub struct SessionMachine {
    role: Role,
    state: ConnectionState,
    peer_id: Option<PeerId>,
}

impl SessionMachine {
    /// Outbound connection; call `invite` once the socket is up.
    pub fn inviter() -> Self {
        Self {
            role: Role::Inviter,
            state: ConnectionState::Connecting,
            peer_id: None,
        }
    }

    /// Accepted connection; the first inbound frame must be the invite.
    pub fn invitee() -> Self {
        Self {
            role: Role::Invitee,
            state: ConnectionState::Connecting,
            peer_id: None,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Build the invite frame and move to `HandshakeSent`. The state changes before the write
    /// so a fast `InviteResponse` is already legal when it lands.
    pub fn invite(
        &mut self,
        self_id: PeerId,
        self_name: impl Into<String>,
    ) -> Result<WireMessage, SessionError> {
        if self.role != Role::Inviter || self.state != ConnectionState::Connecting {
            return Err(SessionError::UnexpectedFrame {
                frame: "InviteRequest",
                state: self.state_name(),
            });
        }
        self.state = ConnectionState::HandshakeSent;
        Ok(WireMessage::InviteRequest {
            peer_id: self_id,
            peer_name: self_name.into(),
        })
    }

    /// Local decision on a received invite. Accepting moves to `Active` before the response is
    /// written, so the inviter's first chat frame is legal as soon as it arrives.
    pub fn respond_to_invite(&mut self, accept: bool) -> Result<WireMessage, SessionError> {
        let ConnectionState::HandshakeReceived { peer_id, .. } = &self.state else {
            return Err(SessionError::NoPendingInvite);
        };
        let peer_id = peer_id.clone();
        if accept {
            self.state = ConnectionState::Active {
                peer_id: Some(peer_id),
            };
        }
        Ok(WireMessage::InviteResponse { accepted: accept })
    }

    /// Check an inbound frame against the current state.
    pub fn on_frame(&mut self, msg: WireMessage) -> Result<Inbound, SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        if matches!(msg, WireMessage::EndSession) {
            return Ok(Inbound::Ended);
        }
        let state = self.state_name();
        match self.state {
            ConnectionState::Connecting if self.role == Role::Invitee => match msg {
                WireMessage::InviteRequest { peer_id, peer_name } => {
                    self.peer_id = Some(peer_id.clone());
                    self.state = ConnectionState::HandshakeReceived {
                        peer_id: peer_id.clone(),
                        peer_name: peer_name.clone(),
                    };
                    Ok(Inbound::Invite { peer_id, peer_name })
                }
                other => Err(SessionError::ExpectedInvite(other.kind())),
            },
            ConnectionState::HandshakeSent => match msg {
                WireMessage::InviteResponse { accepted: true } => {
                    self.state = ConnectionState::Active {
                        peer_id: self.peer_id.clone(),
                    };
                    Ok(Inbound::Accepted)
                }
                WireMessage::InviteResponse { accepted: false } => Ok(Inbound::Rejected),
                other => Err(SessionError::UnexpectedFrame {
                    frame: other.kind(),
                    state,
                }),
            },
            ConnectionState::Active { .. } if msg.requires_handshake() => {
                Ok(Inbound::Deliver(msg))
            }
            _ => Err(SessionError::UnexpectedFrame {
                frame: msg.kind(),
                state,
            }),
        }
    }

    /// Record who we are inviting, so `Active` can name them.
    pub fn set_expected_peer(&mut self, peer_id: PeerId) {
        if self.role == Role::Inviter {
            self.peer_id = Some(peer_id);
        }
    }

    /// Check an outbound frame against the current state. Chat and transfer frames need `Active`.
    pub fn check_outbound(&self, msg: &WireMessage) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        match msg {
            WireMessage::EndSession => Ok(()),
            WireMessage::InviteRequest { .. } | WireMessage::InviteResponse { .. } => {
                Err(SessionError::UnexpectedFrame {
                    frame: msg.kind(),
                    state: self.state_name(),
                })
            }
            _ if self.state.is_active() => Ok(()),
            _ => Err(SessionError::NotActive),
        }
    }

    /// Move to `Closed`. Returns false if already closed (first reason wins).
    pub fn close(&mut self, reason: EndReason) -> bool {
        if self.is_closed() {
            return false;
        }
        self.state = ConnectionState::Closed(reason);
        true
    }

    fn state_name(&self) -> &'static str {
        match self.state {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::HandshakeSent => "awaiting invite response",
            ConnectionState::HandshakeReceived { .. } => "awaiting local invite decision",
            ConnectionState::Active { .. } => "active",
            ConnectionState::Closed(_) => "closed",
        }
    }
}
