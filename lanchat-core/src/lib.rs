//! LAN chat protocol reference implementation.
//! Host-driven: no I/O; host passes events and receives actions.

pub mod identity;
pub mod protocol;
pub mod wire;

pub use self::core::{Action, ChatCore, ChatState, InviteState};
pub use directory::PeerDirectory;
pub use discovery::{Datagram, DatagramError};
pub use identity::{PeerId, PeerRecord};
pub use protocol::WireMessage;
pub use session::{ConnectionState, EndReason, Inbound, Role, SessionError, SessionMachine};
pub use transfer::{Direction, TransferError, TransferMachine, TransferState};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};

pub mod chunk;
pub mod core;
pub mod directory;
pub mod discovery;
pub mod integrity;
pub mod session;
pub mod transfer;
