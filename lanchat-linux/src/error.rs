//! Crate-level error for the socket and file layers.

use lanchat_core::{FrameDecodeError, FrameEncodeError, SessionError, TransferError};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("decode: {0}")]
    Decode(#[from] FrameDecodeError),
    #[error("session: {0}")]
    Session(#[from] SessionError),
    #[error("transfer: {0}")]
    Transfer(#[from] TransferError),
    #[error("no live connection")]
    NotConnected,
    #[error("a session is already live")]
    Busy,
    #[error("unknown peer {0}")]
    UnknownPeer(String),
    #[error("timed out")]
    TimedOut,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
