//! LAN chat for Linux: discovery responder, session engine, file transfer.

pub mod blob;
pub mod config;
pub mod discovery;
pub mod error;
pub mod service;
pub mod transport;

pub use config::Config;
pub use discovery::{DiscoveryService, ServeStatus};
pub use error::{Error, Result};
pub use service::{ChatService, Completion};
pub use transport::{EngineEvent, EngineEvents, InviteCallback, SessionEngine};
