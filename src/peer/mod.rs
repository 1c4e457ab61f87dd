//! Peer wire protocol and per-peer session state machine.
pub mod handshake;
pub mod message;
pub mod session;

pub use handshake::{Handshake, HandshakeError};
pub use message::{Decoded, Message, MessageError};
pub use session::{run_pool, PeerSessionError};
