//! Gossipnet Protocol -- wire types, frame codec, payload encodings.
//!
//! Plain TCP between peers. Every frame is a fixed 27-byte header followed
//! by a command-specific payload. All integers are little-endian.

pub mod codec;
pub mod identity;
pub mod messages;

pub use codec::{Frame, FrameCodec, Header};
pub use identity::PeerId;
pub use messages::*;

/// Handshake command code. Always the first frame on a fresh socket.
pub const CMD_HANDSHAKE: u8 = 1;

/// Peer-list exchange command code.
pub const CMD_EXCHANGE_PEER_LIST: u8 = 2;

/// Keep-alive command code.
pub const CMD_PING: u8 = 3;

/// Largest payload accepted on an established connection.
pub const READ_BUFFER_SIZE: usize = u16::MAX as usize;

/// Upper bound on the whole handshake frame (header + payload).
pub const HANDSHAKE_BUFFER_SIZE: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("no header: {len} bytes available, {needed} required")]
    NoHeader { len: usize, needed: usize },
    #[error("net id mismatch: expected {expected}, got {got}")]
    NetMismatch { expected: u8, got: u8 },
    #[error("length mismatch: header declares {declared} payload bytes, {actual} received")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("invalid peer id: {0}")]
    InvalidPeerId(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
