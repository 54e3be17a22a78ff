//! Wire layer between a bench server and its clients.
//!
//! # Architecture
//!
//! - **protocol**: Message types (addresses, commands, responses, control signals)
//! - **codec**: Length + SHA-256 digest framing with JSON payloads
//! - **channel**: send/recv endpoints over sockets or in-process queues

pub mod channel;
pub mod codec;
pub mod protocol;

use thiserror::Error;

/// Failures that end one connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("socket connection lost")]
    ConnectionLost,

    #[error("malformed frame header: {0}")]
    MalformedHeader(String),

    #[error("frame digest mismatch (header {expected}, payload {actual})")]
    DigestMismatch { expected: String, actual: String },

    #[error("frame of {length} bytes exceeds limit of {max}")]
    FrameTooLarge { length: usize, max: usize },

    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("channel closed")]
    ChannelClosed,
}
