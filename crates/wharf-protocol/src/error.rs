//! Protocol error types

use thiserror::Error;

/// Errors arising while encoding or decoding protocol messages.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    /// Encoding a message failed
    #[error("encode error: {0}")]
    Encode(String),

    /// Decoding a message failed
    #[error("decode error: {0}")]
    Decode(String),

    /// A payload's type URL does not match the expected message type
    #[error("payload type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    /// A payload's type URL names no known message type
    #[error("unknown payload type: {0}")]
    UnknownType(String),

    /// Frame exceeds the maximum allowed size
    #[error("frame size {0} exceeds maximum {1}")]
    FrameTooLarge(usize, usize),

    /// The peer requested no supported subprotocol
    #[error("unsupported subprotocol: {0:?}")]
    UnsupportedSubprotocol(Option<String>),
}

impl From<prost::DecodeError> for ProtocolError {
    fn from(e: prost::DecodeError) -> Self {
        ProtocolError::Decode(e.to_string())
    }
}

impl From<prost::EncodeError> for ProtocolError {
    fn from(e: prost::EncodeError) -> Self {
        ProtocolError::Encode(e.to_string())
    }
}

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;
