//! Subprotocol negotiation and envelope codecs
//!
//! The subprotocol token agreed during the WebSocket upgrade picks the
//! envelope encoding for the whole connection. [`Subprotocol::Protobuf`]
//! frames are binary, [`Subprotocol::Json`] frames are text; the transport
//! enforces that the frame type matches.

use crate::envelope::Envelope;
use crate::error::{ProtocolError, Result};
use crate::MAX_FRAME_SIZE;
use prost::Message;

/// The negotiated wire encoding of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subprotocol {
    /// `wharf.provider.v1.protobuf` — binary frames
    Protobuf,
    /// `wharf.provider.v1.json` — text frames
    Json,
}

impl Subprotocol {
    pub const PROTOBUF: &'static str = "wharf.provider.v1.protobuf";
    pub const JSON: &'static str = "wharf.provider.v1.json";

    /// Tokens offered during the upgrade handshake, in order of preference.
    pub const fn offered() -> [&'static str; 2] {
        [Self::PROTOBUF, Self::JSON]
    }

    /// Map a negotiated token back to a codec. `None` or an unknown token
    /// means the peer supports nothing we speak and must be rejected.
    pub fn from_token(token: Option<&str>) -> Result<Self> {
        match token {
            Some(Self::PROTOBUF) => Ok(Subprotocol::Protobuf),
            Some(Self::JSON) => Ok(Subprotocol::Json),
            other => Err(ProtocolError::UnsupportedSubprotocol(
                other.map(str::to_string),
            )),
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Subprotocol::Protobuf => Self::PROTOBUF,
            Subprotocol::Json => Self::JSON,
        }
    }

    /// True if this codec uses binary frames (vs text frames).
    pub const fn is_binary(&self) -> bool {
        matches!(self, Subprotocol::Protobuf)
    }

    /// Marshal an envelope into frame bytes for this codec.
    pub fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        match self {
            Subprotocol::Protobuf => Ok(envelope.encode_to_vec()),
            Subprotocol::Json => {
                serde_json::to_vec(envelope).map_err(|e| ProtocolError::Encode(e.to_string()))
            }
        }
    }

    /// Unmarshal an envelope from frame bytes, enforcing the size bound.
    pub fn decode(&self, bytes: &[u8]) -> Result<Envelope> {
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(bytes.len(), MAX_FRAME_SIZE));
        }
        match self {
            Subprotocol::Protobuf => Envelope::decode(bytes).map_err(ProtocolError::from),
            Subprotocol::Json => {
                serde_json::from_slice(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
            }
        }
    }
}

impl std::fmt::Display for Subprotocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
