//! The envelope — unit of communication on provider and client sockets
//!
//! An [`Envelope`] is one framed message: a kind discriminator (request,
//! response or event), an optional per-direction sequence number, an optional
//! self-describing payload and an optional error string (only meaningful on
//! responses). Sequence `0` is reserved; valid RPC sequences start at 1.

use crate::error::{ProtocolError, Result};
use bytes::Bytes;
use prost::Message;
use serde::{Deserialize, Serialize};

/// Envelope kind discriminator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum MessageType {
    Unknown = 0,
    Request = 1,
    Response = 2,
    Event = 3,
}

/// A self-describing payload: a type URL naming the message type plus the
/// protobuf-encoded message bytes. In JSON frames the bytes are base64.
#[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Message)]
pub struct AnyPayload {
    #[prost(string, tag = "1")]
    pub type_url: String,
    #[prost(bytes = "bytes", tag = "2")]
    #[serde(with = "crate::serde_utils::base64_bytes")]
    pub value: Bytes,
}

/// The framed wire unit. See the module docs for field semantics.
#[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Message)]
pub struct Envelope {
    /// Monotonic per direction and per kind; a response echoes the sequence
    /// of its request. Zero is reserved and never allocated.
    #[prost(uint64, optional, tag = "1")]
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sequence: Option<u64>,

    #[prost(enumeration = "MessageType", tag = "2")]
    #[serde(rename = "type")]
    pub kind: i32,

    #[prost(message, optional, tag = "3")]
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub payload: Option<AnyPayload>,

    /// Error string, only meaningful on responses.
    #[prost(string, optional, tag = "4")]
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

impl Envelope {
    /// The kind discriminator, mapping unknown values to [`MessageType::Unknown`].
    pub fn message_type(&self) -> MessageType {
        MessageType::try_from(self.kind).unwrap_or(MessageType::Unknown)
    }

    // Note: `sequence()` is auto-generated by the `::prost::Message` derive for
    // this optional scalar field, returning 0 when unset — no manual impl needed.
}

/// Implemented by every protocol message that can travel inside an
/// [`AnyPayload`]. The type URL must be stable across releases.
pub trait Payload: Message + Default + Sized {
    const TYPE_URL: &'static str;
}

/// Pack a message into a self-describing payload.
pub fn pack_any<M: Payload>(msg: &M) -> AnyPayload {
    AnyPayload {
        type_url: M::TYPE_URL.to_string(),
        value: Bytes::from(msg.encode_to_vec()),
    }
}

/// Unpack a payload into the expected message type, checking the type URL.
pub fn unpack_any<M: Payload>(any: &AnyPayload) -> Result<M> {
    if any.type_url != M::TYPE_URL {
        return Err(ProtocolError::TypeMismatch {
            expected: M::TYPE_URL.to_string(),
            actual: any.type_url.clone(),
        });
    }
    M::decode(any.value.clone()).map_err(ProtocolError::from)
}
