//! Wharf Wire Protocol
//!
//! This crate defines the protocol types shared between the broker, the
//! browser providers and offloading clients. Every message on a provider or
//! client socket is a framed [`Envelope`] carrying a sequence number, a kind
//! discriminator and a self-describing payload (type URL + bytes).
//!
//! # Wire Format
//!
//! Two encodings of the envelope are supported, negotiated once per
//! connection through the WebSocket subprotocol:
//!
//! - [`Subprotocol::Protobuf`] (`wharf.provider.v1.protobuf`) — compact
//!   binary frames, encoded with prost.
//! - [`Subprotocol::Json`] (`wharf.provider.v1.json`) — one JSON document
//!   per text frame, with payload bytes base64-encoded.
//!
//! The choice is fixed for the lifetime of the connection; a frame whose
//! wire type (binary vs text) disagrees with the negotiated subprotocol is a
//! protocol violation and closes the connection.
//!
//! Payload *values* are always protobuf bytes, regardless of the envelope
//! encoding, so unpacking does not depend on the negotiated codec.

mod codec;
mod envelope;
mod error;
mod messages;
pub mod serde_utils;

pub use codec::Subprotocol;
pub use envelope::{pack_any, unpack_any, AnyPayload, Envelope, MessageType, Payload};
pub use error::{ProtocolError, Result};
pub use messages::{
    CancelTask, ClusterInfo, Event, File, FileListingRequest, FileListingResponse,
    FileProbeRequest, FileProbeResponse, FileUploadRequest, FileUploadResponse, GenericMessage,
    OffloadJobRequest, OffloadJobResponse, ProviderHello, ProviderResources, PyodideParams,
    FileSystemUpdate, TaskMetadata, TaskOutput, TaskParams, TaskRequest, TaskResponse, TaskResult,
    Throughput, Wasip1Params,
};

/// Protocol version, bumped on incompatible changes to the message set.
pub const PROTOCOL_VERSION: u32 = 1;

/// Type URL prefix used in self-describing payloads.
pub const TYPE_URL_PREFIX: &str = "wharf/";

/// Maximum size of a single envelope frame (64 MiB). Larger frames are
/// rejected before decoding to bound peer-controlled allocations.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;
