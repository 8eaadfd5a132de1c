//! Message-framed duplex transports
//!
//! A [`Transport`] carries protocol envelopes over some connection. Writes
//! are safe to invoke concurrently; reads are restricted to a single reader
//! (the messenger's receiver loop). A codec error on one message does not by
//! itself close the connection; a network error does.

mod memory;
mod websocket;

pub use memory::MemoryTransport;
pub use websocket::WebSocketTransport;

use crate::error::Result;
use async_trait::async_trait;
use wharf_protocol::Envelope;

/// An abstract connection that serializes envelopes over the wire.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Marshal and send one envelope. Safe for concurrent callers.
    async fn write_message(&self, envelope: &Envelope) -> Result<()>;

    /// Receive and unmarshal the next envelope. NOT safe for concurrent
    /// reads; limit to a single reader.
    async fn read_message(&self) -> Result<Envelope>;

    /// The remote peer's address, for logging and registry keys.
    fn remote_addr(&self) -> String;

    /// Close the connection, best-effort telling the peer why. Idempotent.
    async fn close(&self, cause: Option<String>);
}
