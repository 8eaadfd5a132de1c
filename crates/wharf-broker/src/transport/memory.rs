//! In-memory transport pair
//!
//! Two crossed channels pretending to be a network connection. Used by the
//! test suites to drive messengers and provider sessions without sockets.
//! Closing either side fails the peer's reads and writes, like a broken
//! connection would.

use super::Transport;
use crate::error::{Error, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use wharf_protocol::Envelope;

pub struct MemoryTransport {
    tx: mpsc::Sender<Envelope>,
    rx: Mutex<mpsc::Receiver<Envelope>>,
    remote: String,
    /// shared between both ends: either side closing kills the pair
    closed: CancellationToken,
}

impl MemoryTransport {
    /// Create a connected pair of transports with the given peer names.
    pub fn pair(left_addr: &str, right_addr: &str) -> (MemoryTransport, MemoryTransport) {
        let (ltx, rrx) = mpsc::channel(64);
        let (rtx, lrx) = mpsc::channel(64);
        let closed = CancellationToken::new();
        let left = MemoryTransport {
            tx: ltx,
            rx: Mutex::new(lrx),
            remote: right_addr.to_string(),
            closed: closed.clone(),
        };
        let right = MemoryTransport {
            tx: rtx,
            rx: Mutex::new(rrx),
            remote: left_addr.to_string(),
            closed,
        };
        (left, right)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn write_message(&self, envelope: &Envelope) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::Connection("memory transport closed".to_string()));
        }
        self.tx
            .send(envelope.clone())
            .await
            .map_err(|_| Error::Connection("peer gone".to_string()))
    }

    async fn read_message(&self) -> Result<Envelope> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(Error::Connection("memory transport closed".to_string())),
            msg = rx.recv() => msg.ok_or_else(|| Error::Connection("peer gone".to_string())),
        }
    }

    fn remote_addr(&self) -> String {
        self.remote.clone()
    }

    async fn close(&self, _cause: Option<String>) {
        self.closed.cancel();
    }
}
