//! WebSocket transport
//!
//! Wraps an upgraded axum WebSocket. The envelope codec was fixed during the
//! subprotocol handshake: protobuf connections carry binary frames, JSON
//! connections carry text frames. A frame of the wrong type is answered with
//! an unsupported-data close and a codec error.

use super::Transport;
use crate::error::{Error, Result};
use async_trait::async_trait;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use wharf_protocol::{Envelope, Subprotocol};

pub struct WebSocketTransport {
    writer: Mutex<SplitSink<WebSocket, Message>>,
    reader: Mutex<SplitStream<WebSocket>>,
    codec: Subprotocol,
    remote: String,
    closed: AtomicBool,
}

impl WebSocketTransport {
    /// Wrap an upgraded socket whose subprotocol negotiation already
    /// succeeded.
    pub fn new(socket: WebSocket, codec: Subprotocol, remote: String) -> Self {
        let (writer, reader) = socket.split();
        Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            codec,
            remote,
            closed: AtomicBool::new(false),
        }
    }

    /// The codec negotiated for this connection.
    pub fn codec(&self) -> Subprotocol {
        self.codec
    }

    async fn close_with(&self, code: u16, reason: String) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut writer = self.writer.lock().await;
        // reason strings are capped by the close frame size limit
        let mut reason = reason;
        reason.truncate(120);
        let _ = writer
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: reason.into(),
            })))
            .await;
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn write_message(&self, envelope: &Envelope) -> Result<()> {
        let bytes = self
            .codec
            .encode(envelope)
            .map_err(|e| Error::Codec(format!("marshal: {e}")))?;
        let frame = if self.codec.is_binary() {
            Message::Binary(bytes)
        } else {
            let text =
                String::from_utf8(bytes).map_err(|e| Error::Codec(format!("marshal: {e}")))?;
            Message::Text(text)
        };

        let mut writer = self.writer.lock().await;
        writer
            .send(frame)
            .await
            .map_err(|e| Error::Connection(format!("websocket: {e}")))
    }

    async fn read_message(&self) -> Result<Envelope> {
        let mut reader = self.reader.lock().await;
        loop {
            let message = match reader.next().await {
                Some(Ok(m)) => m,
                Some(Err(e)) => return Err(Error::Connection(format!("websocket: {e}"))),
                None => return Err(Error::Connection("websocket: stream ended".to_string())),
            };

            let bytes = match message {
                Message::Binary(b) => {
                    if !self.codec.is_binary() {
                        let cause = format!("sent binary frame to a {} transport", self.codec);
                        drop(reader);
                        self.close_with(close_code::UNSUPPORTED, cause.clone()).await;
                        return Err(Error::Codec(format!("wrong message type: {cause}")));
                    }
                    b
                }
                Message::Text(t) => {
                    if self.codec.is_binary() {
                        let cause = format!("sent text frame to a {} transport", self.codec);
                        drop(reader);
                        self.close_with(close_code::UNSUPPORTED, cause.clone()).await;
                        return Err(Error::Codec(format!("wrong message type: {cause}")));
                    }
                    t.into_bytes()
                }
                // axum answers pings on its own, nothing to do for us
                Message::Ping(_) | Message::Pong(_) => continue,
                Message::Close(frame) => {
                    let reason = frame
                        .map(|f| f.reason.to_string())
                        .unwrap_or_else(|| "no reason".to_string());
                    return Err(Error::Connection(format!("websocket closed: {reason}")));
                }
            };

            return self
                .codec
                .decode(&bytes)
                .map_err(|e| Error::Codec(format!("unmarshal: {e}")));
        }
    }

    fn remote_addr(&self) -> String {
        self.remote.clone()
    }

    async fn close(&self, cause: Option<String>) {
        match cause {
            None => self.close_with(close_code::NORMAL, "bye!".to_string()).await,
            Some(cause) => self.close_with(close_code::ERROR, cause).await,
        }
    }
}
