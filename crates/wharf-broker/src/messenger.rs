//! Bidirectional RPC over a transport
//!
//! A [`Messenger`] layers request/response/event semantics onto a raw
//! transport. Requests get per-direction monotonic sequence numbers and a
//! pending-call entry; the single receiver loop routes responses back to the
//! caller's completion channel and fans incoming events and requests out on
//! dedicated streams.
//!
//! Delivery policy on full channels differs by kind: events are dropped with
//! a warning, requests MUST be delivered and fall back to a spawned writer.
//!
//! Ordering: a response for sequence S is observed only after the request S
//! was transmitted. There is no FIFO guarantee between requests, responses
//! and events; callers that need ordered RPC must serialize themselves.

use crate::error::{Error, Result};
use crate::lifetime::Lifetime;
use crate::transport::Transport;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use wharf_protocol::{pack_any, unpack_any, AnyPayload, Envelope, Event, MessageType, Payload};

/// Incoming event channel capacity; overflow is dropped with a warning.
const EVENTS_CAPACITY: usize = 32;
/// Incoming request channel capacity; overflow is delivered by a spawned task.
const REQUESTS_CAPACITY: usize = 512;

type CallResult = std::result::Result<AnyPayload, Error>;

struct PendingCall {
    tx: oneshot::Sender<CallResult>,
}

struct PendingMap {
    calls: HashMap<u64, PendingCall>,
    /// set once the messenger refuses new calls
    closed: Option<Error>,
}

/// RPC endpoint on one transport. Construct with [`Messenger::new`], which
/// also hands out the incoming streams and spawns the receiver loop.
pub struct Messenger {
    transport: Arc<dyn Transport>,
    lifetime: Lifetime,
    request_seq: AtomicU64,
    event_seq: AtomicU64,
    pending: Mutex<PendingMap>,
}

impl std::fmt::Debug for Messenger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Messenger")
            .field("request_seq", &self.request_seq)
            .field("event_seq", &self.event_seq)
            .finish_non_exhaustive()
    }
}

/// The receive side of a messenger: decoded events and incoming requests.
pub struct IncomingStreams {
    pub events: mpsc::Receiver<Event>,
    pub requests: mpsc::Receiver<IncomingRequest>,
}

impl Messenger {
    /// Wrap a transport and start the receiver loop. The caller must drain
    /// the returned streams, or at least drop them.
    pub fn new(transport: Arc<dyn Transport>) -> (Arc<Messenger>, IncomingStreams) {
        let (events_tx, events) = mpsc::channel(EVENTS_CAPACITY);
        let (requests_tx, requests) = mpsc::channel(REQUESTS_CAPACITY);

        let messenger = Arc::new(Messenger {
            transport,
            lifetime: Lifetime::new(),
            request_seq: AtomicU64::new(0),
            event_seq: AtomicU64::new(0),
            pending: Mutex::new(PendingMap {
                calls: HashMap::new(),
                closed: None,
            }),
        });

        tokio::spawn(messenger.clone().receiver(events_tx, requests_tx));

        (messenger, IncomingStreams { events, requests })
    }

    pub fn remote_addr(&self) -> String {
        self.transport.remote_addr()
    }

    // ── closure ──────────────────────────────────────────────────────

    /// The close cause, or `None` while the messenger is alive.
    pub fn err(&self) -> Option<Error> {
        self.lifetime.err()
    }

    /// Wait for the messenger to close.
    pub async fn closing(&self) {
        self.lifetime.closing().await
    }

    /// Close the messenger and the underlying transport. The receiver loop
    /// wakes up and fails all pending calls with the cause.
    pub async fn close(&self, reason: Error) {
        if self.lifetime.is_closed() {
            return;
        }
        self.lifetime.cancel(reason.clone());
        self.transport.close(Some(reason.to_string())).await;
    }

    // ── transmitter ──────────────────────────────────────────────────

    async fn send(
        &self,
        sequence: Option<u64>,
        kind: MessageType,
        payload: Option<AnyPayload>,
        error: Option<String>,
    ) -> Result<()> {
        let envelope = Envelope {
            sequence,
            kind: kind as i32,
            payload,
            error,
        };
        self.transport.write_message(&envelope).await
    }

    /// Send an event with the next event sequence number. No pending
    /// registration; there will be no reply.
    pub async fn send_event(&self, event: &Event) -> Result<()> {
        if let Some(err) = self.err() {
            return Err(err);
        }
        let seq = self.event_seq.fetch_add(1, Ordering::Relaxed) + 1;
        self.send(Some(seq), MessageType::Event, Some(event.to_any()), None)
            .await
    }

    /// Send a response to a previously received request, reusing its
    /// sequence number.
    pub async fn send_response(
        &self,
        sequence: u64,
        payload: Option<AnyPayload>,
        error: Option<String>,
    ) -> Result<()> {
        self.send(Some(sequence), MessageType::Response, payload, error)
            .await
    }

    /// Send a request and register a pending call for its response. The
    /// returned handle always resolves: with the decoded response, the error
    /// string from the peer, or the failure that ended the call.
    pub async fn send_request<Q, R>(&self, request: &Q) -> PendingReply<R>
    where
        Q: Payload,
        R: Payload,
    {
        let (tx, rx) = oneshot::channel();
        let reply = PendingReply {
            rx,
            _marker: PhantomData,
        };

        // register in the pending map first, so a fast response finds it
        let seq = self.request_seq.fetch_add(1, Ordering::Relaxed) + 1;
        {
            let mut pending = self.pending.lock();
            if let Some(cause) = &pending.closed {
                let _ = tx.send(Err(cause.clone()));
                return reply;
            }
            pending.calls.insert(seq, PendingCall { tx });
        }

        let payload = pack_any(request);
        if let Err(e) = self
            .send(Some(seq), MessageType::Request, Some(payload), None)
            .await
        {
            // unregister immediately on send failure
            if let Some(call) = self.pending.lock().calls.remove(&seq) {
                let _ = call.tx.send(Err(e));
            }
        }
        reply
    }

    /// Synchronous RPC: send a request and await its response, racing the
    /// given token. On cancellation the call returns immediately; the
    /// underlying exchange may still complete and is dropped.
    pub async fn request_sync<Q, R>(&self, token: &CancellationToken, request: &Q) -> Result<R>
    where
        Q: Payload,
        R: Payload,
    {
        let reply = self.send_request::<Q, R>(request).await;
        tokio::select! {
            result = reply.recv() => result,
            _ = token.cancelled() => Err(Error::Cancelled("context cancelled".to_string())),
        }
    }

    // ── receiver ─────────────────────────────────────────────────────

    /// Continuously read from the transport: route responses to pending
    /// calls, fan out events and requests. On any fatal error, fail all
    /// pending calls with the cause and close down.
    async fn receiver(
        self: Arc<Self>,
        events_tx: mpsc::Sender<Event>,
        requests_tx: mpsc::Sender<IncomingRequest>,
    ) {
        let receive_err = loop {
            let envelope = match self.transport.read_message().await {
                Ok(envelope) => envelope,
                Err(e) => break e,
            };

            match envelope.message_type() {
                MessageType::Request => {
                    let seq = envelope.sequence();
                    let Some(payload) = envelope.payload else {
                        break Error::Codec("request without payload".to_string());
                    };
                    self.put_request(&requests_tx, seq, payload);
                }

                MessageType::Event => {
                    let Some(payload) = envelope.payload else {
                        break Error::Codec("event without payload".to_string());
                    };
                    let event = match Event::from_any(&payload) {
                        Ok(event) => event,
                        Err(e) => break Error::Codec(format!("unpacking event payload: {e}")),
                    };
                    // never block: drop events when the channel is full
                    if events_tx.try_send(event).is_err() {
                        warn!(addr = %self.remote_addr(), "dropped event, channel is full");
                    }
                }

                MessageType::Response => {
                    // valid RPC responses are never 0, which also covers an
                    // unset sequence field
                    let seq = envelope.sequence();
                    let Some(call) = self.pending.lock().calls.remove(&seq) else {
                        warn!(addr = %self.remote_addr(), seq, "no pending call for response");
                        continue;
                    };
                    let result = match (envelope.error, envelope.payload) {
                        (Some(error), _) => Err(Error::Remote(error)),
                        (None, Some(payload)) => Ok(payload),
                        (None, None) => Err(Error::Codec("response without payload".to_string())),
                    };
                    let _ = call.tx.send(result);
                }

                MessageType::Unknown => {
                    break Error::Codec("received an unknown message type".to_string());
                }
            }
        };

        // receiver failed or the transport closed: tidy up. If close() was
        // called, prefer its cause over our read error.
        let cause = self.lifetime.err().unwrap_or(receive_err);
        debug!(addr = %self.remote_addr(), %cause, "messenger receiver closing");
        {
            let mut pending = self.pending.lock();
            pending.closed = Some(cause.clone());
            for (_, call) in pending.calls.drain() {
                let _ = call.tx.send(Err(cause.clone()));
            }
        }
        self.transport.close(Some(cause.to_string())).await;
        self.lifetime.cancel(cause);
        // events_tx and requests_tx drop here, ending the incoming streams
    }

    /// Enqueue an incoming request. Requests must be delivered or answered,
    /// so a full queue falls back to a spawned writer instead of dropping.
    fn put_request(
        self: &Arc<Self>,
        requests_tx: &mpsc::Sender<IncomingRequest>,
        seq: u64,
        payload: AnyPayload,
    ) {
        let request = IncomingRequest {
            seq,
            payload,
            messenger: self.clone(),
        };
        if let Err(mpsc::error::TrySendError::Full(request)) = requests_tx.try_send(request) {
            warn!(addr = %self.remote_addr(), seq, "request queue is full, deferring");
            let requests_tx = requests_tx.clone();
            tokio::spawn(async move {
                let _ = requests_tx.send(request).await;
            });
        }
    }
}

/// Handle on a sent request, resolving to the typed response.
pub struct PendingReply<R> {
    rx: oneshot::Receiver<CallResult>,
    _marker: PhantomData<R>,
}

impl<R: Payload> PendingReply<R> {
    /// Await completion: response arrival, transport close, or send failure.
    /// Exactly one of these resolves every call.
    pub async fn recv(self) -> Result<R> {
        match self.rx.await {
            Ok(Ok(payload)) => {
                unpack_any::<R>(&payload).map_err(|e| Error::Codec(format!("unpacking response payload: {e}")))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Closing("pending call dropped".to_string())),
        }
    }
}

/// An incoming request passed up to the application, with a one-shot
/// responder. Dropping it unanswered leaves the peer to time out or fail on
/// transport close.
pub struct IncomingRequest {
    pub seq: u64,
    pub payload: AnyPayload,
    messenger: Arc<Messenger>,
}

impl IncomingRequest {
    /// Respond to this request. Consumes the request, so a response is sent
    /// at most once.
    pub async fn respond(self, payload: Option<AnyPayload>, error: Option<String>) -> Result<()> {
        self.messenger.send_response(self.seq, payload, error).await
    }

    /// Decode the payload into the expected request type.
    pub fn unpack<M: Payload>(&self) -> Result<M> {
        unpack_any(&self.payload).map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use std::time::Duration;
    use wharf_protocol::{
        FileProbeRequest, FileProbeResponse, GenericMessage, ProviderHello,
    };

    fn pair() -> (
        (Arc<Messenger>, IncomingStreams),
        (Arc<Messenger>, IncomingStreams),
    ) {
        let (left, right) = MemoryTransport::pair("broker", "provider");
        (
            Messenger::new(Arc::new(left)),
            Messenger::new(Arc::new(right)),
        )
    }

    /// Answer every probe request on the peer side with `ok = true`.
    fn spawn_probe_responder(mut streams: IncomingStreams) {
        tokio::spawn(async move {
            while let Some(request) = streams.requests.recv().await {
                let probe: FileProbeRequest = request.unpack().unwrap();
                let response = FileProbeResponse {
                    ok: Some(probe.file.is_some()),
                };
                request
                    .respond(Some(pack_any(&response)), None)
                    .await
                    .unwrap();
            }
        });
    }

    #[tokio::test]
    async fn test_request_response_roundtrip() {
        let ((broker, _bstreams), (_provider, pstreams)) = pair();
        spawn_probe_responder(pstreams);

        let token = CancellationToken::new();
        let response: FileProbeResponse = broker
            .request_sync(
                &token,
                &FileProbeRequest {
                    file: Some("sha256:abc".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(response.ok, Some(true));
    }

    #[tokio::test]
    async fn test_concurrent_requests_resolve_independently() {
        let ((broker, _bstreams), (_provider, pstreams)) = pair();
        spawn_probe_responder(pstreams);

        let token = CancellationToken::new();
        let mut handles = Vec::new();
        for i in 0..16 {
            let broker = broker.clone();
            let token = token.clone();
            handles.push(tokio::spawn(async move {
                broker
                    .request_sync::<_, FileProbeResponse>(
                        &token,
                        &FileProbeRequest {
                            file: Some(format!("sha256:{i}")),
                        },
                    )
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().ok, Some(true));
        }
    }

    #[tokio::test]
    async fn test_remote_error_string_fails_call() {
        let ((broker, _bstreams), (_provider, mut pstreams)) = pair();
        tokio::spawn(async move {
            let request = pstreams.requests.recv().await.unwrap();
            request
                .respond(None, Some("no such file".to_string()))
                .await
                .unwrap();
        });

        let token = CancellationToken::new();
        let err = broker
            .request_sync::<_, FileProbeResponse>(&token, &FileProbeRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Remote(msg) if msg == "no such file"));
    }

    #[tokio::test]
    async fn test_close_fails_pending_calls() {
        let ((broker, _bstreams), (provider, _pstreams)) = pair();
        // peer never answers

        let reply = broker
            .send_request::<FileProbeRequest, FileProbeResponse>(&FileProbeRequest::default())
            .await;
        provider
            .close(Error::Connection("pulled the plug".into()))
            .await;

        let err = reply.recv().await.unwrap_err();
        assert!(err.is_retryable(), "close cause should be retryable: {err}");
    }

    #[tokio::test]
    async fn test_request_after_close_fails_immediately() {
        let ((broker, _bstreams), _peer) = pair();
        broker.close(Error::Closing("shutdown".into())).await;
        // give the receiver a moment to mark the pending map closed
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = broker
            .send_request::<FileProbeRequest, FileProbeResponse>(&FileProbeRequest::default())
            .await
            .recv()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Closing(_) | Error::Connection(_)));
    }

    #[tokio::test]
    async fn test_events_are_delivered() {
        let ((broker, _bstreams), (_provider, mut pstreams)) = pair();
        broker
            .send_event(&Event::GenericMessage(GenericMessage {
                message: Some("hello".into()),
            }))
            .await
            .unwrap();

        let event = pstreams.events.recv().await.unwrap();
        assert!(matches!(
            event,
            Event::GenericMessage(GenericMessage { message: Some(m) }) if m == "hello"
        ));
    }

    #[tokio::test]
    async fn test_cancelled_sync_request_returns_early() {
        let ((broker, _bstreams), _peer) = pair(); // peer never answers
        let token = CancellationToken::new();
        token.cancel();

        let err = broker
            .request_sync::<_, FileProbeResponse>(&token, &FileProbeRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
    }

    #[tokio::test]
    async fn test_unsolicited_response_is_dropped() {
        let ((broker, _bstreams), (provider, pstreams)) = pair();
        // a response for a sequence number nobody is waiting on
        provider.send_response(999, None, None).await.unwrap();

        // messenger survives: a normal roundtrip still works afterwards
        spawn_probe_responder(pstreams);
        let token = CancellationToken::new();
        let response: FileProbeResponse = broker
            .request_sync(
                &token,
                &FileProbeRequest {
                    file: Some("sha256:x".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(response.ok, Some(true));
    }

    #[tokio::test]
    async fn test_response_sequence_matches_request() {
        let ((broker, _bstreams), (_provider, mut pstreams)) = pair();
        tokio::spawn(async move {
            // answer out of order: second request first
            let first = pstreams.requests.recv().await.unwrap();
            let second = pstreams.requests.recv().await.unwrap();
            assert_eq!(first.seq, 1);
            assert_eq!(second.seq, 2);
            second
                .respond(Some(pack_any(&GenericMessage { message: Some("2".into()) })), None)
                .await
                .unwrap();
            first
                .respond(Some(pack_any(&GenericMessage { message: Some("1".into()) })), None)
                .await
                .unwrap();
        });

        let reply1 = broker
            .send_request::<ProviderHello, GenericMessage>(&ProviderHello::default())
            .await;
        let reply2 = broker
            .send_request::<ProviderHello, GenericMessage>(&ProviderHello::default())
            .await;

        // each reply is routed by its own sequence despite reordering
        assert_eq!(reply1.recv().await.unwrap().message.as_deref(), Some("1"));
        assert_eq!(reply2.recv().await.unwrap().message.as_deref(), Some("2"));
    }
}
