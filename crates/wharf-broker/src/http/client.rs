//! Client routes: the job endpoint and the per-task client socket

use super::{proxied_addr, AppState};
use crate::jobs::{self, OffloadingJob};
use crate::provider::AsyncTask;
use crate::transport::WebSocketTransport;
use crate::messenger::{IncomingRequest, Messenger};
use axum::body::Bytes;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use prost::Message as _;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wharf_protocol::{
    pack_any, OffloadJobRequest, OffloadJobResponse, Payload, Subprotocol, TaskMetadata,
    TaskParams, TaskRequest, Wasip1Params,
};

/// Job request/response content types.
const MEDIA_JSON: &str = "application/json";
const MEDIA_PROTOBUF: &str = "application/protobuf";

/// `POST /api/client/run` — accept an offloading job, dispatch it and
/// return the aggregated response in the request's format.
pub(super) async fn run_job(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let media = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or_default().trim().to_ascii_lowercase())
        .unwrap_or_default();
    if media != MEDIA_JSON && media != MEDIA_PROTOBUF {
        return (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "unsupported request content-type",
        )
            .into_response();
    }

    let spec = match unmarshal_job(&media, &body) {
        Ok(spec) => spec,
        Err(failure) => {
            let response = OffloadJobResponse {
                failure: Some(failure),
                tasks: vec![],
            };
            return marshal_job_response(&media, StatusCode::BAD_REQUEST, &response);
        }
    };

    let client_addr = proxied_addr(&headers, peer);
    let job = OffloadingJob::new(client_addr, spec);

    // the guard cancels in-flight tasks if this handler is dropped because
    // the client went away
    let token = CancellationToken::new();
    let _guard = token.clone().drop_guard();

    let response = jobs::dispatch_job(&state.registry, &state.queue, &token, job).await;

    if token.is_cancelled() {
        return (StatusCode::REQUEST_TIMEOUT, "request canceled").into_response();
    }

    // a non-2xx code on any failure, while still delivering the full body
    let failed = response.failure.is_some() || response.tasks.iter().any(|t| !t.is_ok());
    let status = if failed {
        StatusCode::FAILED_DEPENDENCY
    } else {
        StatusCode::OK
    };
    marshal_job_response(&media, status, &response)
}

fn unmarshal_job(media: &str, body: &[u8]) -> Result<OffloadJobRequest, String> {
    let spec: OffloadJobRequest = match media {
        MEDIA_JSON => {
            serde_json::from_slice(body).map_err(|e| format!("unmarshalling failed: {e}"))?
        }
        MEDIA_PROTOBUF => OffloadJobRequest::decode(body)
            .map_err(|e| format!("unmarshalling failed: {e}"))?,
        _ => unreachable!("content-type checked by caller"),
    };
    Ok(spec)
}

fn marshal_job_response(media: &str, status: StatusCode, response: &OffloadJobResponse) -> Response {
    let body = match media {
        MEDIA_JSON => serde_json::to_vec(response).map(Bytes::from),
        _ => Ok(Bytes::from(response.encode_to_vec())),
    };
    match body {
        Ok(body) => (
            status,
            [(header::CONTENT_TYPE.as_str(), media.to_string())],
            body,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("response marshalling failed: {e}"),
        )
            .into_response(),
    }
}

/// `GET /api/client/ws` — per-task streaming socket. Every incoming request
/// is one task; all tasks of a socket share one synthetic job id.
pub(super) async fn client_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let addr = proxied_addr(&headers, peer);
    // clients can connect from anywhere, no origin check here
    ws.protocols(Subprotocol::offered())
        .on_upgrade(move |socket| handle_client_socket(socket, state, addr))
}

async fn handle_client_socket(mut socket: WebSocket, state: AppState, addr: String) {
    let codec = match negotiated_codec(&socket) {
        Some(codec) => codec,
        None => {
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::PROTOCOL,
                    reason: "must use a supported wharf.provider.v1 subprotocol".into(),
                })))
                .await;
            return;
        }
    };

    let transport = Arc::new(WebSocketTransport::new(socket, codec, addr.clone()));
    let (messenger, mut streams) = Messenger::new(transport);
    info!(%addr, %codec, "new client socket");

    // all tasks on this socket are counted as one job
    let job_id = format!("ws/{}", jobs::next_job_id());
    let mut task_seq: u64 = 0;

    // cancel in-flight tasks when the socket dies
    let token = CancellationToken::new();
    let _guard = token.clone().drop_guard();

    let (done_tx, mut done_rx) = mpsc::channel(32);
    let mut pending: HashMap<String, IncomingRequest> = HashMap::new();

    loop {
        tokio::select! {
            _ = messenger.closing() => break,

            request = streams.requests.recv() => {
                let Some(request) = request else { break };
                task_seq += 1;
                handle_client_request(
                    &state, &job_id, &addr, task_seq, &token, &done_tx, &mut pending, request,
                )
                .await;
            }

            event = streams.events.recv() => {
                let Some(event) = event else { break };
                debug!(%addr, type_url = event.type_url(), "client event");
            }

            completion = done_rx.recv() => {
                // done_tx lives in this scope, the channel cannot close here
                let Some(completion) = completion else { break };
                let key = completion.request.task_id();
                let Some(request) = pending.remove(&key) else {
                    warn!(%addr, task = %key, "completion for unknown task");
                    continue;
                };
                let payload = completion.response.as_ref().map(pack_any);
                let error = completion.error.map(|e| e.to_string());
                let _ = request.respond(payload, error).await;
            }
        }
    }
    info!(%addr, "client socket closed");
}

/// Turn one incoming socket request into a queued task, or answer it with
/// an error right away.
#[allow(clippy::too_many_arguments)]
async fn handle_client_request(
    state: &AppState,
    job_id: &str,
    addr: &str,
    task_seq: u64,
    token: &CancellationToken,
    done_tx: &mpsc::Sender<crate::provider::TaskCompletion>,
    pending: &mut HashMap<String, IncomingRequest>,
    request: IncomingRequest,
) {
    if request.payload.type_url != Wasip1Params::TYPE_URL {
        let _ = request
            .respond(None, Some("request type not supported".to_string()))
            .await;
        return;
    }

    let mut params: Wasip1Params = match request.unpack() {
        Ok(params) => params,
        Err(e) => {
            let _ = request.respond(None, Some(e.to_string())).await;
            return;
        }
    };

    // resolve files before queueing; errors are per-request on the socket
    if let Err(e) = state.registry.storage.resolve_params(&mut params) {
        let _ = request.respond(None, Some(e.to_string())).await;
        return;
    }

    let task_request = TaskRequest {
        info: Some(TaskMetadata {
            job_id: Some(job_id.to_string()),
            index: Some(task_seq),
            client: Some(addr.to_string()),
        }),
        params: Some(TaskParams::Wasip1(params)),
    };

    // remember the socket request to answer when the task completes
    pending.insert(task_request.task_id(), request);
    let task = AsyncTask::new(token.clone(), task_request.clone(), done_tx.clone());
    if state.queue.send(task).await.is_err() {
        if let Some(request) = pending.remove(&task_request.task_id()) {
            let _ = request
                .respond(None, Some("dispatcher queue closed".to_string()))
                .await;
        }
    }
}

/// The subprotocol the upgrade negotiated, if it is one of ours.
pub(super) fn negotiated_codec(socket: &WebSocket) -> Option<Subprotocol> {
    let token = socket.protocol()?.to_str().ok()?;
    Subprotocol::from_token(Some(token)).ok()
}
