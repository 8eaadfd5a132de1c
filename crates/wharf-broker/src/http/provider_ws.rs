//! The provider socket endpoint

use super::client::negotiated_codec;
use super::{origin_allowed, proxied_addr, AppState};
use crate::error::Error;
use crate::messenger::Messenger;
use crate::provider::Provider;
use crate::transport::WebSocketTransport;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};
use wharf_protocol::Subprotocol;

/// `GET /api/provider/ws` — upgrade to a long-lived provider session with a
/// subprotocol-negotiated codec.
pub(super) async fn provider_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    if !origin_allowed(&state.allowed_origins, &headers) {
        return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
    }

    let addr = proxied_addr(&headers, peer);
    ws.protocols(Subprotocol::offered())
        .on_upgrade(move |socket| handle_provider_socket(socket, state, addr))
        .into_response()
}

async fn handle_provider_socket(mut socket: WebSocket, state: AppState, addr: String) {
    // reject unsupported (empty) subprotocol before any messenger exists
    let Some(codec) = negotiated_codec(&socket) else {
        warn!(%addr, "new provider: unsupported subprotocol");
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: close_code::PROTOCOL,
                reason: "must use a supported wharf.provider.v1 subprotocol".into(),
            })))
            .await;
        return;
    };

    let transport = Arc::new(WebSocketTransport::new(socket, codec, addr.clone()));
    let (messenger, streams) = Messenger::new(transport);
    let provider = Provider::new(messenger);
    tokio::spawn(provider.clone().handle_messages(streams));

    // learn what the provider already has before it gets tasks
    if let Err(e) = provider.list_files().await {
        warn!(%addr, "new provider: listing files failed: {e}");
        provider
            .close(Error::Closing(format!("initial file listing failed: {e}")))
            .await;
        return;
    }

    info!(%addr, %codec, "new provider connected");
    state.registry.add(provider.clone());

    // hold the session open until it closes, then clean up
    provider.closing().await;
    state.registry.remove(&provider.addr());
    info!(%addr, "provider session closed");
}
