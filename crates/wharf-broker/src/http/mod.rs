//! The broker's HTTP surface
//!
//! Routes, in one place:
//!
//! | method | path | purpose |
//! |---|---|---|
//! | POST | `/api/storage/upload?name=` | insert a file, respond with its ref |
//! | GET  | `/api/storage/{nameOrRef}` | serve file bytes |
//! | POST | `/api/client/run` | run an offloading job (JSON or protobuf) |
//! | GET  | `/api/client/ws` | per-task client socket |
//! | GET  | `/api/provider/ws` | long-lived provider session |
//! | GET  | `/healthz` | liveness |
//! | GET  | `/metrics` | Prometheus render |

mod client;
mod provider_ws;
mod storage;

use crate::provider::{AsyncTask, ProviderRegistry};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;

/// Shared state of all HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ProviderRegistry>,
    /// the dispatcher's task queue
    pub queue: mpsc::Sender<AsyncTask>,
    /// allowed Origin headers for provider sockets; `*` allows any
    pub allowed_origins: Arc<Vec<String>>,
    /// installed Prometheus recorder, if metrics are enabled
    pub metrics: Option<PrometheusHandle>,
}

/// Build the broker router. Mount additional routes (static files) around
/// it in the daemon.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/storage/upload", post(storage::upload))
        .route("/api/storage/:name_or_ref", get(storage::download))
        .route("/api/client/run", post(client::run_job))
        .route("/api/client/ws", get(client::client_socket))
        .route("/api/provider/ws", get(provider_ws::provider_socket))
        .route("/healthz", get(healthz))
        .route("/metrics", get(render_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "{\"status\":\"ok\"}"
}

async fn render_metrics(State(state): State<AppState>) -> Result<String, StatusCode> {
    state
        .metrics
        .as_ref()
        .map(|handle| handle.render())
        .ok_or(StatusCode::NOT_FOUND)
}

/// The peer address as seen through a trusted reverse proxy, falling back
/// to the socket address.
pub(crate) fn proxied_addr(headers: &HeaderMap, fallback: SocketAddr) -> String {
    for key in ["x-real-ip", "x-forwarded-for"] {
        if let Some(value) = headers
            .get(key)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(',').next().unwrap_or_default().trim())
            .filter(|v| !v.is_empty())
        {
            // enclose in brackets if it's ipv6 with colons
            let host = if value.contains(':') {
                format!("[{value}]")
            } else {
                value.to_string()
            };
            return format!("{host}:{}", fallback.port());
        }
    }
    fallback.to_string()
}

/// Origin check for socket upgrades.
pub(crate) fn origin_allowed(allowed: &[String], headers: &HeaderMap) -> bool {
    if allowed.iter().any(|o| o == "*") {
        return true;
    }
    match headers.get("origin").and_then(|v| v.to_str().ok()) {
        // non-browser clients send no Origin header
        None => true,
        Some(origin) => allowed.iter().any(|o| o == origin),
    }
}
