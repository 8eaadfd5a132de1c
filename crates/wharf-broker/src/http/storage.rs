//! Storage routes: upload and download

use super::AppState;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::{info, warn};
use wharf_core::StoreError;

/// Ref header on storage downloads.
const REF_HEADER: &str = "x-wharf-ref";

#[derive(Debug, Deserialize)]
pub(super) struct UploadQuery {
    /// friendly lookup-name for the uploaded file
    name: Option<String>,
}

/// `POST /api/storage/upload?name=<alias>` — insert the body into storage
/// and fan it out to all connected providers. Responds with the plain-text
/// content ref.
pub(super) async fn upload(
    State(state): State<AppState>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let name = query.name;
    let media = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let file = match state.registry.storage.insert(name.as_deref(), media, body) {
        Ok(file) => file,
        Err(e @ (StoreError::MediaParse(_) | StoreError::MediaUnexpected(_))) => {
            return (StatusCode::UNSUPPORTED_MEDIA_TYPE, e.to_string()).into_response();
        }
        Err(e) => {
            warn!("inserting file in storage failed: {e}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "inserting file in storage failed".to_string(),
            )
                .into_response();
        }
    };
    info!(file_ref = file.file_ref(), name = ?name, size = file.bytes.len(), "file uploaded");

    // push the file to all connected providers asynchronously
    let registry = state.registry.clone();
    let fanout = file.clone();
    tokio::spawn(async move {
        for provider in registry.values() {
            if let Err(e) = provider.upload(&fanout).await {
                warn!(addr = %provider.addr(), file_ref = fanout.file_ref(), "upload to provider failed: {e}");
            }
        }
    });

    (StatusCode::OK, format!("{}\n", file.file_ref())).into_response()
}

/// `GET /api/storage/{nameOrRef}` — serve file bytes with their media type
/// and canonical ref.
pub(super) async fn download(
    State(state): State<AppState>,
    Path(name_or_ref): Path<String>,
) -> Response {
    match state.registry.storage.get(&name_or_ref) {
        Some(file) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE.as_str(), file.media.clone()),
                (REF_HEADER, file.file_ref().to_string()),
            ],
            file.bytes.clone(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "file not found in storage").into_response(),
    }
}
