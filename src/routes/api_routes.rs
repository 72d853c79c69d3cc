use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use crate::errors::AppError;
use crate::models::{TranscribeRequest, TranscribeResponse, UploadResponse};
use crate::service::{ChatService, TranscriptionService};

/// GET `/api/chats`: saved and live chats, newest first
pub async fn list_chats_handler(State(svc): State<ChatService>) -> Response {
    match svc.list_chats().await {
        Ok(chats) => Json(chats).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET `/api/chats/{id}`: active-path projection of one chat
pub async fn chat_messages_handler(
    Path(id): Path<String>,
    State(svc): State<ChatService>,
) -> Response {
    match svc.projection(&id).await {
        Ok(messages) => Json(messages).into_response(),
        Err(e) => error_response(&e),
    }
}

/// POST `/api/upload_audio`: raw audio body, answers with the upload's filename
pub async fn upload_audio_handler(
    State(svc): State<TranscriptionService>,
    body: Bytes,
) -> Response {
    match svc.upload(body.to_vec()).await {
        Ok(filename) => Json(UploadResponse { filename }).into_response(),
        Err(e) => error_response(&e),
    }
}

/// POST `/api/transcribe`: transcribes a previous upload
pub async fn transcribe_handler(
    State(svc): State<TranscriptionService>,
    Json(request): Json<TranscribeRequest>,
) -> Response {
    match svc.transcribe(&request.filename).await {
        Ok(text) => Json(TranscribeResponse { text }).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET `/health`
pub async fn health_handler() -> &'static str {
    "ok"
}

// ── Helper ────────────────────────────────────────────────────────────────────

fn status_for(err: &AppError) -> StatusCode {
    if err.is_validation() {
        StatusCode::BAD_REQUEST
    } else if err.is_not_found() {
        StatusCode::NOT_FOUND
    } else if err.is_agent_unavailable() {
        StatusCode::SERVICE_UNAVAILABLE
    } else if err.is_upstream() {
        StatusCode::BAD_GATEWAY
    } else if matches!(err, AppError::OutOfRange { .. } | AppError::InvalidState { .. }) {
        StatusCode::CONFLICT
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

fn error_response(err: &AppError) -> Response {
    let status = status_for(err);
    if status.is_server_error() {
        error!("Request failed: {err}");
    }
    (status, Json(json!({ "kind": err.kind(), "message": err.to_string() }))).into_response()
}
