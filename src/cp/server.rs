use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path as AxumPath, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

use crate::error::ManagerError;
use crate::instance::ConnectionStatus;
use crate::manager::InstanceManager;

/// Request bodies are small JSON documents.
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Shared state: the process-wide instance manager.
#[derive(Clone)]
pub struct CpState {
    pub manager: Arc<InstanceManager>,
}

/// JSON 404 for unknown API paths. Keeps API errors as JSON, never HTML.
async fn handle_api_fallback() -> ApiResponse {
    err_json(StatusCode::NOT_FOUND, "Unknown API endpoint")
}

/// Build the axum router with the control-plane API and `/metrics`.
pub fn build_router(state: CpState) -> Router {
    let timeout = Duration::from_secs(state.manager.config().server.request_timeout_secs.max(1));

    let api_router = Router::new()
        .route("/health", get(handle_health))
        .route("/instances", get(handle_list_instances).post(handle_create_instance))
        .route("/instances/:id", get(handle_get_instance).delete(handle_delete_instance))
        .route("/instances/:id/connect", post(handle_connect))
        .route("/instances/:id/disconnect", post(handle_disconnect))
        .route("/instances/:id/messages", post(handle_send_message))
        .route("/instances/:id/backup", post(handle_backup))
        .route("/instances/:id/restore", post(handle_restore))
        .fallback(handle_api_fallback);

    Router::new()
        .route("/metrics", get(handle_metrics))
        .nest("/api", api_router)
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, timeout))
}

// ── Response helpers ─────────────────────────────────────────────

type ApiResponse = (StatusCode, Json<serde_json::Value>);

fn ok_json(value: serde_json::Value) -> ApiResponse {
    (StatusCode::OK, Json(value))
}

fn err_json(status: StatusCode, message: &str) -> ApiResponse {
    (status, Json(json!({ "success": false, "error": message })))
}

fn manager_err_to_response(e: ManagerError) -> ApiResponse {
    let status = match &e {
        ManagerError::NotFound(_) | ManagerError::NoBackupAvailable(_) => StatusCode::NOT_FOUND,
        ManagerError::AlreadyExists(_)
        | ManagerError::Conflict(_)
        | ManagerError::NoSessionData(_) => StatusCode::CONFLICT,
        ManagerError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        ManagerError::InCooldown { .. }
        | ManagerError::RateLimited { .. }
        | ManagerError::SilentPause { .. } => StatusCode::TOO_MANY_REQUESTS,
        ManagerError::NotReady => StatusCode::SERVICE_UNAVAILABLE,
        ManagerError::TransportError(_) | ManagerError::Storage(_) => StatusCode::BAD_GATEWAY,
        ManagerError::ChecksumMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        ManagerError::Internal(inner) => {
            tracing::error!("control-plane request failed: {inner:#}");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    let mut body = json!({
        "success": false,
        "error": e.to_string(),
        "code": e.code(),
    });
    if let Some(secs) = e.retry_after_secs() {
        body["retryAfter"] = json!(secs);
    }
    (status, Json(body))
}

// ── Request bodies ──────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateInstanceBody {
    id: Option<String>,
    name: String,
}

#[derive(Deserialize)]
struct SendMessageBody {
    to: String,
    content: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestoreBody {
    backup_id: Option<String>,
}

// ── Handlers ─────────────────────────────────────────────────────

async fn handle_health(State(state): State<CpState>) -> impl IntoResponse {
    let instances = state.manager.get_all_instances();
    let count = |s: ConnectionStatus| instances.iter().filter(|i| i.status == s).count();
    ok_json(json!({
        "status": "ok",
        "instances": {
            "total": instances.len(),
            "connected": count(ConnectionStatus::Connected),
            "connecting": count(ConnectionStatus::Connecting),
            "waitingQr": count(ConnectionStatus::WaitingQr),
            "disconnected": count(ConnectionStatus::Disconnected),
            "degraded": instances.iter().filter(|i| i.degraded).count(),
            "inCooldown": instances.iter().filter(|i| i.in_cooldown).count(),
        },
    }))
}

async fn handle_list_instances(State(state): State<CpState>) -> impl IntoResponse {
    ok_json(json!(state.manager.get_all_instances()))
}

async fn handle_create_instance(
    State(state): State<CpState>,
    Json(body): Json<CreateInstanceBody>,
) -> impl IntoResponse {
    match state.manager.create_instance(body.id, &body.name).await {
        Ok(summary) => (StatusCode::CREATED, Json(json!(summary))),
        Err(e) => manager_err_to_response(e),
    }
}

async fn handle_get_instance(
    State(state): State<CpState>,
    AxumPath(id): AxumPath<String>,
) -> impl IntoResponse {
    match state.manager.get_status(&id) {
        Ok(status) => ok_json(json!(status)),
        Err(e) => manager_err_to_response(e),
    }
}

async fn handle_delete_instance(
    State(state): State<CpState>,
    AxumPath(id): AxumPath<String>,
) -> impl IntoResponse {
    match state.manager.delete_instance(&id).await {
        Ok(()) => ok_json(json!({ "success": true, "status": "deleted", "id": id })),
        Err(e) => manager_err_to_response(e),
    }
}

async fn handle_connect(
    State(state): State<CpState>,
    AxumPath(id): AxumPath<String>,
) -> impl IntoResponse {
    match state.manager.connect_instance(&id).await {
        Ok(outcome) => ok_json(json!({ "success": true, "result": outcome, "id": id })),
        Err(e) => manager_err_to_response(e),
    }
}

async fn handle_disconnect(
    State(state): State<CpState>,
    AxumPath(id): AxumPath<String>,
) -> impl IntoResponse {
    match state.manager.disconnect_instance(&id).await {
        Ok(()) => ok_json(json!({ "success": true, "status": "disconnected", "id": id })),
        Err(e) => manager_err_to_response(e),
    }
}

async fn handle_send_message(
    State(state): State<CpState>,
    AxumPath(id): AxumPath<String>,
    Json(body): Json<SendMessageBody>,
) -> impl IntoResponse {
    match state.manager.send_message(&id, &body.to, &body.content).await {
        Ok(receipt) => ok_json(json!({
            "success": true,
            "messageId": receipt.message_id,
            "delayedMs": receipt.delayed_ms,
        })),
        Err(e) => manager_err_to_response(e),
    }
}

async fn handle_backup(
    State(state): State<CpState>,
    AxumPath(id): AxumPath<String>,
) -> impl IntoResponse {
    match state.manager.backup_instance(&id).await {
        Ok(receipt) => ok_json(json!({ "success": true, "backup": receipt })),
        Err(e) => manager_err_to_response(e),
    }
}

async fn handle_restore(
    State(state): State<CpState>,
    AxumPath(id): AxumPath<String>,
    body: Option<Json<RestoreBody>>,
) -> impl IntoResponse {
    let backup_id = body.and_then(|Json(b)| b.backup_id);
    match state
        .manager
        .restore_instance(&id, backup_id.as_deref())
        .await
    {
        Ok(receipt) => ok_json(json!({ "success": true, "restore": receipt })),
        Err(e) => manager_err_to_response(e),
    }
}

async fn handle_metrics(State(state): State<CpState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.manager.metrics().render(),
    )
}
