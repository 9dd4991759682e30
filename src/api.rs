//! HTTP surface: observer WebSocket upgrade, health, job lookup, and the
//! reset and manual-retry operations.

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::engine::{ResetKind, RetryController, StatusWriter};
use crate::error::{Error, Result};
use crate::gateway::Gateway;
use crate::gateway::socket::serve_socket;
use crate::model::TrackedJob;

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub writer: Arc<StatusWriter>,
    pub retry: Arc<RetryController>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/jobs/{id}", get(show_job))
        .route("/jobs/{id}/reset", post(reset_job))
        .route("/jobs/{id}/retry", post(retry_job))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct WsParams {
    observer: Option<String>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    // Without a scope each connection is its own observer.
    let observer = params
        .observer
        .filter(|o| !o.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    ws.on_upgrade(move |socket| serve_socket(socket, state.gateway, observer))
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    store: &'static str,
    connections: usize,
}

async fn health(State(state): State<AppState>) -> (StatusCode, Json<Health>) {
    let (code, status, store) = match state.writer.health_check().await {
        Ok(()) => (StatusCode::OK, "ok", "ok"),
        Err(e) => {
            tracing::warn!(error = %e, "store health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "degraded", "unavailable")
        }
    };
    (
        code,
        Json(Health {
            status,
            store,
            connections: state.gateway.connection_count(),
        }),
    )
}

async fn lookup(state: &AppState, id: &str) -> Result<TrackedJob> {
    state
        .writer
        .resolve(&[id.to_string()])
        .await?
        .ok_or_else(|| Error::NotFound(id.to_string()))
}

async fn show_job(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<TrackedJob>> {
    Ok(Json(lookup(&state, &id).await?))
}

async fn reset_job(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<TrackedJob>> {
    let job = lookup(&state, &id).await?;
    let job = state.writer.reset(&job.entity_id, ResetKind::Reset).await?;
    Ok(Json(job))
}

async fn retry_job(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<TrackedJob>> {
    let job = lookup(&state, &id).await?;
    let job = state.retry.retry_now(&job.entity_id).await?;
    Ok(Json(job))
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            Error::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            Error::InvalidTransition { .. } => (StatusCode::CONFLICT, "INVALID_TRANSITION"),
            Error::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            Error::Malformed(_) => (StatusCode::BAD_REQUEST, "MALFORMED"),
            Error::Remote(_) | Error::Http(_) => (StatusCode::BAD_GATEWAY, "REMOTE_UNAVAILABLE"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
        };
        if status.is_server_error() {
            tracing::error!(error = %self, code, "request failed");
        }
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
                code,
            }),
        )
            .into_response()
    }
}
