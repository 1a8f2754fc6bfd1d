//! HTTP surface: webhook ingress, observability, and the admin DLQ.

use crate::signature;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use mergex_core::ingress::Ingress;
use mergex_core::model::RepoKey;
use mergex_core::queue::QueueStore;
use mergex_core::Metrics;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};
use zeroize::Zeroizing;

#[derive(Clone)]
pub struct AppState {
    pub ingress: Arc<Ingress>,
    pub store: Arc<dyn QueueStore>,
    pub metrics: Arc<Metrics>,
    pub webhook_secret: Zeroizing<String>,
    pub admin_token: Option<Zeroizing<String>>,
    pub ready: Arc<AtomicBool>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/webhook", post(webhook))
        .route("/metrics", get(metrics))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/admin/dlq", get(dlq_list))
        .route("/admin/dlq/replay", post(dlq_replay))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Webhook ingress. The raw body is needed twice: once for the HMAC check
/// and once for JSON parsing, so the handler takes `Bytes` rather than a
/// typed extractor. Payload contents are never logged.
async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    state.metrics.webhook_requests_total.inc();

    let provided = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !signature::verify(state.webhook_secret.as_bytes(), &body, provided) {
        state.metrics.webhook_invalid_signatures_total.inc();
        warn!("webhook delivery rejected: bad signature");
        return StatusCode::UNAUTHORIZED;
    }

    let Some(event_type) = headers.get("x-github-event").and_then(|v| v.to_str().ok())
    else {
        return StatusCode::BAD_REQUEST;
    };
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(_) => return StatusCode::BAD_REQUEST,
    };

    // Enqueue failures still acknowledge the delivery: the platform will
    // redeliver on our behalf, and a 5xx would only make it hammer us.
    if let Err(e) = state.ingress.handle(event_type, &payload).await {
        error!("failed to enqueue {event_type} event: {e}");
    }
    StatusCode::ACCEPTED
}

async fn metrics(State(state): State<AppState>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
        .into_response()
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn readyz(State(state): State<AppState>) -> StatusCode {
    if state.ready.load(Ordering::Relaxed) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

#[derive(Debug, Deserialize)]
struct DlqQuery {
    installation_id: u64,
    owner: String,
    repo: String,
}

fn authorize_admin(state: &AppState, headers: &HeaderMap) -> Result<(), StatusCode> {
    let Some(expected) = &state.admin_token else {
        // Admin surface disabled entirely when no token is configured.
        return Err(StatusCode::NOT_FOUND);
    };
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if provided == Some(expected.as_str()) {
        Ok(())
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}

async fn dlq_list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<DlqQuery>,
) -> Response {
    if let Err(status) = authorize_admin(&state, &headers) {
        return status.into_response();
    }
    let repo = RepoKey::new(query.installation_id, query.owner, query.repo);
    match state.store.dlq_entries(&repo).await {
        Ok(entries) => Json(json!({ "repo": repo.to_string(), "entries": entries })).into_response(),
        Err(e) => {
            error!("failed to list DLQ for {repo}: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn dlq_replay(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(query): Json<DlqQuery>,
) -> Response {
    if let Err(status) = authorize_admin(&state, &headers) {
        return status.into_response();
    }
    let repo = RepoKey::new(query.installation_id, query.owner, query.repo);
    match state.store.replay_dlq(&repo).await {
        Ok(replayed) => Json(json!({ "repo": repo.to_string(), "replayed": replayed })).into_response(),
        Err(e) => {
            error!("failed to replay DLQ for {repo}: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
