use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::RelayError;
use crate::gateway::{InboundWebhook, IngestionGateway};
use crate::metrics::MetricsSink;
use crate::queue::RelayQueue;
use crate::types::LogEntryId;

const DEFAULT_DLQ_PAGE: usize = 100;

impl RelayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            RelayError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            RelayError::AuthenticationFailed(_) => StatusCode::UNAUTHORIZED,
            RelayError::DeadLetterNotFound(_) => StatusCode::NOT_FOUND,
            RelayError::ForwardFailed(_) => StatusCode::BAD_GATEWAY,
            RelayError::InfrastructureUnavailable(_)
            | RelayError::MaxRetriesExceeded { .. }
            | RelayError::InvalidConfig(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let (message, details) = match &self {
            RelayError::InfrastructureUnavailable(err) => {
                tracing::error!(error = %err, "request failed on log access");
                ("durable log unavailable".to_string(), Some(err.to_string()))
            }
            other => (other.to_string(), None),
        };
        let body = ErrorBody {
            code: self.code(),
            message,
            details,
        };
        (status, Json(json!({ "error": body }))).into_response()
    }
}

#[derive(Clone)]
pub struct ServerState {
    pub gateway: Arc<IngestionGateway>,
}

#[derive(Clone)]
pub struct ClientState {
    pub queue: RelayQueue,
    pub metrics: Arc<dyn MetricsSink>,
}

/// Public surface of the relay server.
pub fn server_router(state: ServerState) -> Router {
    Router::new()
        .route("/webhook", any(receive_webhook))
        .route("/webhook/:platform", any(receive_platform_webhook))
        .route("/health", get(server_health))
        .route("/api/metrics", get(server_metrics))
        .with_state(state)
}

/// Operator surface of the relay client.
pub fn client_router(state: ClientState) -> Router {
    Router::new()
        .route("/health", get(client_health))
        .route("/api/metrics", get(client_metrics))
        .route("/api/dlq", get(list_dead_letters))
        .route("/api/dlq/:id", post(replay_dead_letter).delete(delete_dead_letter))
        .with_state(state)
}

fn inbound(method: Method, platform: Option<String>, headers: &HeaderMap, body: Bytes) -> InboundWebhook {
    InboundWebhook {
        method: method.as_str().to_string(),
        platform,
        headers: headers
            .iter()
            .map(|(name, value)| {
                let value = match value.to_str() {
                    Ok(value) => value.to_string(),
                    Err(_) => {
                        tracing::debug!(header = %name, "header value is not visible ASCII, captured lossily");
                        String::from_utf8_lossy(value.as_bytes()).into_owned()
                    }
                };
                (name.as_str().to_string(), value)
            })
            .collect(),
        body: body.to_vec(),
    }
}

async fn receive_webhook(
    State(state): State<ServerState>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    accept(&state, inbound(method, None, &headers, body)).await
}

async fn receive_platform_webhook(
    State(state): State<ServerState>,
    Path(platform): Path<String>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    accept(&state, inbound(method, Some(platform), &headers, body)).await
}

async fn accept(state: &ServerState, webhook: InboundWebhook) -> Response {
    match state.gateway.ingest(webhook).await {
        Ok(accepted) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "success": true,
                "message_id": accepted.message_id,
                "webhook_id": accepted.webhook_id,
                "platform": accepted.platform,
                "timestamp": accepted.timestamp,
            })),
        )
            .into_response(),
        Err(err) => {
            tracing::debug!(code = err.code(), error = %err, "webhook rejected");
            err.into_response()
        }
    }
}

async fn health(queue: &RelayQueue, metrics: &dyn MetricsSink) -> Response {
    let depth = queue.queue_depth().await;
    let pending = queue.pending().await;
    match (depth, pending) {
        (Ok(queue_depth), Ok(pending)) => (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "timestamp": Utc::now(),
                "queue_depth": queue_depth,
                "pending": pending,
                "metrics": metrics.snapshot(),
            })),
        )
            .into_response(),
        (Err(err), _) | (_, Err(err)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "unhealthy",
                "timestamp": Utc::now(),
                "error": err.to_string(),
            })),
        )
            .into_response(),
    }
}

async fn server_health(State(state): State<ServerState>) -> Response {
    health(state.gateway.queue(), state.gateway.metrics().as_ref()).await
}

async fn server_metrics(State(state): State<ServerState>) -> impl IntoResponse {
    Json(state.gateway.metrics().snapshot())
}

async fn client_health(State(state): State<ClientState>) -> Response {
    health(&state.queue, state.metrics.as_ref()).await
}

async fn client_metrics(State(state): State<ClientState>) -> Response {
    let dead_letters = match state.queue.dead_letter_depth().await {
        Ok(depth) => depth,
        Err(err) => return err.into_response(),
    };
    Json(json!({
        "metrics": state.metrics.snapshot(),
        "dead_letters": dead_letters,
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
struct DlqQuery {
    limit: Option<usize>,
}

async fn list_dead_letters(State(state): State<ClientState>, Query(query): Query<DlqQuery>) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_DLQ_PAGE);
    match state.queue.dead_letters(limit).await {
        Ok(entries) => Json(json!({ "count": entries.len(), "entries": entries })).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn replay_dead_letter(State(state): State<ClientState>, Path(id): Path<String>) -> Response {
    let dlq_id = LogEntryId(id);
    match state.queue.replay_dead_letter(&dlq_id).await {
        Ok(message_id) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "success": true,
                "dlq_id": dlq_id,
                "message_id": message_id,
            })),
        )
            .into_response(),
        Err(err) => err.into_response(),
    }
}

async fn delete_dead_letter(State(state): State<ClientState>, Path(id): Path<String>) -> Response {
    match state.queue.delete_dead_letter(&LogEntryId(id)).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => err.into_response(),
    }
}
