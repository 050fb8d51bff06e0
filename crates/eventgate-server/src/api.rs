//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/v1/events?name=<relation>` | Ingest newline-delimited JSON events |
//! | `GET` | `/v1/healthz` | Liveness probe |
//! | `POST` | `/v1/sql` | Execute one SQL statement |
//! | `GET` | `/v1/metrics` | Ingest metrics snapshot |
//!
//! Every response carries an `x-request-id` header; 500-class failures
//! are logged with it.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Query, Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::warn;

use eventgate_core::{query, EventDispatcher, IngestError, IngestMetrics, InsertError};

/// Maximum accepted request body.
const MAX_BODY_BYTES: usize = 50 * 1024 * 1024;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Ingestion dispatcher.
    pub dispatcher: Arc<EventDispatcher>,
    /// Shared pool for ad-hoc SQL.
    pub pool: deadpool_postgres::Pool,
    /// Ingest metrics.
    pub metrics: Arc<IngestMetrics>,
}

/// Builds the service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/events", post(ingest_event))
        .route("/v1/healthz", get(healthz))
        .route("/v1/sql", post(execute_sql))
        .route("/v1/metrics", get(metrics_snapshot))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(middleware::from_fn(request_id))
        .with_state(state)
}

/// Error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(ErrorResponse { error: msg.into() })).into_response()
}

/// Tags every response with a generated `x-request-id`.
async fn request_id(request: Request, next: Next) -> Response {
    let id = uuid::Uuid::new_v4().to_string();
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

#[derive(Debug, Deserialize)]
struct IngestParams {
    /// Destination relation, optionally schema-qualified.
    name: String,
}

/// `POST /v1/events?name=<relation>` — ingest one request's events.
async fn ingest_event(
    State(state): State<AppState>,
    Query(params): Query<IngestParams>,
    body: Bytes,
) -> Response {
    match state.dispatcher.ingest_event(&params.name, &body).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => {
            let status = status_for(&err);
            if status.is_server_error() {
                warn!(relation = %params.name, error = %err, "event ingestion failed");
            }
            error_response(status, err.to_string())
        }
    }
}

/// Maps ingest errors onto the response contract: client mistakes are
/// 4xx, retryable operator states are 503, flush failures are 500.
fn status_for(err: &IngestError) -> StatusCode {
    match err {
        IngestError::UnknownRelation(_) => StatusCode::NOT_FOUND,
        IngestError::Parse(_) => StatusCode::BAD_REQUEST,
        IngestError::Insert(InsertError::TooLarge { .. }) => StatusCode::PAYLOAD_TOO_LARGE,
        IngestError::Insert(InsertError::Backpressure | InsertError::Closed) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        IngestError::Insert(InsertError::Flush(_)) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// `GET /v1/healthz` — liveness.
async fn healthz() -> StatusCode {
    StatusCode::OK
}

/// `POST /v1/sql` — execute one statement and return the result set.
async fn execute_sql(State(state): State<AppState>, body: String) -> Response {
    match query::run_query(&state.pool, &body).await {
        Ok(output) => Json(output).into_response(),
        Err(err) => error_response(StatusCode::BAD_REQUEST, err.to_string()),
    }
}

/// `GET /v1/metrics` — ingest metrics snapshot.
async fn metrics_snapshot(State(state): State<AppState>) -> Response {
    Json(state.metrics.snapshot()).into_response()
}
