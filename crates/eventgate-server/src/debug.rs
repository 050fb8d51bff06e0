//! Optional debug listener.
//!
//! A second HTTP listener, off by default, exposing the metrics snapshot
//! and a liveness probe for operators poking at a running instance.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tokio::sync::watch;
use tracing::info;

use eventgate_core::IngestMetrics;

/// Builds the debug router.
pub fn router(metrics: Arc<IngestMetrics>) -> Router {
    Router::new()
        .route("/debug/metrics", get(metrics_snapshot))
        .route("/debug/healthz", get(|| async { StatusCode::OK }))
        .with_state(metrics)
}

async fn metrics_snapshot(State(metrics): State<Arc<IngestMetrics>>) -> impl IntoResponse {
    Json(metrics.snapshot())
}

/// Serves the debug listener until shutdown is signalled.
///
/// # Errors
///
/// Returns the bind or serve error.
pub async fn serve(
    addr: String,
    metrics: Arc<IngestMetrics>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "debug server listening");
    axum::serve(listener, router(metrics))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
}
