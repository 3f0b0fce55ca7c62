// ABOUTME: HTTP endpoint exposing Prometheus metrics and a liveness probe
// ABOUTME: Started by any daemon whose config sets metrics.port

use anyhow::{Context, Result};
use axum::{extract::State, response::IntoResponse, routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

pub fn router(handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(Arc::new(handle))
        .layer(TraceLayer::new_for_http())
}

async fn metrics_handler(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}

/// Serve `/metrics` and `/health` on `host:port` until `shutdown` fires.
pub async fn serve(
    host: &str,
    port: u16,
    handle: PrometheusHandle,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind metrics server on {}", addr))?;
    tracing::info!(addr = %addr, "Starting metrics server");

    axum::serve(listener, router(handle))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Metrics server failed")
}
