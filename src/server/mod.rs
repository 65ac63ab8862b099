//! HTTP surface: MJPEG stream, WebSocket push channel and a few JSON
//! endpoints, all on one listener.
//!
//! - `GET /` viewer page
//! - `GET /video_feed` MJPEG (`multipart/x-mixed-replace; boundary=frame`)
//! - `GET /frame.jpg` latest frame
//! - `GET /api/snapshot` latest snapshot
//! - `GET /api/status` pipeline and client counters
//! - `GET /metrics` Prometheus exposition
//! - `WS /ws` one snapshot per cycle

mod stream;
mod ws;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{Html, IntoResponse, Json, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::hub::Hub;
use crate::stats::PipelineStats;

const INDEX_HTML: &str = include_str!("index.html");

#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
    pub stats: Arc<PipelineStats>,
    pub metrics: Option<&'static PrometheusHandle>,
    pub started: Instant,
}

impl AppState {
    pub fn new(hub: Hub, stats: Arc<PipelineStats>) -> Self {
        Self {
            hub,
            stats,
            metrics: crate::telemetry::prometheus_handle(),
            started: Instant::now(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/video_feed", get(stream::video_feed))
        .route("/frame.jpg", get(latest_frame))
        .route("/api/snapshot", get(latest_snapshot))
        .route("/api/status", get(status))
        .route("/metrics", get(metrics_text))
        .route("/ws", get(ws::ws_upgrade))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))
}

/// Serves until the hub shuts down. Open streams end on a chunk boundary
/// and push sockets get a close frame before the listener stops.
pub async fn serve(listener: TcpListener, state: AppState) -> Result<()> {
    let addr = listener.local_addr().context("Listener has no local address")?;
    let shutdown = state.hub.shutdown_token();

    info!(%addr, "Web server listening on http://{addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Web server error")?;

    info!("Web server stopped");
    Ok(())
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

fn unavailable(what: &str) -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        format!("no {what} published yet"),
    )
        .into_response()
}

async fn latest_frame(State(state): State<AppState>) -> Response {
    match state.hub.latest_frame() {
        Some(packet) => (
            [
                (header::CONTENT_TYPE, "image/jpeg"),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            packet.jpeg.clone(),
        )
            .into_response(),
        None => unavailable("frame"),
    }
}

async fn latest_snapshot(State(state): State<AppState>) -> Response {
    match state.hub.latest_snapshot() {
        Some(published) => (
            [(header::CONTENT_TYPE, "application/json")],
            published.json.to_string(),
        )
            .into_response(),
        None => unavailable("snapshot"),
    }
}

async fn status(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "uptime_secs": state.started.elapsed().as_secs(),
        "pipeline": state.stats.snapshot(),
        "clients": state.hub.stats(),
        "latest_sequence": state.hub.latest_frame().map(|p| p.sequence),
    }))
}

async fn metrics_text(State(state): State<AppState>) -> Response {
    match state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}
