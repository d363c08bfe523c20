//! 只读状态 HTTP 服务。
//!
//! - GET /health
//! - GET /status

use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{HeaderValue, Request},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use domain::ConnectionStatus;
use ems_telemetry::{MetricsSnapshot, TelemetryMetrics, new_request_ids};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::Instrument;

#[derive(Clone)]
pub struct StatusState {
    pub metrics: Arc<TelemetryMetrics>,
    pub status: watch::Receiver<ConnectionStatus>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusBody {
    pub connection_status: &'static str,
    pub changed_at_ms: i64,
    pub last_connected_ms: Option<i64>,
    pub stats: MetricsSnapshot,
    pub decode_errors_by_topic: BTreeMap<String, u64>,
}

pub fn router(state: StatusState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .with_state(state)
        // 注入 request_id/trace_id
        .layer(middleware::from_fn(request_context))
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "ok": true }))
}

async fn status(State(state): State<StatusState>) -> Json<StatusBody> {
    let current = *state.status.borrow();
    Json(StatusBody {
        connection_status: current.state.as_str(),
        changed_at_ms: current.changed_at_ms,
        last_connected_ms: current.last_connected_ms,
        stats: state.metrics.snapshot(),
        decode_errors_by_topic: state.metrics.decode_errors_by_topic(),
    })
}

async fn request_context(mut req: Request<Body>, next: Next) -> Response {
    let ids = new_request_ids();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    req.extensions_mut().insert(ids.clone());

    let span = tracing::info_span!(
        target: "ems.status",
        "request",
        request_id = %ids.request_id,
        trace_id = %ids.trace_id,
        method = %method,
        path = %path
    );

    let mut response = next.run(req).instrument(span).await;
    response.headers_mut().insert(
        "x-request-id",
        HeaderValue::from_str(&ids.request_id).unwrap_or_else(|_| HeaderValue::from_static("")),
    );
    response.headers_mut().insert(
        "x-trace-id",
        HeaderValue::from_str(&ids.trace_id).unwrap_or_else(|_| HeaderValue::from_static("")),
    );
    response
}
