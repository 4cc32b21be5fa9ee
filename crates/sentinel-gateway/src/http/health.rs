//! Liveness, component status, and the metrics exposition endpoint.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::state::AppState;

/// `GET /`
pub async fn root() -> Json<serde_json::Value> {
    Json(json!({
        "service": "Sentinel Policy Gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "operational",
    }))
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let counter_store_connected = state.shared.ping().await;
    let audit_store_connected = state.audit.is_healthy();
    let policies_healthy = state.policies.is_healthy();

    let status = if counter_store_connected && audit_store_connected && policies_healthy {
        "healthy"
    } else {
        "degraded"
    };

    let pending = state.approvals.pending_count().unwrap_or(0);

    Json(json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "mode": state.mode.current().as_str(),
        "counter_store_connected": counter_store_connected,
        "audit_store_connected": audit_store_connected,
        "policy_store_healthy": policies_healthy,
        "active_policies": state.policies.snapshot().len(),
        "pending_approvals": pending,
        "audit_buffered": state.audit.buffered(),
        "audit_dropped": state.audit.dropped(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}

/// `GET /metrics`
pub async fn metrics(State(state): State<AppState>) -> Response {
    match sentinel_core::metrics::encode_text(&state.registry) {
        Ok(text) => (
            StatusCode::OK,
            [("Content-Type", "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(err) => {
            tracing::error!(error = %err, "metrics encoding failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
