//! Health and metrics endpoints.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use volumetry_core::ReconcilerHealth;

use crate::state::AppState;

/// Component-level health with a degraded/unhealthy rollup. Persistence
/// down is unhealthy (503); a struggling reconciler only degrades.
pub async fn health(State(state): State<AppState>) -> Response {
    let persistence_ok = state.store.ping().await.is_ok();
    let oracle_ok = state.oracle.ping().await.is_ok();
    let reconciler = state.reconciler.health();
    let scheduler = state.scheduler.status();

    let status = if !persistence_ok {
        "unhealthy"
    } else if !oracle_ok || reconciler == ReconcilerHealth::Degraded {
        "degraded"
    } else {
        "healthy"
    };
    let http_status = if status == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    let body = Json(json!({
        "status": status,
        "started_at": state.started_at,
        "components": {
            "persistence": if persistence_ok { "up" } else { "down" },
            "host_oracle": if oracle_ok { "up" } else { "down" },
            "reconciler": reconciler,
            "scheduler": if scheduler.running { "running" } else { "stopped" },
        },
    }));
    (http_status, body).into_response()
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}
