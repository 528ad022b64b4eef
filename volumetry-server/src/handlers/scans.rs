//! Scan-method, active-scan, and scheduler handlers.

use axum::{extract::State, Json};
use serde_json::json;

use crate::errors::ApiResult;
use crate::state::AppState;

pub async fn scan_methods(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "methods": state.engine.methods_available() }))
}

pub async fn active_scans(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let runs = state.store.list_active_scan_runs().await?;
    Ok(Json(json!({ "scans": runs })))
}

pub async fn scheduler_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "scheduler": state.scheduler.status() }))
}

/// Manual batch enqueue. Subject to the once-per-minute rate limit; the
/// 429 body carries retry_after via the error mapping.
pub async fn scan_all(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let batch = state.scheduler.enqueue_all().await?;
    Ok(Json(json!({ "batch": batch })))
}
