use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::handlers::{reports, scans, system, volumes};
use crate::state::AppState;
use crate::ws::websocket_handler;

/// The stable REST + WebSocket surface.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/volumes", get(volumes::list_volumes))
        .route("/volumes/trends", get(volumes::size_trends))
        .route("/volumes/bulk-scan", post(volumes::bulk_scan))
        .route("/volumes/{name}", get(volumes::get_volume))
        .route("/volumes/{name}/attachments", get(volumes::get_attachments))
        .route("/volumes/{name}/size", get(volumes::get_size))
        .route("/volumes/{name}/size/history", get(volumes::size_history))
        .route("/volumes/{name}/size/refresh", post(volumes::refresh_size))
        .route("/volumes/{name}/scan/status", get(volumes::scan_status))
        .route("/scan-methods", get(scans::scan_methods))
        .route("/scans/active", get(scans::active_scans))
        .route("/scheduler/status", get(scans::scheduler_status))
        .route("/scheduler/scan-all", post(scans::scan_all))
        .route("/reports/orphaned", get(reports::orphaned_report))
        .route("/health", get(system::health))
        .route("/metrics", get(system::metrics))
        .route("/ws", get(websocket_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
