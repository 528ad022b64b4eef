//! Reporting endpoints over the persisted inventory.

use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::json;

use volumetry_model::{Page, VolumeFilters, VolumeSort};

use crate::errors::ApiResult;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct OrphanedParams {
    pub page: Option<i64>,
    pub page_size: Option<i64>,
    pub sort: Option<String>,
    /// Include system volumes; defaults to false.
    pub system: Option<bool>,
}

/// Volumes with zero active mounts, excluding system volumes unless asked.
pub async fn orphaned_report(
    State(state): State<AppState>,
    Query(params): Query<OrphanedParams>,
) -> ApiResult<Json<serde_json::Value>> {
    let include_system = params.system.unwrap_or(false);
    let filters = VolumeFilters {
        orphaned: Some(true),
        system: if include_system { None } else { Some(false) },
        ..VolumeFilters::default()
    };
    let sort = params
        .sort
        .as_deref()
        .map(VolumeSort::parse)
        .unwrap_or_default();
    let page = Page::from_params(params.page, params.page_size);

    let (volumes, total) = state.store.list_volumes(&filters, sort, page).await?;
    let reclaimable: i64 = volumes.iter().filter_map(|v| v.size_bytes).sum();
    Ok(Json(json!({
        "volumes": volumes,
        "total": total,
        "page": page.page_number(),
        "page_size": page.limit,
        "reclaimable_bytes": reclaimable,
    })))
}
