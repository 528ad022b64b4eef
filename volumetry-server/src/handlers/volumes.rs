//! Volume listing, detail, size, and scan handlers.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use volumetry_model::{
    Page, ScanOptions, SizeReport, SizeSample, VolumeError, VolumeFilters, VolumeSort,
};

use crate::errors::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub page: Option<i64>,
    pub page_size: Option<i64>,
    pub sort: Option<String>,
    pub q: Option<String>,
    pub driver: Option<String>,
    pub orphaned: Option<bool>,
    pub system: Option<bool>,
}

impl ListParams {
    pub fn filters(&self) -> VolumeFilters {
        VolumeFilters {
            driver: self.driver.clone(),
            query: self.q.clone(),
            orphaned: self.orphaned,
            system: self.system,
            created_after: None,
            created_before: None,
        }
    }

    pub fn sort(&self) -> VolumeSort {
        self.sort
            .as_deref()
            .map(VolumeSort::parse)
            .unwrap_or_default()
    }

    pub fn page(&self) -> Page {
        Page::from_params(self.page, self.page_size)
    }
}

pub async fn list_volumes(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<serde_json::Value>> {
    let page = params.page();
    let (volumes, total) = state
        .store
        .list_volumes(&params.filters(), params.sort(), page)
        .await?;
    Ok(Json(json!({
        "volumes": volumes,
        "total": total,
        "page": page.page_number(),
        "page_size": page.limit,
    })))
}

pub async fn get_volume(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let volume = state
        .store
        .get_volume_by_name(&name)
        .await?
        .filter(|v| v.is_active)
        .ok_or_else(|| ApiError::from(VolumeError::VolumeNotFound(name.clone())))?;
    let attachments = state.store.get_attachments(&name).await?;
    Ok(Json(json!({
        "volume": volume,
        "attachments": attachments,
    })))
}

pub async fn get_attachments(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    if state.store.get_volume_by_name(&name).await?.is_none() {
        return Err(VolumeError::VolumeNotFound(name).into());
    }
    let attachments = state.store.get_attachments(&name).await?;
    Ok(Json(json!({ "attachments": attachments })))
}

fn report_from_sample(sample: &SizeSample, basis: volumetry_model::SizeBasis) -> SizeReport {
    SizeReport {
        volume_name: sample.volume_name.clone(),
        total_size: sample.size_bytes,
        file_count: sample.file_count,
        directory_count: sample.dir_count,
        largest_file: sample.largest_file,
        method: sample.method.clone(),
        basis,
        scanned_at: sample.ts,
        duration_ms: sample.duration_ms,
        cached: true,
    }
}

/// Last known size, or a fresh measurement when no history exists yet.
pub async fn get_size(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<SizeReport>> {
    if let Some(sample) = state.store.latest_size_sample(&name).await? {
        let basis = state
            .engine
            .methods_available()
            .into_iter()
            .find(|m| m.name == sample.method)
            .map(|m| m.basis)
            .unwrap_or(volumetry_model::SizeBasis::Logical);
        return Ok(Json(report_from_sample(&sample, basis)));
    }
    let report = state
        .engine
        .scan(
            &name,
            &ScanOptions::default(),
            state.engine.shutdown_token().child_token(),
        )
        .await?;
    Ok(Json(report))
}

#[derive(Debug, Default, Deserialize)]
pub struct RefreshRequest {
    #[serde(default, rename = "async")]
    pub run_async: bool,
    #[serde(default)]
    pub method: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AsyncScanAccepted {
    pub scan_id: Uuid,
    pub status_url: String,
}

pub async fn refresh_size(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Option<Json<RefreshRequest>>,
) -> ApiResult<Response> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let options = ScanOptions {
        force_refresh: true,
        method: request.method,
    };

    if request.run_async {
        let scan_id = state.engine.scan_async(&name, &options).await?;
        let accepted = AsyncScanAccepted {
            scan_id,
            status_url: format!("/volumes/{name}/scan/status"),
        };
        return Ok((StatusCode::ACCEPTED, Json(accepted)).into_response());
    }

    let report = state
        .engine
        .scan(&name, &options, state.engine.shutdown_token().child_token())
        .await?;
    Ok(Json(report).into_response())
}

pub async fn scan_status(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let run = state
        .store
        .latest_scan_run(&name)
        .await?
        .ok_or_else(|| ApiError::from(VolumeError::ScanNotFound(name.clone())))?;
    Ok(Json(json!({ "scan": run })))
}

#[derive(Debug, Deserialize)]
pub struct BulkScanRequest {
    pub volume_names: Vec<String>,
    #[serde(default, rename = "async")]
    pub run_async: bool,
    #[serde(default)]
    pub method: Option<String>,
}

pub async fn bulk_scan(
    State(state): State<AppState>,
    Json(request): Json<BulkScanRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    if request.volume_names.is_empty() {
        return Err(ApiError::bad_request("volume_names must not be empty"));
    }
    let options = ScanOptions {
        force_refresh: true,
        method: request.method.clone(),
    };

    if request.run_async {
        let mut scans = Vec::new();
        let mut failed = Vec::new();
        for name in &request.volume_names {
            match state.engine.scan_async(name, &options).await {
                Ok(scan_id) => scans.push(json!({
                    "volume_name": name,
                    "scan_id": scan_id,
                    "status_url": format!("/volumes/{name}/scan/status"),
                })),
                Err(err) => failed.push(json!({
                    "volume_name": name,
                    "code": err.code(),
                    "error": err.to_string(),
                })),
            }
        }
        let totals = json!({
            "requested": request.volume_names.len(),
            "accepted": scans.len(),
            "failed": failed.len(),
        });
        return Ok(Json(json!({
            "scans": scans,
            "failed": failed,
            "totals": totals,
        })));
    }

    let outcome = state
        .engine
        .bulk(
            &request.volume_names,
            &options,
            state.engine.shutdown_token().child_token(),
        )
        .await;
    let failed: Vec<serde_json::Value> = outcome
        .failures
        .iter()
        .map(|f| {
            json!({
                "volume_name": f.volume_name,
                "code": f.code,
                "error": f.error,
            })
        })
        .collect();
    let totals = json!({
        "requested": request.volume_names.len(),
        "succeeded": outcome.results.len(),
        "failed": failed.len(),
    });
    Ok(Json(json!({
        "results": outcome.results,
        "failed": failed,
        "totals": totals,
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryParams {
    pub days: Option<i64>,
    pub limit: Option<i64>,
}

pub async fn size_history(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<HistoryParams>,
) -> ApiResult<Json<serde_json::Value>> {
    let days = params.days.filter(|d| *d > 0).unwrap_or(30);
    let limit = params.limit.filter(|l| *l > 0).unwrap_or(500).min(5_000);
    let since = chrono::Utc::now() - chrono::Duration::days(days);
    let samples = state
        .store
        .get_size_samples(&name, Some(since), limit)
        .await?;
    Ok(Json(json!({
        "volume_name": name,
        "days": days,
        "samples": samples,
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct TrendParams {
    pub days: Option<i64>,
    /// Comma-separated volume names; empty means all.
    pub volumes: Option<String>,
}

pub async fn size_trends(
    State(state): State<AppState>,
    Query(params): Query<TrendParams>,
) -> ApiResult<Json<serde_json::Value>> {
    let days = params.days.filter(|d| *d > 0).unwrap_or(30);
    let volumes: Vec<String> = params
        .volumes
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    let points = state.store.aggregate_trend(&volumes, days).await?;
    Ok(Json(json!({
        "days": days,
        "volumes": volumes,
        "points": points,
    })))
}
