//! Persistence seam. Two backends satisfy the same port: Postgres for real
//! deployments and an embedded in-memory store for tests and the `memory:`
//! DSN. Every compound state change is transactional inside the backend.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use uuid::Uuid;

use volumetry_model::{
    Container, Mount, Page, ScanRun, SizeSample, TrendPoint, Volume, VolumeAttachment,
    VolumeError, VolumeFilters, VolumeResult, VolumeSort, VolumeSummary,
};

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait VolumeStore: Send + Sync {
    /// Backend reachability, used by `/health` and startup.
    async fn ping(&self) -> VolumeResult<()>;

    // volumes
    async fn upsert_volume(&self, volume: &Volume) -> VolumeResult<()>;
    /// Marks the volume inactive and deactivates all of its mounts, in one
    /// transaction.
    async fn deactivate_volume(&self, name: &str) -> VolumeResult<()>;
    async fn get_volume_by_name(&self, name: &str) -> VolumeResult<Option<Volume>>;
    async fn list_volumes(
        &self,
        filters: &VolumeFilters,
        sort: VolumeSort,
        page: Page,
    ) -> VolumeResult<(Vec<VolumeSummary>, i64)>;
    async fn list_active_volumes(&self) -> VolumeResult<Vec<Volume>>;

    // containers
    async fn upsert_container(&self, container: &Container) -> VolumeResult<()>;
    async fn deactivate_container(&self, id: &str) -> VolumeResult<()>;
    async fn get_container(&self, id: &str) -> VolumeResult<Option<Container>>;
    async fn list_active_containers(&self) -> VolumeResult<Vec<Container>>;

    // mounts
    async fn upsert_mount(&self, mount: &Mount) -> VolumeResult<()>;
    async fn deactivate_mount(
        &self,
        volume_name: &str,
        container_id: &str,
        mount_path: &str,
    ) -> VolumeResult<()>;
    async fn deactivate_mounts_by_container(&self, container_id: &str) -> VolumeResult<()>;
    async fn deactivate_mounts_by_volume(&self, volume_name: &str) -> VolumeResult<()>;
    async fn list_active_mounts(&self) -> VolumeResult<Vec<Mount>>;
    /// Active mounts of a volume joined with their containers.
    async fn get_attachments(&self, volume_name: &str) -> VolumeResult<Vec<VolumeAttachment>>;

    // scan runs
    async fn insert_scan_run(&self, run: &ScanRun) -> VolumeResult<()>;
    async fn update_scan_run(&self, run: &ScanRun) -> VolumeResult<()>;
    async fn get_scan_run(&self, scan_id: Uuid) -> VolumeResult<Option<ScanRun>>;
    async fn latest_scan_run(&self, volume_name: &str) -> VolumeResult<Option<ScanRun>>;
    async fn list_active_scan_runs(&self) -> VolumeResult<Vec<ScanRun>>;
    /// Marks every non-terminal run as canceled; called once at startup so
    /// runs interrupted by a crash re-queue instead of wedging the
    /// one-run-per-volume invariant.
    async fn cancel_stale_scan_runs(&self) -> VolumeResult<u64>;

    // size samples
    async fn insert_size_sample(&self, sample: &SizeSample) -> VolumeResult<()>;
    async fn latest_size_sample(&self, volume_name: &str) -> VolumeResult<Option<SizeSample>>;
    async fn get_size_samples(
        &self,
        volume_name: &str,
        since: Option<DateTime<Utc>>,
        limit: i64,
    ) -> VolumeResult<Vec<SizeSample>>;
    async fn aggregate_trend(&self, volumes: &[String], days: i64)
        -> VolumeResult<Vec<TrendPoint>>;

    /// The scan-success compound change: insert the sample, complete the
    /// run, and bump the volume's `last_scanned_at`, atomically.
    async fn finalize_scan_success(&self, run: &ScanRun, sample: &SizeSample) -> VolumeResult<()>;
}

/// Select a backend from the configured DSN.
pub async fn connect(
    dsn: &str,
    max_conns: u32,
    timeout: Duration,
    system_regex: Option<Regex>,
) -> VolumeResult<Arc<dyn VolumeStore>> {
    if dsn == "memory:" || dsn.starts_with("memory:") {
        return Ok(Arc::new(MemoryStore::new(system_regex)));
    }
    if dsn.starts_with("postgres://") || dsn.starts_with("postgresql://") {
        let store = PgStore::connect(dsn, max_conns, timeout, system_regex).await?;
        return Ok(Arc::new(store));
    }
    Err(VolumeError::PersistenceUnavailable(format!(
        "unsupported persistence dsn: {dsn}"
    )))
}
