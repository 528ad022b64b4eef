//! Embedded in-memory backend. Used by tests and by the `memory:` DSN for
//! single-process deployments that do not need durable history.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use regex::Regex;
use tokio::sync::RwLock;
use uuid::Uuid;

use volumetry_model::{
    Container, Mount, Page, ScanRun, ScanStatus, SizeSample, SortField, TrendPoint, Volume,
    VolumeAttachment, VolumeError, VolumeFilters, VolumeResult, VolumeSort, VolumeSummary,
};

use super::VolumeStore;

#[derive(Debug, Default)]
struct State {
    volumes: HashMap<String, Volume>,
    containers: HashMap<String, Container>,
    mounts: Vec<Mount>,
    scan_runs: HashMap<Uuid, ScanRun>,
    samples: Vec<SizeSample>,
}

#[derive(Debug)]
pub struct MemoryStore {
    state: RwLock<State>,
    system_regex: Option<Regex>,
}

impl MemoryStore {
    pub fn new(system_regex: Option<Regex>) -> Self {
        Self {
            state: RwLock::new(State::default()),
            system_regex,
        }
    }

    fn summarize(&self, state: &State, volume: &Volume) -> VolumeSummary {
        let attachments_count = state
            .mounts
            .iter()
            .filter(|m| m.is_active && m.volume_name == volume.name)
            .count() as i64;
        let size_bytes = state
            .samples
            .iter()
            .filter(|s| s.volume_name == volume.name)
            .max_by_key(|s| s.ts)
            .map(|s| s.size_bytes);
        VolumeSummary {
            name: volume.name.clone(),
            driver: volume.driver.clone(),
            created_at: volume.created_at,
            mountpoint: volume.mountpoint.clone(),
            labels: volume.labels.clone(),
            size_bytes,
            attachments_count,
            is_system: volume.is_system(self.system_regex.as_ref()),
            is_orphaned: attachments_count == 0,
            last_scanned_at: volume.last_scanned_at,
        }
    }
}

fn matches_filters(volume: &Volume, filters: &VolumeFilters) -> bool {
    if let Some(driver) = &filters.driver {
        if &volume.driver != driver {
            return false;
        }
    }
    if let Some(query) = &filters.query {
        if !volume
            .name
            .to_lowercase()
            .contains(&query.to_lowercase())
        {
            return false;
        }
    }
    if let Some(after) = filters.created_after {
        if volume.created_at < after {
            return false;
        }
    }
    if let Some(before) = filters.created_before {
        if volume.created_at > before {
            return false;
        }
    }
    true
}

fn sort_summaries(rows: &mut [VolumeSummary], sort: VolumeSort) {
    rows.sort_by(|a, b| {
        let ordering = match sort.field {
            SortField::Name => a.name.cmp(&b.name),
            SortField::Driver => a.driver.cmp(&b.driver).then_with(|| a.name.cmp(&b.name)),
            SortField::CreatedAt => a
                .created_at
                .cmp(&b.created_at)
                .then_with(|| a.name.cmp(&b.name)),
            // unsized volumes sort below every measured one
            SortField::SizeBytes => a
                .size_bytes
                .unwrap_or(-1)
                .cmp(&b.size_bytes.unwrap_or(-1))
                .then_with(|| a.name.cmp(&b.name)),
        };
        if sort.descending {
            ordering.reverse()
        } else {
            ordering
        }
    });
}

#[async_trait]
impl VolumeStore for MemoryStore {
    async fn ping(&self) -> VolumeResult<()> {
        Ok(())
    }

    async fn upsert_volume(&self, volume: &Volume) -> VolumeResult<()> {
        let mut state = self.state.write().await;
        if let Some(existing) = state.volumes.get_mut(&volume.name) {
            let last_scanned_at = existing.last_scanned_at.or(volume.last_scanned_at);
            let created_at = existing.created_at;
            *existing = volume.clone();
            existing.last_scanned_at = last_scanned_at;
            existing.created_at = created_at;
            existing.updated_at = Utc::now();
            return Ok(());
        }
        state.volumes.insert(volume.name.clone(), volume.clone());
        Ok(())
    }

    async fn deactivate_volume(&self, name: &str) -> VolumeResult<()> {
        let mut state = self.state.write().await;
        if let Some(volume) = state.volumes.get_mut(name) {
            volume.is_active = false;
            volume.updated_at = Utc::now();
        }
        for mount in state.mounts.iter_mut() {
            if mount.volume_name == name {
                mount.is_active = false;
            }
        }
        Ok(())
    }

    async fn get_volume_by_name(&self, name: &str) -> VolumeResult<Option<Volume>> {
        Ok(self.state.read().await.volumes.get(name).cloned())
    }

    async fn list_volumes(
        &self,
        filters: &VolumeFilters,
        sort: VolumeSort,
        page: Page,
    ) -> VolumeResult<(Vec<VolumeSummary>, i64)> {
        let state = self.state.read().await;
        let mut rows: Vec<VolumeSummary> = state
            .volumes
            .values()
            .filter(|v| v.is_active && matches_filters(v, filters))
            .map(|v| self.summarize(&state, v))
            .filter(|s| filters.orphaned.is_none_or(|want| s.is_orphaned == want))
            .filter(|s| filters.system.is_none_or(|want| s.is_system == want))
            .collect();

        sort_summaries(&mut rows, sort);
        let total = rows.len() as i64;
        let rows = rows
            .into_iter()
            .skip(page.offset.max(0) as usize)
            .take(page.limit.max(0) as usize)
            .collect();
        Ok((rows, total))
    }

    async fn list_active_volumes(&self) -> VolumeResult<Vec<Volume>> {
        let state = self.state.read().await;
        let mut volumes: Vec<Volume> = state
            .volumes
            .values()
            .filter(|v| v.is_active)
            .cloned()
            .collect();
        volumes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(volumes)
    }

    async fn upsert_container(&self, container: &Container) -> VolumeResult<()> {
        self.state
            .write()
            .await
            .containers
            .insert(container.id.clone(), container.clone());
        Ok(())
    }

    async fn deactivate_container(&self, id: &str) -> VolumeResult<()> {
        let mut state = self.state.write().await;
        if let Some(container) = state.containers.get_mut(id) {
            container.is_active = false;
        }
        Ok(())
    }

    async fn get_container(&self, id: &str) -> VolumeResult<Option<Container>> {
        Ok(self.state.read().await.containers.get(id).cloned())
    }

    async fn list_active_containers(&self) -> VolumeResult<Vec<Container>> {
        let state = self.state.read().await;
        let mut containers: Vec<Container> = state
            .containers
            .values()
            .filter(|c| c.is_active)
            .cloned()
            .collect();
        containers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(containers)
    }

    async fn upsert_mount(&self, mount: &Mount) -> VolumeResult<()> {
        let mut state = self.state.write().await;
        if let Some(existing) = state.mounts.iter_mut().find(|m| {
            m.volume_name == mount.volume_name
                && m.container_id == mount.container_id
                && m.mount_path == mount.mount_path
        }) {
            *existing = mount.clone();
            return Ok(());
        }
        state.mounts.push(mount.clone());
        Ok(())
    }

    async fn deactivate_mount(
        &self,
        volume_name: &str,
        container_id: &str,
        mount_path: &str,
    ) -> VolumeResult<()> {
        let mut state = self.state.write().await;
        for mount in state.mounts.iter_mut() {
            if mount.volume_name == volume_name
                && mount.container_id == container_id
                && mount.mount_path == mount_path
            {
                mount.is_active = false;
            }
        }
        Ok(())
    }

    async fn deactivate_mounts_by_container(&self, container_id: &str) -> VolumeResult<()> {
        let mut state = self.state.write().await;
        for mount in state.mounts.iter_mut() {
            if mount.container_id == container_id {
                mount.is_active = false;
            }
        }
        Ok(())
    }

    async fn deactivate_mounts_by_volume(&self, volume_name: &str) -> VolumeResult<()> {
        let mut state = self.state.write().await;
        for mount in state.mounts.iter_mut() {
            if mount.volume_name == volume_name {
                mount.is_active = false;
            }
        }
        Ok(())
    }

    async fn list_active_mounts(&self) -> VolumeResult<Vec<Mount>> {
        Ok(self
            .state
            .read()
            .await
            .mounts
            .iter()
            .filter(|m| m.is_active)
            .cloned()
            .collect())
    }

    async fn get_attachments(&self, volume_name: &str) -> VolumeResult<Vec<VolumeAttachment>> {
        let state = self.state.read().await;
        Ok(state
            .mounts
            .iter()
            .filter(|m| m.is_active && m.volume_name == volume_name)
            .map(|m| VolumeAttachment {
                container_id: m.container_id.clone(),
                container_name: state
                    .containers
                    .get(&m.container_id)
                    .map(|c| c.name.clone())
                    .unwrap_or_else(|| m.container_id.clone()),
                mount_path: m.mount_path.clone(),
                rw: matches!(m.access_mode, volumetry_model::AccessMode::Rw),
            })
            .collect())
    }

    async fn insert_scan_run(&self, run: &ScanRun) -> VolumeResult<()> {
        self.state
            .write()
            .await
            .scan_runs
            .insert(run.scan_id, run.clone());
        Ok(())
    }

    async fn update_scan_run(&self, run: &ScanRun) -> VolumeResult<()> {
        let mut state = self.state.write().await;
        match state.scan_runs.get_mut(&run.scan_id) {
            Some(existing) => {
                // terminal states never transition
                if existing.status.is_terminal() && existing.status != run.status {
                    return Ok(());
                }
                *existing = run.clone();
                Ok(())
            }
            None => Err(VolumeError::ScanNotFound(run.scan_id.to_string())),
        }
    }

    async fn get_scan_run(&self, scan_id: Uuid) -> VolumeResult<Option<ScanRun>> {
        Ok(self.state.read().await.scan_runs.get(&scan_id).cloned())
    }

    async fn latest_scan_run(&self, volume_name: &str) -> VolumeResult<Option<ScanRun>> {
        let state = self.state.read().await;
        Ok(state
            .scan_runs
            .values()
            .filter(|r| r.volume_name == volume_name)
            .max_by_key(|r| r.created_at)
            .cloned())
    }

    async fn list_active_scan_runs(&self) -> VolumeResult<Vec<ScanRun>> {
        let state = self.state.read().await;
        let mut runs: Vec<ScanRun> = state
            .scan_runs
            .values()
            .filter(|r| !r.status.is_terminal())
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.created_at);
        Ok(runs)
    }

    async fn cancel_stale_scan_runs(&self) -> VolumeResult<u64> {
        let mut state = self.state.write().await;
        let now = Utc::now();
        let mut canceled = 0;
        for run in state.scan_runs.values_mut() {
            if !run.status.is_terminal() {
                run.status = ScanStatus::Canceled;
                run.completed_at = Some(now);
                run.error = Some("interrupted by restart".to_string());
                canceled += 1;
            }
        }
        Ok(canceled)
    }

    async fn insert_size_sample(&self, sample: &SizeSample) -> VolumeResult<()> {
        self.state.write().await.samples.push(sample.clone());
        Ok(())
    }

    async fn latest_size_sample(&self, volume_name: &str) -> VolumeResult<Option<SizeSample>> {
        let state = self.state.read().await;
        Ok(state
            .samples
            .iter()
            .filter(|s| s.volume_name == volume_name)
            .max_by_key(|s| s.ts)
            .cloned())
    }

    async fn get_size_samples(
        &self,
        volume_name: &str,
        since: Option<DateTime<Utc>>,
        limit: i64,
    ) -> VolumeResult<Vec<SizeSample>> {
        let state = self.state.read().await;
        let mut samples: Vec<SizeSample> = state
            .samples
            .iter()
            .filter(|s| s.volume_name == volume_name)
            .filter(|s| since.is_none_or(|cutoff| s.ts >= cutoff))
            .cloned()
            .collect();
        samples.sort_by_key(|s| std::cmp::Reverse(s.ts));
        samples.truncate(limit.max(0) as usize);
        Ok(samples)
    }

    async fn aggregate_trend(
        &self,
        volumes: &[String],
        days: i64,
    ) -> VolumeResult<Vec<TrendPoint>> {
        let cutoff = Utc::now() - ChronoDuration::days(days.max(1));
        let state = self.state.read().await;
        let mut by_day: HashMap<chrono::NaiveDate, (i64, i64)> = HashMap::new();
        for sample in state
            .samples
            .iter()
            .filter(|s| s.ts >= cutoff)
            .filter(|s| volumes.is_empty() || volumes.contains(&s.volume_name))
        {
            let entry = by_day.entry(sample.ts.date_naive()).or_insert((0, 0));
            entry.0 += sample.size_bytes;
            entry.1 += 1;
        }
        let mut points: Vec<TrendPoint> = by_day
            .into_iter()
            .map(|(date, (total_bytes, sample_count))| TrendPoint {
                date,
                total_bytes,
                sample_count,
            })
            .collect();
        points.sort_by_key(|p| p.date);
        Ok(points)
    }

    async fn finalize_scan_success(
        &self,
        run: &ScanRun,
        sample: &SizeSample,
    ) -> VolumeResult<()> {
        let mut state = self.state.write().await;
        if let Some(existing) = state.scan_runs.get(&run.scan_id) {
            if existing.status.is_terminal() {
                return Ok(());
            }
        }
        state.samples.push(sample.clone());
        state.scan_runs.insert(run.scan_id, run.clone());
        if let Some(volume) = state.volumes.get_mut(&run.volume_name) {
            volume.last_scanned_at = run.completed_at;
            volume.updated_at = Utc::now();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use volumetry_model::AccessMode;

    fn volume(name: &str) -> Volume {
        let now = Utc::now();
        Volume {
            name: name.to_string(),
            driver: "local".to_string(),
            mountpoint: format!("/var/lib/docker/volumes/{name}/_data"),
            labels: StdHashMap::new(),
            options: StdHashMap::new(),
            scope: "local".to_string(),
            status: None,
            is_active: true,
            last_scanned_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn mount(volume: &str, container: &str) -> Mount {
        Mount {
            volume_name: volume.to_string(),
            container_id: container.to_string(),
            mount_path: "/data".to_string(),
            access_mode: AccessMode::Rw,
            is_active: true,
        }
    }

    fn sample(volume: &str, size: i64) -> SizeSample {
        SizeSample {
            id: Uuid::new_v4(),
            volume_name: volume.to_string(),
            ts: Utc::now(),
            size_bytes: size,
            file_count: Some(1),
            dir_count: Some(1),
            largest_file: Some(size),
            method: "native".to_string(),
            duration_ms: 3,
        }
    }

    fn store() -> MemoryStore {
        MemoryStore::new(Some(Regex::new("^system_").unwrap()))
    }

    #[tokio::test]
    async fn deactivate_volume_cascades_to_mounts() {
        let store = store();
        store.upsert_volume(&volume("data")).await.unwrap();
        store.upsert_mount(&mount("data", "c1")).await.unwrap();

        store.deactivate_volume("data").await.unwrap();

        let vol = store.get_volume_by_name("data").await.unwrap().unwrap();
        assert!(!vol.is_active);
        assert!(store.list_active_mounts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn listing_classifies_orphaned_and_system() {
        let store = store();
        store.upsert_volume(&volume("data")).await.unwrap();
        store.upsert_volume(&volume("system_cache")).await.unwrap();
        store.upsert_mount(&mount("data", "c1")).await.unwrap();

        let (rows, total) = store
            .list_volumes(&VolumeFilters::default(), VolumeSort::default(), Page::default())
            .await
            .unwrap();
        assert_eq!(total, 2);
        let data = rows.iter().find(|r| r.name == "data").unwrap();
        assert!(!data.is_orphaned);
        assert!(!data.is_system);
        let system = rows.iter().find(|r| r.name == "system_cache").unwrap();
        assert!(system.is_orphaned);
        assert!(system.is_system);

        let (orphans, _) = store
            .list_volumes(
                &VolumeFilters {
                    orphaned: Some(true),
                    ..VolumeFilters::default()
                },
                VolumeSort::default(),
                Page::default(),
            )
            .await
            .unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].name, "system_cache");
    }

    #[tokio::test]
    async fn size_sort_uses_latest_sample() {
        let store = store();
        store.upsert_volume(&volume("small")).await.unwrap();
        store.upsert_volume(&volume("big")).await.unwrap();
        store.insert_size_sample(&sample("small", 10)).await.unwrap();
        store.insert_size_sample(&sample("big", 1_000)).await.unwrap();

        let (rows, _) = store
            .list_volumes(
                &VolumeFilters::default(),
                VolumeSort::parse("size_bytes:desc"),
                Page::default(),
            )
            .await
            .unwrap();
        assert_eq!(rows[0].name, "big");
        assert_eq!(rows[0].size_bytes, Some(1_000));
    }

    #[tokio::test]
    async fn terminal_scan_runs_do_not_transition() {
        let store = store();
        let mut run = ScanRun::queued("data", "native");
        store.insert_scan_run(&run).await.unwrap();

        run.status = ScanStatus::Canceled;
        run.completed_at = Some(Utc::now());
        store.update_scan_run(&run).await.unwrap();

        run.status = ScanStatus::Running;
        store.update_scan_run(&run).await.unwrap();

        let stored = store.get_scan_run(run.scan_id).await.unwrap().unwrap();
        assert_eq!(stored.status, ScanStatus::Canceled);
    }

    #[tokio::test]
    async fn finalize_writes_sample_run_and_volume_atomically() {
        let store = store();
        store.upsert_volume(&volume("data")).await.unwrap();
        let mut run = ScanRun::queued("data", "native");
        store.insert_scan_run(&run).await.unwrap();

        let sample = sample("data", 600);
        run.status = ScanStatus::Completed;
        run.progress = 100;
        run.completed_at = Some(sample.ts);
        run.result_ref = Some(sample.id);
        store.finalize_scan_success(&run, &sample).await.unwrap();

        let stored = store.get_scan_run(run.scan_id).await.unwrap().unwrap();
        assert_eq!(stored.status, ScanStatus::Completed);
        assert_eq!(stored.result_ref, Some(sample.id));

        let vol = store.get_volume_by_name("data").await.unwrap().unwrap();
        assert_eq!(vol.last_scanned_at, run.completed_at);

        let latest = store.latest_size_sample("data").await.unwrap().unwrap();
        assert_eq!(latest.size_bytes, 600);
    }

    #[tokio::test]
    async fn stale_runs_are_canceled_at_startup() {
        let store = store();
        let queued = ScanRun::queued("a", "native");
        let mut running = ScanRun::queued("b", "native");
        running.status = ScanStatus::Running;
        store.insert_scan_run(&queued).await.unwrap();
        store.insert_scan_run(&running).await.unwrap();

        let canceled = store.cancel_stale_scan_runs().await.unwrap();
        assert_eq!(canceled, 2);
        assert!(store.list_active_scan_runs().await.unwrap().is_empty());
        let run = store.get_scan_run(queued.scan_id).await.unwrap().unwrap();
        assert!(run.completed_at.is_some());
    }

    #[tokio::test]
    async fn upsert_volume_is_idempotent_and_preserves_scan_time() {
        let store = store();
        let mut v = volume("data");
        store.upsert_volume(&v).await.unwrap();

        let scanned_at = Utc::now();
        let mut run = ScanRun::queued("data", "native");
        run.status = ScanStatus::Completed;
        run.progress = 100;
        run.completed_at = Some(scanned_at);
        let s = sample("data", 600);
        run.result_ref = Some(s.id);
        store.finalize_scan_success(&run, &s).await.unwrap();

        // a reconciler upsert must not wipe last_scanned_at
        v.driver = "local".to_string();
        store.upsert_volume(&v).await.unwrap();
        let stored = store.get_volume_by_name("data").await.unwrap().unwrap();
        assert_eq!(stored.last_scanned_at, Some(scanned_at));
    }
}
