//! Keeps the persisted inventory in step with the host: a streaming event
//! consumer plus a periodic diff-and-patch pass. All writes go through a
//! single writer lock so the two paths never interleave per entity.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use volumetry_config::Settings;
use volumetry_model::{
    AccessMode, BusMessage, HostEvent, HostEventKind, Mount, Page, VolumeFilters, VolumeResult,
    VolumeSort,
};

use crate::bus::EventBus;
use crate::cache::ScanCache;
use crate::metrics::Metrics;
use crate::oracle::VolumeOracle;
use crate::store::VolumeStore;

/// Reconnect backoff bounds for the event stream.
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(60);
/// `/health` degrades after this many consecutive full-pass failures.
const HEALTH_FAILURE_THRESHOLD: u32 = 3;

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub enabled: bool,
    pub interval: Duration,
}

impl ReconcilerConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            enabled: settings.events.enabled,
            interval: settings.reconcile_interval(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconcilerHealth {
    Healthy,
    Degraded,
    Disabled,
}

#[derive(Debug, Default)]
struct HealthState {
    consecutive_failures: u32,
}

pub struct Reconciler {
    oracle: Arc<dyn VolumeOracle>,
    store: Arc<dyn VolumeStore>,
    cache: Arc<ScanCache>,
    bus: Arc<EventBus>,
    metrics: Arc<Metrics>,
    config: ReconcilerConfig,
    /// Serializes stream applies against the periodic pass.
    writer: Mutex<()>,
    health: std::sync::Mutex<HealthState>,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("config", &self.config)
            .finish()
    }
}

impl Reconciler {
    pub fn new(
        oracle: Arc<dyn VolumeOracle>,
        store: Arc<dyn VolumeStore>,
        cache: Arc<ScanCache>,
        bus: Arc<EventBus>,
        metrics: Arc<Metrics>,
        config: ReconcilerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            oracle,
            store,
            cache,
            bus,
            metrics,
            config,
            writer: Mutex::new(()),
            health: std::sync::Mutex::new(HealthState::default()),
            shutdown: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        })
    }

    pub async fn start(self: &Arc<Self>) {
        if !self.config.enabled {
            info!("reconciler disabled by configuration");
            return;
        }
        let mut handles = self.handles.lock().await;

        let reconciler = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            reconciler.stream_loop().await;
        }));

        let reconciler = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            reconciler.periodic_loop().await;
        }));
        info!(
            interval_secs = self.config.interval.as_secs(),
            "reconciler started"
        );
    }

    pub async fn stop(&self) {
        self.shutdown.cancel();
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            handle.abort();
        }
        info!("reconciler stopped");
    }

    pub fn health(&self) -> ReconcilerHealth {
        if !self.config.enabled {
            return ReconcilerHealth::Disabled;
        }
        let state = match self.health.lock() {
            Ok(state) => state,
            Err(_) => return ReconcilerHealth::Degraded,
        };
        if state.consecutive_failures >= HEALTH_FAILURE_THRESHOLD {
            ReconcilerHealth::Degraded
        } else {
            ReconcilerHealth::Healthy
        }
    }

    fn record_outcome(&self, ok: bool) {
        if let Ok(mut state) = self.health.lock() {
            if ok {
                state.consecutive_failures = 0;
            } else {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            }
        }
        if !ok {
            self.metrics.reconcile_errors_total.inc();
        }
    }

    /// Consume the event stream forever: reconnect with capped exponential
    /// backoff, and run a full pass after every reconnect so events dropped
    /// during the gap are recovered.
    async fn stream_loop(self: Arc<Self>) {
        let mut backoff = BACKOFF_INITIAL;
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }
            let stream = self.oracle.stream_events(self.shutdown.child_token()).await;
            let mut stream = match stream {
                Ok(stream) => {
                    backoff = BACKOFF_INITIAL;
                    if let Err(err) = self.reconcile().await {
                        warn!(error = %err, "post-connect reconciliation failed");
                        self.record_outcome(false);
                    }
                    stream
                }
                Err(err) => {
                    warn!(error = %err, backoff_secs = backoff.as_secs(), "event stream connect failed");
                    self.record_outcome(false);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                    continue;
                }
            };

            loop {
                let event = tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    event = stream.next() => event,
                };
                match event {
                    Some(Ok(event)) => {
                        if let Err(err) = self.apply_event(&event).await {
                            warn!(kind = ?event.kind, error = %err, "failed to apply host event");
                            self.record_outcome(false);
                        }
                    }
                    Some(Err(err)) => {
                        warn!(error = %err, "event stream error, reconnecting");
                        break;
                    }
                    None => {
                        debug!("event stream closed, reconnecting");
                        break;
                    }
                }
            }
        }
    }

    async fn periodic_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
            match self.reconcile().await {
                Ok(changed) => {
                    self.record_outcome(true);
                    if changed > 0 {
                        self.publish_inventory().await;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "periodic reconciliation failed");
                    self.record_outcome(false);
                }
            }
        }
    }

    /// Apply one host event. Upsert semantics keyed by natural identifiers
    /// make every action safe to replay.
    pub async fn apply_event(&self, event: &HostEvent) -> VolumeResult<()> {
        let _writer = self.writer.lock().await;
        self.metrics
            .events_applied_total
            .with_label_values(&[kind_label(event.kind)])
            .inc();

        match event.kind {
            HostEventKind::VolumeCreate => {
                if let Some(observed) = self.oracle.get_volume(&event.actor_id).await? {
                    self.store.upsert_volume(&observed.into_volume()).await?;
                }
                self.publish_inventory().await;
            }
            HostEventKind::VolumeDestroy => {
                self.store.deactivate_volume(&event.actor_id).await?;
                self.cache.invalidate_volume(&event.actor_id);
                self.publish_inventory().await;
            }
            HostEventKind::VolumeMount => {
                if let Some(container_id) = event.attributes.get("container") {
                    let mount_path = event
                        .attributes
                        .get("destination")
                        .cloned()
                        .unwrap_or_default();
                    let access_mode = event
                        .attributes
                        .get("read/write")
                        .map(|rw| {
                            if rw == "false" {
                                AccessMode::Ro
                            } else {
                                AccessMode::Rw
                            }
                        })
                        .unwrap_or(AccessMode::Rw);
                    self.store
                        .upsert_mount(&Mount {
                            volume_name: event.actor_id.clone(),
                            container_id: container_id.clone(),
                            mount_path,
                            access_mode,
                            is_active: true,
                        })
                        .await?;
                }
            }
            HostEventKind::VolumeUnmount => {
                if let Some(container_id) = event.attributes.get("container") {
                    match event.attributes.get("destination") {
                        Some(path) => {
                            self.store
                                .deactivate_mount(&event.actor_id, container_id, path)
                                .await?;
                        }
                        None => {
                            // path unknown: the volume side is the safe key
                            self.store
                                .deactivate_mounts_by_volume(&event.actor_id)
                                .await?;
                        }
                    }
                }
                self.cache.invalidate_volume(&event.actor_id);
            }
            HostEventKind::ContainerCreate | HostEventKind::ContainerStart => {
                if let Some(observed) = self.oracle.get_container(&event.actor_id).await? {
                    let mounts = observed.mount_rows();
                    self.store.upsert_container(&observed.into_container()).await?;
                    for mount in mounts {
                        self.store.upsert_mount(&mount).await?;
                    }
                }
            }
            HostEventKind::ContainerDie | HostEventKind::ContainerStop => {
                if let Some(mut container) = self.store.get_container(&event.actor_id).await? {
                    container.state = "exited".to_string();
                    container.finished_at = Some(event.timestamp);
                    self.store.upsert_container(&container).await?;
                }
                self.store
                    .deactivate_mounts_by_container(&event.actor_id)
                    .await?;
            }
            HostEventKind::ContainerDestroy => {
                self.store.deactivate_container(&event.actor_id).await?;
                self.store
                    .deactivate_mounts_by_container(&event.actor_id)
                    .await?;
            }
        }
        Ok(())
    }

    /// Full diff-and-patch pass against the oracle's authoritative view.
    /// Returns the number of edits applied.
    pub async fn reconcile(&self) -> VolumeResult<u64> {
        let _writer = self.writer.lock().await;
        let timer = std::time::Instant::now();

        let observed_volumes = self.oracle.list_volumes().await?;
        let observed_containers = self.oracle.list_containers().await?;
        let mut edits: u64 = 0;

        let persisted_volumes: std::collections::HashMap<String, volumetry_model::Volume> = self
            .store
            .list_active_volumes()
            .await?
            .into_iter()
            .map(|v| (v.name.clone(), v))
            .collect();
        let persisted_containers: std::collections::HashMap<String, volumetry_model::Container> =
            self.store
                .list_active_containers()
                .await?
                .into_iter()
                .map(|c| (c.id.clone(), c))
                .collect();

        let observed_volume_names: HashSet<&str> =
            observed_volumes.iter().map(|v| v.name.as_str()).collect();
        let observed_container_ids: HashSet<&str> =
            observed_containers.iter().map(|c| c.id.as_str()).collect();

        for observed in &observed_volumes {
            let next = observed.clone().into_volume();
            let changed = match persisted_volumes.get(&next.name) {
                Some(current) => {
                    current.driver != next.driver
                        || current.mountpoint != next.mountpoint
                        || current.labels != next.labels
                        || current.options != next.options
                        || current.scope != next.scope
                        || !current.is_active
                }
                None => true,
            };
            if changed {
                self.store.upsert_volume(&next).await?;
                edits += 1;
            }
        }
        for name in persisted_volumes.keys() {
            if !observed_volume_names.contains(name.as_str()) {
                self.store.deactivate_volume(name).await?;
                self.cache.invalidate_volume(name);
                edits += 1;
            }
        }

        let mut observed_mounts: HashSet<(String, String, String)> = HashSet::new();
        for observed in &observed_containers {
            let next = observed.clone().into_container();
            let changed = match persisted_containers.get(&next.id) {
                Some(current) => {
                    current.name != next.name
                        || current.state != next.state
                        || current.status != next.status
                        || !current.is_active
                }
                None => true,
            };
            if changed {
                self.store.upsert_container(&next).await?;
                edits += 1;
            }
            for mount in observed.mount_rows() {
                observed_mounts.insert((
                    mount.volume_name.clone(),
                    mount.container_id.clone(),
                    mount.mount_path.clone(),
                ));
            }
        }
        for id in persisted_containers.keys() {
            if !observed_container_ids.contains(id.as_str()) {
                self.store.deactivate_container(id).await?;
                self.store.deactivate_mounts_by_container(id).await?;
                edits += 1;
            }
        }

        let persisted_mounts: HashSet<(String, String, String)> = self
            .store
            .list_active_mounts()
            .await?
            .into_iter()
            .map(|m| (m.volume_name, m.container_id, m.mount_path))
            .collect();
        for observed in &observed_containers {
            for mount in observed.mount_rows() {
                let key = (
                    mount.volume_name.clone(),
                    mount.container_id.clone(),
                    mount.mount_path.clone(),
                );
                if !persisted_mounts.contains(&key) {
                    self.store.upsert_mount(&mount).await?;
                    edits += 1;
                }
            }
        }
        for key in &persisted_mounts {
            if !observed_mounts.contains(key) {
                self.store.deactivate_mount(&key.0, &key.1, &key.2).await?;
                edits += 1;
            }
        }

        self.metrics.reconcile_runs_total.inc();
        self.metrics
            .reconcile_duration_seconds
            .observe(timer.elapsed().as_secs_f64());
        debug!(edits, "reconciliation pass finished");
        Ok(edits)
    }

    /// Push the current inventory to realtime subscribers.
    async fn publish_inventory(&self) {
        let page = Page {
            offset: 0,
            limit: volumetry_model::filter::MAX_PAGE_SIZE,
        };
        match self
            .store
            .list_volumes(&VolumeFilters::default(), VolumeSort::default(), page)
            .await
        {
            Ok((summaries, _)) => {
                self.bus.publish(&BusMessage::volume_update(summaries));
            }
            Err(err) => {
                warn!(error = %err, "failed to build volume_update payload");
            }
        }
    }
}

fn kind_label(kind: HostEventKind) -> &'static str {
    match kind {
        HostEventKind::VolumeCreate => "volume_create",
        HostEventKind::VolumeDestroy => "volume_destroy",
        HostEventKind::VolumeMount => "volume_mount",
        HostEventKind::VolumeUnmount => "volume_unmount",
        HostEventKind::ContainerCreate => "container_create",
        HostEventKind::ContainerStart => "container_start",
        HostEventKind::ContainerDie => "container_die",
        HostEventKind::ContainerStop => "container_stop",
        HostEventKind::ContainerDestroy => "container_destroy",
    }
}
