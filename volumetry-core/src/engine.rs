//! The scan engine: method selection, the global concurrency cap, per-scan
//! deadlines, transactional result persistence, and realtime emission.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use volumetry_config::Settings;
use volumetry_model::{
    BusMessage, MethodDescriptor, ScanOptions, ScanProgressUpdate, ScanRun, ScanStatus,
    SizeReport, SizeSample, Volume, VolumeError, VolumeResult,
};

use crate::bus::EventBus;
use crate::cache::{Fingerprint, Flight, ScanCache};
use crate::methods::{MethodProgress, ScanContext, Sizer};
use crate::metrics::Metrics;
use crate::oracle::VolumeOracle;
use crate::store::VolumeStore;

/// Floor between two progress frames for the same scan.
const PROGRESS_EMIT_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub timeout: Duration,
    pub max_concurrent: usize,
    pub preference: Vec<String>,
    pub bind_mounts_enabled: bool,
    pub bind_allow_list: Vec<String>,
}

impl EngineConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            timeout: settings.scan_timeout(),
            max_concurrent: settings.scan.max_concurrent_scans,
            preference: settings.scan.methods_order.clone(),
            bind_mounts_enabled: settings.scan.bind_mounts_enabled,
            bind_allow_list: settings.scan.bind_allow_list.clone(),
        }
    }
}

struct MethodSlot {
    sizer: Arc<dyn Sizer>,
    available: bool,
}

/// Result shape of [`ScanEngine::bulk`].
#[derive(Debug, Clone, Default)]
pub struct BulkOutcome {
    pub results: Vec<SizeReport>,
    pub failures: Vec<BulkFailure>,
}

#[derive(Debug, Clone)]
pub struct BulkFailure {
    pub volume_name: String,
    pub code: String,
    pub error: String,
}

pub struct ScanEngine {
    store: Arc<dyn VolumeStore>,
    oracle: Arc<dyn VolumeOracle>,
    cache: Arc<ScanCache>,
    bus: Arc<EventBus>,
    metrics: Arc<Metrics>,
    slots: Vec<MethodSlot>,
    config: EngineConfig,
    semaphore: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for ScanEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanEngine")
            .field("methods", &self.slots.len())
            .field("config", &self.config)
            .finish()
    }
}

impl ScanEngine {
    /// Probes every registered method once and fixes the available set for
    /// the process lifetime. Fails with `all_methods_failed` when the
    /// preference list filters down to nothing.
    pub async fn new(
        store: Arc<dyn VolumeStore>,
        oracle: Arc<dyn VolumeOracle>,
        cache: Arc<ScanCache>,
        bus: Arc<EventBus>,
        metrics: Arc<Metrics>,
        sizers: Vec<Arc<dyn Sizer>>,
        config: EngineConfig,
    ) -> VolumeResult<Arc<Self>> {
        let mut slots = Vec::with_capacity(sizers.len());
        for sizer in sizers {
            let available = sizer.available().await;
            info!(method = sizer.name(), available, "probed scan method");
            slots.push(MethodSlot { sizer, available });
        }

        let any_preferred_available = config.preference.iter().any(|name| {
            slots
                .iter()
                .any(|slot| slot.available && slot.sizer.name() == name)
        });
        if !any_preferred_available {
            return Err(VolumeError::AllMethodsFailed);
        }

        let semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Ok(Arc::new(Self {
            store,
            oracle,
            cache,
            bus,
            metrics,
            slots,
            semaphore,
            config,
            shutdown: CancellationToken::new(),
        }))
    }

    /// Token canceled on process shutdown; async scans inherit from it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Name of the method a default-options scan would use right now.
    pub fn default_method_name(&self) -> &'static str {
        self.select_method(&ScanOptions::default())
            .map(|sizer| sizer.name())
            .unwrap_or("fast")
    }

    pub fn methods_available(&self) -> Vec<MethodDescriptor> {
        self.slots
            .iter()
            .map(|slot| {
                let mut descriptor = slot.sizer.descriptor();
                descriptor.available = slot.available;
                descriptor
            })
            .collect()
    }

    /// The methods that determine this scan's history identity: the
    /// override alone, or the configured preference list.
    fn effective_methods(&self, options: &ScanOptions) -> Vec<String> {
        match &options.method {
            Some(method) => vec![method.clone()],
            None => self.config.preference.clone(),
        }
    }

    fn select_method(&self, options: &ScanOptions) -> VolumeResult<Arc<dyn Sizer>> {
        if let Some(requested) = &options.method {
            let slot = self
                .slots
                .iter()
                .find(|slot| slot.sizer.name() == requested.as_str())
                .ok_or_else(|| VolumeError::MethodUnavailable(requested.clone()))?;
            if !slot.available {
                return Err(VolumeError::MethodUnavailable(requested.clone()));
            }
            return Ok(Arc::clone(&slot.sizer));
        }

        for name in &self.config.preference {
            if let Some(slot) = self
                .slots
                .iter()
                .find(|slot| slot.available && slot.sizer.name() == name.as_str())
            {
                return Ok(Arc::clone(&slot.sizer));
            }
        }
        // unreachable after the startup check, but the type says otherwise
        Err(VolumeError::AllMethodsFailed)
    }

    async fn resolve_volume(&self, name: &str) -> VolumeResult<Volume> {
        if let Some(volume) = self.store.get_volume_by_name(name).await? {
            if volume.is_active {
                return Ok(volume);
            }
        }
        match self.oracle.get_volume(name).await {
            Ok(Some(observed)) => {
                let volume = observed.into_volume();
                self.store.upsert_volume(&volume).await?;
                Ok(volume)
            }
            Ok(None) => Err(VolumeError::VolumeNotFound(name.to_string())),
            Err(VolumeError::OracleUnavailable(_)) => {
                // host gone: fall back to the (inactive) persisted row if any
                match self.store.get_volume_by_name(name).await? {
                    Some(volume) => Ok(volume),
                    None => Err(VolumeError::VolumeNotFound(name.to_string())),
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Bind mounts are scanned only when the feature is on and the path is
    /// under an allow-listed prefix.
    fn check_bind_admission(&self, volume: &Volume) -> VolumeResult<()> {
        if !volume.is_bind_mount() {
            return Ok(());
        }
        if !self.config.bind_mounts_enabled {
            return Err(VolumeError::PermissionDenied(format!(
                "bind mount scanning disabled: {}",
                volume.name
            )));
        }
        let allowed = self
            .config
            .bind_allow_list
            .iter()
            .any(|prefix| volume.name.starts_with(prefix.as_str()));
        if allowed {
            Ok(())
        } else {
            Err(VolumeError::PermissionDenied(format!(
                "bind mount outside the allow list: {}",
                volume.name
            )))
        }
    }

    /// Synchronous scan. Serves fresh cache hits unless `force_refresh`.
    pub async fn scan(
        &self,
        volume_name: &str,
        options: &ScanOptions,
        cancel: CancellationToken,
    ) -> VolumeResult<SizeReport> {
        self.scan_with_run(None, volume_name, options, cancel).await
    }

    /// Scheduler entry point: drive a scan for an already-inserted queued
    /// run.
    pub async fn run_queued(
        &self,
        run: ScanRun,
        options: &ScanOptions,
        cancel: CancellationToken,
    ) -> VolumeResult<SizeReport> {
        let volume_name = run.volume_name.clone();
        self.scan_with_run(Some(run), &volume_name, options, cancel)
            .await
    }

    /// Fire-and-poll scan: inserts the queued run, spawns the work, and
    /// returns the scan id immediately.
    pub async fn scan_async(
        self: &Arc<Self>,
        volume_name: &str,
        options: &ScanOptions,
    ) -> VolumeResult<Uuid> {
        let sizer = self.select_method(options)?;
        let run = ScanRun::queued(volume_name, sizer.name());
        let scan_id = run.scan_id;
        self.store.insert_scan_run(&run).await?;

        let engine = Arc::clone(self);
        let options = options.clone();
        let cancel = self.shutdown.child_token();
        tokio::spawn(async move {
            let volume_name = run.volume_name.clone();
            if let Err(err) = engine
                .scan_with_run(Some(run), &volume_name, &options, cancel)
                .await
            {
                debug!(volume = %volume_name, error = %err, "async scan finished with error");
            }
        });
        Ok(scan_id)
    }

    pub async fn status(&self, scan_id: Uuid) -> VolumeResult<ScanRun> {
        self.store
            .get_scan_run(scan_id)
            .await?
            .ok_or_else(|| VolumeError::ScanNotFound(scan_id.to_string()))
    }

    /// Scan many volumes, bounded by the engine semaphore.
    pub async fn bulk(
        &self,
        volume_names: &[String],
        options: &ScanOptions,
        cancel: CancellationToken,
    ) -> BulkOutcome {
        let scans = volume_names.iter().map(|name| {
            let cancel = cancel.child_token();
            async move { (name.clone(), self.scan(name, options, cancel).await) }
        });
        let mut outcome = BulkOutcome::default();
        for (volume_name, result) in futures::future::join_all(scans).await {
            match result {
                Ok(report) => outcome.results.push(report),
                Err(err) => outcome.failures.push(BulkFailure {
                    volume_name,
                    code: err.code().to_string(),
                    error: err.to_string(),
                }),
            }
        }
        outcome
    }

    async fn scan_with_run(
        &self,
        run: Option<ScanRun>,
        volume_name: &str,
        options: &ScanOptions,
        cancel: CancellationToken,
    ) -> VolumeResult<SizeReport> {
        let prepared = async {
            let sizer = self.select_method(options)?;
            let volume = self.resolve_volume(volume_name).await?;
            self.check_bind_admission(&volume)?;
            Ok::<_, VolumeError>((sizer, volume))
        }
        .await;

        let (sizer, volume) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                if let Some(run) = run {
                    self.fail_run(run, &err).await;
                }
                return Err(err);
            }
        };

        let fingerprint = Fingerprint::compute(
            &volume.name,
            &volume.mountpoint,
            &self.effective_methods(options),
        );

        if !options.force_refresh {
            if let Some(report) = self.cache.get(fingerprint) {
                self.metrics.cache_hits_total.inc();
                if let Some(run) = run {
                    self.complete_run_cached(run, &report).await;
                }
                return Ok(report);
            }
        }
        self.metrics.cache_misses_total.inc();

        match self.cache.begin_flight(fingerprint, &volume.name) {
            Flight::Follower(mut rx) => {
                let outcome = match rx.recv().await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(VolumeError::ScanCanceled(volume.name.clone())),
                };
                match outcome {
                    Ok(report) => {
                        if let Some(run) = run {
                            self.complete_run_cached(run, &report).await;
                        }
                        Ok(report)
                    }
                    Err(err) => {
                        if let Some(run) = run {
                            self.fail_run(run, &err).await;
                        }
                        Err(err)
                    }
                }
            }
            Flight::Leader(guard) => {
                let mut run = match run {
                    Some(run) => run,
                    None => {
                        let run = ScanRun::queued(&volume.name, sizer.name());
                        self.store.insert_scan_run(&run).await?;
                        run
                    }
                };
                run.method = sizer.name().to_string();

                let result = self
                    .execute(&mut run, &volume, sizer, fingerprint, cancel)
                    .await;
                guard.complete(result.clone());
                result
            }
        }
    }

    /// The leader path: run the method under the semaphore and the
    /// deadline, persist, emit.
    async fn execute(
        &self,
        run: &mut ScanRun,
        volume: &Volume,
        sizer: Arc<dyn Sizer>,
        fingerprint: Fingerprint,
        cancel: CancellationToken,
    ) -> VolumeResult<SizeReport> {
        // queued until a semaphore slot frees up
        let permit = tokio::select! {
            permit = self.semaphore.acquire() => permit,
            _ = cancel.cancelled() => {
                let err = VolumeError::ScanCanceled(volume.name.clone());
                self.cancel_run(run).await;
                return Err(err);
            }
        };
        let _permit = permit.map_err(|_| VolumeError::ScanCanceled(volume.name.clone()))?;

        run.status = ScanStatus::Running;
        run.started_at = Some(Utc::now());
        self.store.update_scan_run(run).await?;
        self.metrics.active_scans.inc();

        self.bus
            .publish(&BusMessage::scan_progress(ScanProgressUpdate {
                scan_id: run.scan_id,
                volume_name: volume.name.clone(),
                progress: 0,
                current_path: None,
                current_size: None,
                files_processed: None,
            }));

        let (progress_tx, progress_rx) = mpsc::channel::<MethodProgress>(32);
        let pump = self.spawn_progress_pump(run.scan_id, volume.name.clone(), progress_rx);

        let scan_cancel = cancel.child_token();
        let ctx = ScanContext::new(scan_cancel.clone()).with_progress(progress_tx);
        let started = std::time::Instant::now();
        let path = std::path::Path::new(&volume.mountpoint);

        let outcome = match tokio::time::timeout(self.config.timeout, sizer.scan(path, &ctx)).await
        {
            Ok(result) => result,
            Err(_elapsed) => {
                // dropping the scan future tears the method down; the token
                // lets cooperating callees observe it too
                scan_cancel.cancel();
                Err(VolumeError::ScanTimeout {
                    volume: volume.name.clone(),
                    seconds: self.config.timeout.as_secs(),
                })
            }
        };
        pump.abort();
        self.metrics.active_scans.dec();
        let duration = started.elapsed();

        match outcome {
            Ok(output) => {
                let descriptor = sizer.descriptor();
                let report = SizeReport {
                    volume_name: volume.name.clone(),
                    total_size: output.total_bytes,
                    file_count: output.file_count,
                    directory_count: output.dir_count,
                    largest_file: output.largest_file,
                    method: sizer.name().to_string(),
                    basis: descriptor.basis,
                    scanned_at: Utc::now(),
                    duration_ms: duration.as_millis() as i64,
                    cached: false,
                };
                let sample = SizeSample::from_report(&report);

                run.status = ScanStatus::Completed;
                run.progress = 100;
                run.completed_at = Some(report.scanned_at);
                run.result_ref = Some(sample.id);

                if let Err(err) = self.finalize_with_retry(run, &sample).await {
                    // keep the measurement recoverable from logs
                    warn!(
                        volume = %volume.name,
                        size_bytes = report.total_size,
                        method = %report.method,
                        error = %err,
                        "scan result could not be persisted"
                    );
                    let err = VolumeError::ResultPersistFailed(err.to_string());
                    run.status = ScanStatus::Failed;
                    run.error = Some(err.code().to_string());
                    if let Err(update_err) = self.store.update_scan_run(run).await {
                        error!(error = %update_err, "failed to record degraded scan run");
                    }
                    self.emit_terminal_error(&volume.name, &err);
                    return Err(err);
                }

                self.cache.insert(fingerprint, report.clone());
                self.metrics
                    .scans_total
                    .with_label_values(&["completed"])
                    .inc();
                self.metrics
                    .scan_duration_seconds
                    .with_label_values(&[sizer.name()])
                    .observe(duration.as_secs_f64());
                self.bus
                    .publish(&BusMessage::scan_complete(&volume.name, report.clone()));
                info!(
                    volume = %volume.name,
                    method = sizer.name(),
                    size_bytes = report.total_size,
                    duration_ms = report.duration_ms,
                    "scan completed"
                );
                Ok(report)
            }
            Err(err) => {
                match &err {
                    VolumeError::ScanCanceled(_) => self.cancel_run(run).await,
                    _ => self.fail_run(run.clone(), &err).await,
                }
                self.metrics
                    .scans_total
                    .with_label_values(&[match err {
                        VolumeError::ScanCanceled(_) => "canceled",
                        _ => "failed",
                    }])
                    .inc();
                Err(err)
            }
        }
    }

    /// Forward method progress to the bus, at most one frame per interval,
    /// re-emitting the last sample as a heartbeat while the scan runs.
    fn spawn_progress_pump(
        &self,
        scan_id: Uuid,
        volume_name: String,
        mut rx: mpsc::Receiver<MethodProgress>,
    ) -> tokio::task::JoinHandle<()> {
        let bus = Arc::clone(&self.bus);
        tokio::spawn(async move {
            let mut latest: Option<MethodProgress> = None;
            let mut ticker = tokio::time::interval(PROGRESS_EMIT_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick fires immediately; skip it so frames start
            // a full interval after scan start
            ticker.tick().await;
            loop {
                tokio::select! {
                    sample = rx.recv() => match sample {
                        Some(sample) => latest = Some(sample),
                        None => break,
                    },
                    _ = ticker.tick() => {
                        if let Some(sample) = &latest {
                            bus.publish(&BusMessage::scan_progress(ScanProgressUpdate {
                                scan_id,
                                volume_name: volume_name.clone(),
                                progress: 0,
                                current_path: sample.current_path.clone(),
                                current_size: Some(sample.bytes_so_far),
                                files_processed: Some(sample.files_processed),
                            }));
                        }
                    }
                }
            }
        })
    }

    async fn finalize_with_retry(
        &self,
        run: &ScanRun,
        sample: &SizeSample,
    ) -> VolumeResult<()> {
        match self.store.finalize_scan_success(run, sample).await {
            Ok(()) => Ok(()),
            Err(first) => {
                warn!(error = %first, "scan finalize failed, retrying once");
                self.store.finalize_scan_success(run, sample).await
            }
        }
    }

    /// Completes a pre-created run from a shared or cached result.
    async fn complete_run_cached(&self, mut run: ScanRun, report: &SizeReport) {
        run.status = ScanStatus::Completed;
        run.progress = 100;
        run.completed_at = Some(report.scanned_at);
        run.result_ref = match self.store.latest_size_sample(&run.volume_name).await {
            Ok(Some(sample)) => Some(sample.id),
            _ => None,
        };
        if run.result_ref.is_none() {
            // cache outlived the history row; re-persist so the completed
            // run keeps a resolvable result reference
            let sample = SizeSample::from_report(report);
            run.result_ref = Some(sample.id);
            if let Err(err) = self.store.finalize_scan_success(&run, &sample).await {
                warn!(error = %err, "failed to backfill sample for cached result");
            }
            return;
        }
        if let Err(err) = self.store.update_scan_run(&run).await {
            warn!(error = %err, "failed to complete cached scan run");
        }
        self.metrics
            .scans_total
            .with_label_values(&["completed"])
            .inc();
    }

    async fn fail_run(&self, mut run: ScanRun, err: &VolumeError) {
        run.status = ScanStatus::Failed;
        run.completed_at = Some(Utc::now());
        run.error = Some(format!("{}: {err}", err.code()));
        if let Err(update_err) = self.store.update_scan_run(&run).await {
            warn!(error = %update_err, "failed to record scan failure");
        }
        self.metrics
            .scan_errors_total
            .with_label_values(&[err.code()])
            .inc();
        self.emit_terminal_error(&run.volume_name, err);
    }

    async fn cancel_run(&self, run: &mut ScanRun) {
        run.status = ScanStatus::Canceled;
        run.completed_at = Some(Utc::now());
        if let Err(err) = self.store.update_scan_run(run).await {
            warn!(error = %err, "failed to record scan cancellation");
        }
        self.emit_terminal_error(
            &run.volume_name,
            &VolumeError::ScanCanceled(run.volume_name.clone()),
        );
    }

    fn emit_terminal_error(&self, volume_name: &str, err: &VolumeError) {
        self.bus.publish(&BusMessage::scan_error(
            volume_name,
            err.code(),
            err.to_string(),
        ));
    }
}
