//! Periodic + on-demand scan scheduling: a bounded queue, a fixed worker
//! pool, a jittered ticker, admission filtering, and batch rate limiting.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use regex::Regex;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use volumetry_config::Settings;
use volumetry_model::{
    ScanOptions, ScanRun, Volume, VolumeError, VolumeResult,
};

use crate::engine::ScanEngine;
use crate::metrics::Metrics;
use crate::store::VolumeStore;

/// Upper bound on the random offset of the first periodic tick.
const TICK_JITTER_MAX: Duration = Duration::from_secs(30);
/// Minimum spacing between two batch enqueues.
const ENQUEUE_ALL_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub concurrency: usize,
    pub queue_capacity: usize,
    pub skip_pattern: Option<Regex>,
    pub bind_mounts_enabled: bool,
    pub bind_allow_list: Vec<String>,
    pub scan_timeout: Duration,
}

impl SchedulerConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        let concurrency = settings.scan.concurrency.max(1);
        Self {
            enabled: settings.scan.enabled,
            interval: settings.scan_interval(),
            concurrency,
            queue_capacity: concurrency * 10,
            skip_pattern: settings.skip_regex(),
            bind_mounts_enabled: settings.scan.bind_mounts_enabled,
            bind_allow_list: settings.scan.bind_allow_list.clone(),
            scan_timeout: settings.scan_timeout(),
        }
    }
}

/// Unit of work carried by the queue.
#[derive(Debug, Clone)]
pub struct ScanTask {
    pub scan_id: Uuid,
    pub volume_name: String,
    pub method: Option<String>,
    /// Represented but equal across the default path; the queue stays FIFO.
    pub priority: u8,
    pub timeout: Duration,
    pub max_retries: u32,
}

/// Result of one batch enqueue.
#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub batch_id: Uuid,
    pub enqueued: usize,
    pub skipped: usize,
    /// Tasks dropped because the queue filled mid-batch.
    pub dropped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub enabled: bool,
    pub running: bool,
    pub workers: usize,
    pub active_workers: usize,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub completed: u64,
    pub failed: u64,
    pub canceled: u64,
    pub last_tick: Option<DateTime<Utc>>,
    pub next_tick: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct SchedulerStats {
    active_workers: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    canceled: AtomicU64,
    last_tick: StdMutex<Option<DateTime<Utc>>>,
    next_tick: StdMutex<Option<DateTime<Utc>>>,
}

pub struct Scheduler {
    engine: Arc<ScanEngine>,
    store: Arc<dyn VolumeStore>,
    metrics: Arc<Metrics>,
    config: SchedulerConfig,
    tx: mpsc::Sender<ScanTask>,
    rx: StdMutex<Option<mpsc::Receiver<ScanTask>>>,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
    last_enqueue_all: StdMutex<Option<Instant>>,
    stats: Arc<SchedulerStats>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .finish()
    }
}

impl Scheduler {
    pub fn new(
        engine: Arc<ScanEngine>,
        store: Arc<dyn VolumeStore>,
        metrics: Arc<Metrics>,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        metrics.worker_pool_size.set(config.concurrency as i64);
        Arc::new(Self {
            engine,
            store,
            metrics,
            config,
            tx,
            rx: StdMutex::new(Some(rx)),
            shutdown: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
            last_enqueue_all: StdMutex::new(None),
            stats: Arc::new(SchedulerStats::default()),
        })
    }

    /// Spawn the worker pool and, when enabled, the periodic ticker.
    pub async fn start(self: &Arc<Self>) {
        if !self.config.enabled {
            info!("scheduler disabled by configuration");
            return;
        }
        let receiver = match self.rx.lock().ok().and_then(|mut slot| slot.take()) {
            Some(receiver) => Arc::new(Mutex::new(receiver)),
            None => {
                warn!("scheduler already started");
                return;
            }
        };

        let mut handles = self.handles.lock().await;
        for worker_id in 0..self.config.concurrency {
            let scheduler = Arc::clone(self);
            let receiver = Arc::clone(&receiver);
            handles.push(tokio::spawn(async move {
                scheduler.worker_loop(worker_id, receiver).await;
            }));
        }

        let scheduler = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            scheduler.ticker_loop().await;
        }));
        info!(
            workers = self.config.concurrency,
            interval_secs = self.config.interval.as_secs(),
            "scheduler started"
        );
    }

    /// Stop accepting work, cancel the ticker, and wait for in-flight
    /// workers up to `deadline`. In-flight scans observe cancellation and
    /// record `canceled`.
    pub async fn stop(&self, deadline: Duration) {
        self.shutdown.cancel();
        let mut handles = self.handles.lock().await;
        let drained: Vec<JoinHandle<()>> = handles.drain(..).collect();
        let shutdown = async {
            for handle in &drained {
                // polling completed handles is fine; abort below covers the rest
                while !handle.is_finished() {
                    tokio::time::sleep(Duration::from_millis(25)).await;
                }
            }
        };
        if tokio::time::timeout(deadline, shutdown).await.is_err() {
            warn!("scheduler stop deadline exceeded, aborting workers");
            for handle in &drained {
                handle.abort();
            }
        }
        info!("scheduler stopped");
    }

    fn queue_depth(&self) -> usize {
        self.config.queue_capacity.saturating_sub(self.tx.capacity())
    }

    fn record_queue_depth(&self) {
        self.metrics.queue_depth.set(self.queue_depth() as i64);
    }

    /// Admission filter shared by every batch path.
    fn admit(&self, volume: &Volume) -> bool {
        if let Some(skip) = &self.config.skip_pattern {
            if skip.is_match(&volume.name) {
                debug!(volume = %volume.name, "skipping volume by pattern");
                return false;
            }
        }
        if volume.is_bind_mount() {
            if !self.config.bind_mounts_enabled {
                debug!(volume = %volume.name, "skipping bind mount, feature disabled");
                return false;
            }
            let allowed = self
                .config
                .bind_allow_list
                .iter()
                .any(|prefix| volume.name.starts_with(prefix.as_str()));
            if !allowed {
                debug!(volume = %volume.name, "skipping bind mount outside allow list");
                return false;
            }
        }
        true
    }

    /// Queue one volume. Returns the scan id of the pending run, which may
    /// be a pre-existing one: a volume never has more than one live run.
    pub async fn enqueue_volume(&self, volume_name: &str) -> VolumeResult<Uuid> {
        if !self.config.enabled {
            return Err(VolumeError::Internal(
                "scheduler is disabled".to_string(),
            ));
        }
        if let Some(run) = self.store.latest_scan_run(volume_name).await? {
            if !run.status.is_terminal() {
                return Ok(run.scan_id);
            }
        }

        let permit = match self.tx.try_reserve() {
            Ok(permit) => permit,
            Err(mpsc::error::TrySendError::Full(())) => return Err(VolumeError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(())) => {
                return Err(VolumeError::Internal("scheduler stopped".to_string()))
            }
        };

        let method = self.engine.default_method_name();
        let run = ScanRun::queued(volume_name, method);
        self.store.insert_scan_run(&run).await?;
        permit.send(ScanTask {
            scan_id: run.scan_id,
            volume_name: volume_name.to_string(),
            method: None,
            priority: 0,
            timeout: self.config.scan_timeout,
            max_retries: 0,
        });
        self.record_queue_depth();
        Ok(run.scan_id)
    }

    /// Queue every admissible volume. Manual calls are limited to one batch
    /// per minute; the ticker handles the limit by skipping the tick.
    pub async fn enqueue_all(&self) -> VolumeResult<BatchResult> {
        self.enqueue_batch(false).await
    }

    async fn enqueue_batch(&self, from_ticker: bool) -> VolumeResult<BatchResult> {
        if !self.config.enabled {
            return Err(VolumeError::Internal(
                "scheduler is disabled".to_string(),
            ));
        }
        {
            let mut last = self
                .last_enqueue_all
                .lock()
                .map_err(|_| VolumeError::Internal("scheduler state poisoned".to_string()))?;
            if let Some(at) = *last {
                let elapsed = at.elapsed();
                if elapsed < ENQUEUE_ALL_WINDOW {
                    let retry_after = ENQUEUE_ALL_WINDOW - elapsed;
                    if from_ticker {
                        debug!(
                            retry_after_secs = retry_after.as_secs(),
                            "tick suppressed by the batch rate limit"
                        );
                        return Ok(BatchResult {
                            batch_id: Uuid::new_v4(),
                            enqueued: 0,
                            skipped: 0,
                            dropped: 0,
                        });
                    }
                    return Err(VolumeError::RateLimited {
                        retry_after_secs: retry_after.as_secs().max(1),
                    });
                }
            }
            *last = Some(Instant::now());
        }

        let volumes = self.store.list_active_volumes().await?;
        let pending: std::collections::HashSet<String> = self
            .store
            .list_active_scan_runs()
            .await?
            .into_iter()
            .map(|run| run.volume_name)
            .collect();

        let batch_id = Uuid::new_v4();
        let mut result = BatchResult {
            batch_id,
            enqueued: 0,
            skipped: 0,
            dropped: 0,
        };
        let default_method = self.engine.default_method_name();

        let mut queue_full = false;
        for volume in &volumes {
            if queue_full {
                result.dropped += 1;
                continue;
            }
            if !self.admit(volume) || pending.contains(&volume.name) {
                result.skipped += 1;
                continue;
            }
            let permit = match self.tx.try_reserve() {
                Ok(permit) => permit,
                Err(_) => {
                    // never block a batch on a saturated queue
                    warn!(
                        batch_id = %batch_id,
                        volume = %volume.name,
                        "queue full, dropping the rest of the batch"
                    );
                    queue_full = true;
                    result.dropped += 1;
                    continue;
                }
            };
            let run = ScanRun::queued(&volume.name, default_method);
            if let Err(err) = self.store.insert_scan_run(&run).await {
                warn!(volume = %volume.name, error = %err, "failed to insert queued run");
                result.skipped += 1;
                continue;
            }
            permit.send(ScanTask {
                scan_id: run.scan_id,
                volume_name: volume.name.clone(),
                method: None,
                priority: 0,
                timeout: self.config.scan_timeout,
                max_retries: 0,
            });
            result.enqueued += 1;
        }

        self.record_queue_depth();
        info!(
            batch_id = %batch_id,
            enqueued = result.enqueued,
            skipped = result.skipped,
            dropped = result.dropped,
            "batch enqueue finished"
        );
        Ok(result)
    }

    async fn ticker_loop(self: Arc<Self>) {
        let jitter = {
            let mut rng = rand::rng();
            Duration::from_millis(rng.random_range(0..TICK_JITTER_MAX.as_millis() as u64))
        };
        debug!(jitter_ms = jitter.as_millis() as u64, "ticker first-tick jitter");
        tokio::select! {
            _ = self.shutdown.cancelled() => return,
            _ = tokio::time::sleep(jitter) => {}
        }

        loop {
            self.run_tick().await;
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }
    }

    async fn run_tick(&self) {
        let now = Utc::now();
        let interval =
            chrono::Duration::from_std(self.config.interval).unwrap_or_else(|_| chrono::Duration::zero());
        if let Ok(mut last) = self.stats.last_tick.lock() {
            *last = Some(now);
        }
        if let Ok(mut next) = self.stats.next_tick.lock() {
            *next = Some(now + interval);
        }
        self.metrics.last_tick_timestamp.set(now.timestamp());
        self.metrics
            .next_tick_timestamp
            .set((now + interval).timestamp());

        if let Err(err) = self.enqueue_batch(true).await {
            warn!(error = %err, "periodic enqueue failed");
        }
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize, rx: Arc<Mutex<mpsc::Receiver<ScanTask>>>) {
        debug!(worker_id, "scan worker started");
        loop {
            let task = {
                let mut rx = rx.lock().await;
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    task = rx.recv() => match task {
                        Some(task) => task,
                        None => break,
                    },
                }
            };
            self.record_queue_depth();

            let run = match self.store.get_scan_run(task.scan_id).await {
                Ok(Some(run)) if !run.status.is_terminal() => run,
                Ok(_) => continue,
                Err(err) => {
                    warn!(error = %err, "worker could not load its run");
                    continue;
                }
            };

            self.stats.active_workers.fetch_add(1, Ordering::Relaxed);
            self.metrics.active_workers.inc();

            let options = ScanOptions {
                force_refresh: false,
                method: task.method.clone(),
            };
            let outcome = self
                .engine
                .run_queued(run, &options, self.shutdown.child_token())
                .await;
            match outcome {
                Ok(_) => {
                    self.stats.completed.fetch_add(1, Ordering::Relaxed);
                }
                Err(VolumeError::ScanCanceled(_)) => {
                    self.stats.canceled.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    debug!(worker_id, volume = %task.volume_name, error = %err, "scan task failed");
                }
            }

            self.stats.active_workers.fetch_sub(1, Ordering::Relaxed);
            self.metrics.active_workers.dec();
        }
        debug!(worker_id, "scan worker stopped");
    }

    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            enabled: self.config.enabled,
            running: self.config.enabled && !self.shutdown.is_cancelled(),
            workers: self.config.concurrency,
            active_workers: self.stats.active_workers.load(Ordering::Relaxed),
            queue_depth: self.queue_depth(),
            queue_capacity: self.config.queue_capacity,
            completed: self.stats.completed.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            canceled: self.stats.canceled.load(Ordering::Relaxed),
            last_tick: self.stats.last_tick.lock().ok().and_then(|v| *v),
            next_tick: self.stats.next_tick.lock().ok().and_then(|v| *v),
        }
    }
}
