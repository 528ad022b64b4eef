//! Prometheus instrumentation shared by the engine, scheduler, and
//! reconciler.

use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};

use volumetry_model::{VolumeError, VolumeResult};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    pub scans_total: IntCounterVec,
    pub scan_duration_seconds: HistogramVec,
    pub scan_errors_total: IntCounterVec,
    pub active_scans: IntGauge,

    pub cache_hits_total: IntCounter,
    pub cache_misses_total: IntCounter,

    pub queue_depth: IntGauge,
    pub worker_pool_size: IntGauge,
    pub active_workers: IntGauge,
    pub last_tick_timestamp: IntGauge,
    pub next_tick_timestamp: IntGauge,

    pub reconcile_runs_total: IntCounter,
    pub reconcile_errors_total: IntCounter,
    pub events_applied_total: IntCounterVec,

    pub bus_subscribers: IntGauge,
    pub reconcile_duration_seconds: Histogram,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("collectors", &self.registry.gather().len())
            .finish()
    }
}

fn register_err(err: prometheus::Error) -> VolumeError {
    VolumeError::Internal(format!("metric registration failed: {err}"))
}

impl Metrics {
    pub fn new() -> VolumeResult<Self> {
        let registry = Registry::new();

        let scans_total = IntCounterVec::new(
            Opts::new("volumetry_scans_total", "Completed scans by status"),
            &["status"],
        )
        .map_err(register_err)?;
        let scan_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "volumetry_scan_duration_seconds",
                "Scan wall time by method",
            )
            .buckets(vec![0.05, 0.25, 1.0, 5.0, 15.0, 60.0, 300.0]),
            &["method"],
        )
        .map_err(register_err)?;
        let scan_errors_total = IntCounterVec::new(
            Opts::new("volumetry_scan_errors_total", "Scan failures by code"),
            &["code"],
        )
        .map_err(register_err)?;
        let active_scans = IntGauge::new("volumetry_active_scans", "Scans currently running")
            .map_err(register_err)?;

        let cache_hits_total =
            IntCounter::new("volumetry_cache_hits_total", "Result cache hits")
                .map_err(register_err)?;
        let cache_misses_total =
            IntCounter::new("volumetry_cache_misses_total", "Result cache misses")
                .map_err(register_err)?;

        let queue_depth = IntGauge::new("volumetry_queue_depth", "Scheduler queue depth")
            .map_err(register_err)?;
        let worker_pool_size =
            IntGauge::new("volumetry_worker_pool_size", "Configured scheduler workers")
                .map_err(register_err)?;
        let active_workers =
            IntGauge::new("volumetry_active_workers", "Workers currently scanning")
                .map_err(register_err)?;
        let last_tick_timestamp = IntGauge::new(
            "volumetry_scheduler_last_tick_timestamp_seconds",
            "Unix time of the last periodic tick",
        )
        .map_err(register_err)?;
        let next_tick_timestamp = IntGauge::new(
            "volumetry_scheduler_next_tick_timestamp_seconds",
            "Unix time of the next periodic tick",
        )
        .map_err(register_err)?;

        let reconcile_runs_total = IntCounter::new(
            "volumetry_reconcile_runs_total",
            "Completed full reconciliation passes",
        )
        .map_err(register_err)?;
        let reconcile_errors_total = IntCounter::new(
            "volumetry_reconcile_errors_total",
            "Reconciler errors, stream and periodic",
        )
        .map_err(register_err)?;
        let events_applied_total = IntCounterVec::new(
            Opts::new("volumetry_events_applied_total", "Host events applied by kind"),
            &["kind"],
        )
        .map_err(register_err)?;

        let bus_subscribers = IntGauge::new(
            "volumetry_bus_subscribers",
            "Active realtime bus subscribers",
        )
        .map_err(register_err)?;
        let reconcile_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "volumetry_reconcile_duration_seconds",
                "Full reconciliation pass wall time",
            )
            .buckets(vec![0.01, 0.05, 0.25, 1.0, 5.0, 30.0]),
        )
        .map_err(register_err)?;

        for collector in [
            Box::new(scans_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(scan_duration_seconds.clone()),
            Box::new(scan_errors_total.clone()),
            Box::new(active_scans.clone()),
            Box::new(cache_hits_total.clone()),
            Box::new(cache_misses_total.clone()),
            Box::new(queue_depth.clone()),
            Box::new(worker_pool_size.clone()),
            Box::new(active_workers.clone()),
            Box::new(last_tick_timestamp.clone()),
            Box::new(next_tick_timestamp.clone()),
            Box::new(reconcile_runs_total.clone()),
            Box::new(reconcile_errors_total.clone()),
            Box::new(events_applied_total.clone()),
            Box::new(bus_subscribers.clone()),
            Box::new(reconcile_duration_seconds.clone()),
        ] {
            registry.register(collector).map_err(register_err)?;
        }

        Ok(Self {
            registry,
            scans_total,
            scan_duration_seconds,
            scan_errors_total,
            active_scans,
            cache_hits_total,
            cache_misses_total,
            queue_depth,
            worker_pool_size,
            active_workers,
            last_tick_timestamp,
            next_tick_timestamp,
            reconcile_runs_total,
            reconcile_errors_total,
            events_applied_total,
            bus_subscribers,
            reconcile_duration_seconds,
        })
    }

    /// Prometheus text exposition for `GET /metrics`.
    pub fn render(&self) -> VolumeResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|err| VolumeError::Internal(format!("metric encoding failed: {err}")))?;
        String::from_utf8(buffer)
            .map_err(|err| VolumeError::Internal(format!("metric encoding failed: {err}")))
    }
}
