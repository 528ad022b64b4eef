use std::sync::Arc;

use chrono::{DateTime, Utc};

use volumetry_config::Settings;
use volumetry_core::{
    EventBus, Metrics, Reconciler, ScanCache, ScanEngine, Scheduler, VolumeOracle, VolumeStore,
};

/// Composition root handed to every handler. The cache, engine semaphore,
/// and bus are process singletons owned here; tests substitute fakes behind
/// the same seams.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub store: Arc<dyn VolumeStore>,
    pub oracle: Arc<dyn VolumeOracle>,
    pub cache: Arc<ScanCache>,
    pub engine: Arc<ScanEngine>,
    pub scheduler: Arc<Scheduler>,
    pub reconciler: Arc<Reconciler>,
    pub bus: Arc<EventBus>,
    pub metrics: Arc<Metrics>,
    pub started_at: DateTime<Utc>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("started_at", &self.started_at)
            .finish()
    }
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Arc<Settings>,
        store: Arc<dyn VolumeStore>,
        oracle: Arc<dyn VolumeOracle>,
        cache: Arc<ScanCache>,
        engine: Arc<ScanEngine>,
        scheduler: Arc<Scheduler>,
        reconciler: Arc<Reconciler>,
        bus: Arc<EventBus>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            settings,
            store,
            oracle,
            cache,
            engine,
            scheduler,
            reconciler,
            bus,
            metrics,
            started_at: Utc::now(),
        }
    }
}
