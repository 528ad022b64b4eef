//! Shared fixtures for the core integration tests.
#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use volumetry_core::methods::{MethodOutput, NativeSizer, ScanContext, Sizer};
use volumetry_core::oracle::{FakeOracle, VolumeOracle};
use volumetry_core::store::{MemoryStore, VolumeStore};
use volumetry_core::{
    engine::EngineConfig, EventBus, Metrics, ScanCache, ScanEngine,
};
use volumetry_model::{
    AccuracyClass, MethodDescriptor, PerformanceClass, SizeBasis, VolumeError, VolumeResult,
};

/// Scripted sizer for timing-sensitive tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubBehavior {
    /// Return the fixed size after a short delay.
    Quick(i64),
    /// Sleep this long before returning, observing cancellation.
    Slow(Duration),
    /// Never return until canceled.
    Block,
}

pub struct StubSizer {
    pub behavior: StubBehavior,
    pub invocations: AtomicUsize,
    pub started: Notify,
}

impl StubSizer {
    pub fn new(behavior: StubBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            invocations: AtomicUsize::new(0),
            started: Notify::new(),
        })
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sizer for StubSizer {
    fn name(&self) -> &'static str {
        "native"
    }

    fn descriptor(&self) -> MethodDescriptor {
        MethodDescriptor {
            name: "native".to_string(),
            performance: PerformanceClass::Fast,
            accuracy: AccuracyClass::Exact,
            basis: SizeBasis::Logical,
            reports_file_counts: false,
            available: false,
        }
    }

    async fn available(&self) -> bool {
        true
    }

    async fn scan(&self, path: &Path, ctx: &ScanContext) -> VolumeResult<MethodOutput> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        // notify_one leaves a permit, so a waiter that arrives late still
        // sees the start
        self.started.notify_one();
        let canceled = || VolumeError::ScanCanceled(path.display().to_string());
        match self.behavior {
            StubBehavior::Quick(size) => {
                tokio::time::sleep(Duration::from_millis(20)).await;
                if ctx.cancel.is_cancelled() {
                    return Err(canceled());
                }
                Ok(MethodOutput {
                    total_bytes: size,
                    ..MethodOutput::default()
                })
            }
            StubBehavior::Slow(delay) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => Ok(MethodOutput::default()),
                    _ = ctx.cancel.cancelled() => Err(canceled()),
                }
            }
            StubBehavior::Block => {
                ctx.cancel.cancelled().await;
                Err(canceled())
            }
        }
    }
}

pub struct CoreHarness {
    pub store: Arc<MemoryStore>,
    pub store_dyn: Arc<dyn VolumeStore>,
    pub oracle: Arc<FakeOracle>,
    pub cache: Arc<ScanCache>,
    pub bus: Arc<EventBus>,
    pub metrics: Arc<Metrics>,
    pub engine: Arc<ScanEngine>,
}

pub fn engine_config(timeout: Duration) -> EngineConfig {
    EngineConfig {
        timeout,
        max_concurrent: 5,
        preference: vec!["native".to_string()],
        bind_mounts_enabled: false,
        bind_allow_list: Vec::new(),
    }
}

pub async fn harness_with(
    sizer: Arc<dyn Sizer>,
    config: EngineConfig,
) -> CoreHarness {
    let store = Arc::new(MemoryStore::new(None));
    let store_dyn: Arc<dyn VolumeStore> = store.clone();
    let oracle = Arc::new(FakeOracle::new());
    let cache = Arc::new(ScanCache::new(Duration::from_secs(300), 100));
    let bus = Arc::new(EventBus::default());
    let metrics = Arc::new(Metrics::new().expect("metrics"));

    let engine = ScanEngine::new(
        Arc::clone(&store_dyn),
        oracle.clone(),
        Arc::clone(&cache),
        Arc::clone(&bus),
        Arc::clone(&metrics),
        vec![sizer],
        config,
    )
    .await
    .expect("engine");

    CoreHarness {
        store,
        store_dyn,
        oracle,
        cache,
        bus,
        metrics,
        engine,
    }
}

pub async fn native_harness() -> CoreHarness {
    harness_with(
        Arc::new(NativeSizer::new()),
        engine_config(Duration::from_secs(30)),
    )
    .await
}

/// Poll until `check` passes or the deadline expires.
pub async fn wait_for<F, Fut>(deadline: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let started = std::time::Instant::now();
    loop {
        if check().await {
            return;
        }
        if started.elapsed() > deadline {
            panic!("condition not reached within {deadline:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
