//! Scheduler behaviour: admission, rate limiting, queue overflow, worker
//! execution, and graceful shutdown.

mod common;

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;

use common::{engine_config, harness_with, wait_for, StubBehavior, StubSizer};
use volumetry_core::oracle::VolumeOracle;
use volumetry_core::scheduler::{Scheduler, SchedulerConfig};
use volumetry_core::store::VolumeStore;
use volumetry_model::{ScanStatus, VolumeError};

fn scheduler_config(concurrency: usize) -> SchedulerConfig {
    SchedulerConfig {
        enabled: true,
        interval: Duration::from_secs(3_600),
        concurrency,
        queue_capacity: concurrency * 10,
        skip_pattern: None,
        bind_mounts_enabled: false,
        bind_allow_list: Vec::new(),
        scan_timeout: Duration::from_secs(30),
    }
}

async fn seed_volume(harness: &common::CoreHarness, name: &str) {
    let dir = std::env::temp_dir();
    harness.oracle.add_named_volume(name, dir.to_str().unwrap());
    let observed = harness.oracle.get_volume(name).await.unwrap().unwrap();
    harness
        .store_dyn
        .upsert_volume(&observed.into_volume())
        .await
        .unwrap();
}

#[tokio::test]
async fn enqueue_all_is_rate_limited_within_the_window() {
    let stub = StubSizer::new(StubBehavior::Quick(1));
    let harness = harness_with(stub, engine_config(Duration::from_secs(30))).await;
    seed_volume(&harness, "data").await;
    seed_volume(&harness, "cache").await;

    let scheduler = Scheduler::new(
        Arc::clone(&harness.engine),
        Arc::clone(&harness.store_dyn),
        Arc::clone(&harness.metrics),
        scheduler_config(2),
    );

    let batch = scheduler.enqueue_all().await.unwrap();
    assert_eq!(batch.enqueued, 2);
    let runs_before = harness.store_dyn.list_active_scan_runs().await.unwrap().len();

    let err = scheduler.enqueue_all().await.unwrap_err();
    match err {
        VolumeError::RateLimited { retry_after_secs } => {
            assert!(retry_after_secs >= 1 && retry_after_secs <= 60);
        }
        other => panic!("expected rate_limited, got {other:?}"),
    }

    // the rejected batch inserted nothing
    let runs_after = harness.store_dyn.list_active_scan_runs().await.unwrap().len();
    assert_eq!(runs_before, runs_after);
}

#[tokio::test]
async fn skip_pattern_drops_volumes_silently() {
    let stub = StubSizer::new(StubBehavior::Quick(1));
    let harness = harness_with(stub, engine_config(Duration::from_secs(30))).await;
    seed_volume(&harness, "temp_build").await;
    seed_volume(&harness, "data").await;

    let mut config = scheduler_config(2);
    config.skip_pattern = Some(Regex::new("^temp_").unwrap());
    let scheduler = Scheduler::new(
        Arc::clone(&harness.engine),
        Arc::clone(&harness.store_dyn),
        Arc::clone(&harness.metrics),
        config,
    );

    let batch = scheduler.enqueue_all().await.unwrap();
    assert_eq!(batch.enqueued, 1);
    assert_eq!(batch.skipped, 1);

    // no run exists for the skipped volume, and nothing errored
    let runs = harness.store_dyn.list_active_scan_runs().await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].volume_name, "data");
}

#[tokio::test]
async fn bind_mounts_are_dropped_unless_enabled_and_allow_listed() {
    let stub = StubSizer::new(StubBehavior::Quick(1));
    let harness = harness_with(stub, engine_config(Duration::from_secs(30))).await;
    seed_volume(&harness, "/srv/data").await;
    seed_volume(&harness, "data").await;

    let scheduler = Scheduler::new(
        Arc::clone(&harness.engine),
        Arc::clone(&harness.store_dyn),
        Arc::clone(&harness.metrics),
        scheduler_config(2),
    );
    let batch = scheduler.enqueue_all().await.unwrap();
    assert_eq!(batch.enqueued, 1);
    assert_eq!(batch.skipped, 1);
}

#[tokio::test]
async fn queue_overflow_never_blocks() {
    let stub = StubSizer::new(StubBehavior::Quick(1));
    let harness = harness_with(stub, engine_config(Duration::from_secs(30))).await;
    // capacity is 10x concurrency = 10; seed 12 admissible volumes
    for i in 0..12 {
        seed_volume(&harness, &format!("vol{i:02}")).await;
    }

    let scheduler = Scheduler::new(
        Arc::clone(&harness.engine),
        Arc::clone(&harness.store_dyn),
        Arc::clone(&harness.metrics),
        scheduler_config(1),
    );
    // workers are not started, so the queue only fills
    let batch = scheduler.enqueue_all().await.unwrap();
    assert_eq!(batch.enqueued, 10);
    assert_eq!(batch.dropped, 2);

    // a single manual enqueue on the saturated queue reports queue_full
    seed_volume(&harness, "extra").await;
    let err = scheduler.enqueue_volume("extra").await.unwrap_err();
    assert!(matches!(err, VolumeError::QueueFull));
}

#[tokio::test]
async fn enqueue_volume_reuses_the_pending_run() {
    let stub = StubSizer::new(StubBehavior::Quick(1));
    let harness = harness_with(stub, engine_config(Duration::from_secs(30))).await;
    seed_volume(&harness, "data").await;

    let scheduler = Scheduler::new(
        Arc::clone(&harness.engine),
        Arc::clone(&harness.store_dyn),
        Arc::clone(&harness.metrics),
        scheduler_config(1),
    );

    let first = scheduler.enqueue_volume("data").await.unwrap();
    let second = scheduler.enqueue_volume("data").await.unwrap();
    assert_eq!(first, second);

    let runs = harness.store_dyn.list_active_scan_runs().await.unwrap();
    assert_eq!(runs.len(), 1);
}

#[tokio::test]
async fn workers_drain_the_queue_and_complete_runs() {
    let stub = StubSizer::new(StubBehavior::Quick(2_048));
    let harness = harness_with(stub, engine_config(Duration::from_secs(30))).await;
    seed_volume(&harness, "data").await;

    let scheduler = Scheduler::new(
        Arc::clone(&harness.engine),
        Arc::clone(&harness.store_dyn),
        Arc::clone(&harness.metrics),
        scheduler_config(2),
    );
    scheduler.start().await;

    let scan_id = scheduler.enqueue_volume("data").await.unwrap();
    let store = Arc::clone(&harness.store_dyn);
    wait_for(Duration::from_secs(5), || {
        let store = Arc::clone(&store);
        async move {
            matches!(
                store.get_scan_run(scan_id).await,
                Ok(Some(run)) if run.status == ScanStatus::Completed
            )
        }
    })
    .await;

    // the worker's own accounting settles right after the run completes
    let status_scheduler = Arc::clone(&scheduler);
    wait_for(Duration::from_secs(2), move || {
        let scheduler = Arc::clone(&status_scheduler);
        async move { scheduler.status().completed == 1 }
    })
    .await;
    assert_eq!(scheduler.status().queue_depth, 0);

    scheduler.stop(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn stop_cancels_in_flight_scans() {
    let stub = StubSizer::new(StubBehavior::Block);
    let harness = harness_with(stub.clone(), engine_config(Duration::from_secs(60))).await;
    seed_volume(&harness, "data").await;

    let scheduler = Scheduler::new(
        Arc::clone(&harness.engine),
        Arc::clone(&harness.store_dyn),
        Arc::clone(&harness.metrics),
        scheduler_config(1),
    );
    scheduler.start().await;

    let scan_id = scheduler.enqueue_volume("data").await.unwrap();
    stub.started.notified().await;

    scheduler.stop(Duration::from_secs(2)).await;

    let run = harness
        .store_dyn
        .get_scan_run(scan_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.status, ScanStatus::Canceled);
    assert!(run.completed_at.is_some());
}
