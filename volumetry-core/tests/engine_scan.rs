//! Engine behaviour: caching laws, single-flight, timeouts, cancellation,
//! and scan-run bookkeeping.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use common::{engine_config, harness_with, native_harness, StubBehavior, StubSizer};
use volumetry_core::VolumeStore;
use volumetry_model::{ScanOptions, ScanStatus, VolumeError};

fn fresh_token() -> CancellationToken {
    CancellationToken::new()
}

#[tokio::test]
async fn scan_persists_sample_and_completes_run() {
    let harness = native_harness().await;
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.bin"), [0u8; 100]).unwrap();
    std::fs::write(dir.path().join("b.bin"), [0u8; 200]).unwrap();
    std::fs::write(dir.path().join("c.bin"), [0u8; 300]).unwrap();
    harness
        .oracle
        .add_named_volume("data", dir.path().to_str().unwrap());

    let report = harness
        .engine
        .scan("data", &ScanOptions::default(), fresh_token())
        .await
        .unwrap();
    assert_eq!(report.total_size, 600);
    assert_eq!(report.file_count, Some(3));
    assert_eq!(report.directory_count, Some(1));
    assert!(!report.cached);

    // run bookkeeping: terminal, complete, with a resolvable result
    let run = harness.store.latest_scan_run("data").await.unwrap().unwrap();
    assert_eq!(run.status, ScanStatus::Completed);
    assert_eq!(run.progress, 100);
    assert!(run.completed_at.is_some());
    let sample_id = run.result_ref.expect("completed run keeps a result ref");

    let sample = harness.store.latest_size_sample("data").await.unwrap().unwrap();
    assert_eq!(sample.id, sample_id);
    assert_eq!(sample.ts, run.completed_at.unwrap());
    assert_eq!(sample.size_bytes, 600);

    let volume = harness.store.get_volume_by_name("data").await.unwrap().unwrap();
    assert_eq!(volume.last_scanned_at, run.completed_at);
}

#[tokio::test]
async fn repeat_scan_within_ttl_is_served_from_cache() {
    let harness = native_harness().await;
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("x.bin"), [0u8; 64]).unwrap();
    harness
        .oracle
        .add_named_volume("data", dir.path().to_str().unwrap());

    let first = harness
        .engine
        .scan("data", &ScanOptions::default(), fresh_token())
        .await
        .unwrap();
    let second = harness
        .engine
        .scan("data", &ScanOptions::default(), fresh_token())
        .await
        .unwrap();

    assert!(!first.cached);
    assert!(second.cached);
    assert_eq!(second.total_size, first.total_size);
    assert_eq!(second.scanned_at, first.scanned_at);

    // no second measurement hit the history
    let samples = harness.store.get_size_samples("data", None, 10).await.unwrap();
    assert_eq!(samples.len(), 1);
}

#[tokio::test]
async fn force_refresh_measures_again() {
    let harness = native_harness().await;
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("x.bin"), [0u8; 64]).unwrap();
    harness
        .oracle
        .add_named_volume("data", dir.path().to_str().unwrap());

    let options = ScanOptions {
        force_refresh: true,
        method: None,
    };
    harness.engine.scan("data", &options, fresh_token()).await.unwrap();
    harness.engine.scan("data", &options, fresh_token()).await.unwrap();

    let samples = harness.store.get_size_samples("data", None, 10).await.unwrap();
    assert_eq!(samples.len(), 2);
}

#[tokio::test]
async fn concurrent_identical_scans_coalesce_into_one_measurement() {
    let stub = StubSizer::new(StubBehavior::Quick(4_096));
    let harness = harness_with(stub.clone(), engine_config(Duration::from_secs(30))).await;
    let dir = tempfile::tempdir().unwrap();
    harness
        .oracle
        .add_named_volume("data", dir.path().to_str().unwrap());

    let engine_a = Arc::clone(&harness.engine);
    let engine_b = Arc::clone(&harness.engine);
    let (a, b) = tokio::join!(
        async move {
            engine_a
                .scan("data", &ScanOptions::default(), CancellationToken::new())
                .await
        },
        async move {
            engine_b
                .scan("data", &ScanOptions::default(), CancellationToken::new())
                .await
        },
    );
    let a = a.unwrap();
    let b = b.unwrap();

    assert_eq!(stub.invocation_count(), 1);
    assert_eq!(a.scanned_at, b.scanned_at);
    assert_eq!(a.total_size, 4_096);
    assert_eq!(b.total_size, 4_096);

    let samples = harness.store.get_size_samples("data", None, 10).await.unwrap();
    assert_eq!(samples.len(), 1);
}

#[tokio::test]
async fn deadline_overrun_fails_the_run_with_scan_timeout() {
    let stub = StubSizer::new(StubBehavior::Slow(Duration::from_secs(60)));
    let harness = harness_with(stub, engine_config(Duration::from_millis(100))).await;
    let dir = tempfile::tempdir().unwrap();
    harness
        .oracle
        .add_named_volume("data", dir.path().to_str().unwrap());

    let err = harness
        .engine
        .scan("data", &ScanOptions::default(), fresh_token())
        .await
        .unwrap_err();
    assert!(matches!(err, VolumeError::ScanTimeout { .. }));

    let run = harness.store.latest_scan_run("data").await.unwrap().unwrap();
    assert_eq!(run.status, ScanStatus::Failed);
    assert!(run.completed_at.is_some());
    assert!(run.error.unwrap().contains("scan_timeout"));
}

#[tokio::test]
async fn cancellation_records_canceled_not_failed() {
    let stub = StubSizer::new(StubBehavior::Block);
    let harness = harness_with(stub.clone(), engine_config(Duration::from_secs(60))).await;
    let dir = tempfile::tempdir().unwrap();
    harness
        .oracle
        .add_named_volume("data", dir.path().to_str().unwrap());

    let cancel = CancellationToken::new();
    let engine = Arc::clone(&harness.engine);
    let scan_cancel = cancel.clone();
    let scan = tokio::spawn(async move {
        engine
            .scan("data", &ScanOptions::default(), scan_cancel)
            .await
    });

    stub.started.notified().await;
    cancel.cancel();

    let err = scan.await.unwrap().unwrap_err();
    assert!(matches!(err, VolumeError::ScanCanceled(_)));

    let run = harness.store.latest_scan_run("data").await.unwrap().unwrap();
    assert_eq!(run.status, ScanStatus::Canceled);
    assert!(run.completed_at.is_some());
}

#[tokio::test]
async fn waiters_on_a_canceled_flight_get_scan_canceled() {
    let stub = StubSizer::new(StubBehavior::Block);
    let harness = harness_with(stub.clone(), engine_config(Duration::from_secs(60))).await;
    let dir = tempfile::tempdir().unwrap();
    harness
        .oracle
        .add_named_volume("data", dir.path().to_str().unwrap());

    let leader_cancel = CancellationToken::new();
    let leader_engine = Arc::clone(&harness.engine);
    let leader_token = leader_cancel.clone();
    let leader = tokio::spawn(async move {
        leader_engine
            .scan("data", &ScanOptions::default(), leader_token)
            .await
    });
    stub.started.notified().await;

    // the follower holds its own, never-canceled token
    let follower_engine = Arc::clone(&harness.engine);
    let follower = tokio::spawn(async move {
        follower_engine
            .scan("data", &ScanOptions::default(), CancellationToken::new())
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    leader_cancel.cancel();
    assert!(matches!(
        leader.await.unwrap(),
        Err(VolumeError::ScanCanceled(_))
    ));
    assert!(matches!(
        follower.await.unwrap(),
        Err(VolumeError::ScanCanceled(_))
    ));
}

#[tokio::test]
async fn unknown_override_method_is_rejected() {
    let harness = native_harness().await;
    let dir = tempfile::tempdir().unwrap();
    harness
        .oracle
        .add_named_volume("data", dir.path().to_str().unwrap());

    let options = ScanOptions {
        force_refresh: false,
        method: Some("quantum".to_string()),
    };
    let err = harness
        .engine
        .scan("data", &options, fresh_token())
        .await
        .unwrap_err();
    assert!(matches!(err, VolumeError::MethodUnavailable(_)));
}

#[tokio::test]
async fn bind_mounts_are_refused_unless_allow_listed() {
    let harness = native_harness().await;
    let dir = tempfile::tempdir().unwrap();
    harness
        .oracle
        .add_named_volume("/srv/data", dir.path().to_str().unwrap());

    let err = harness
        .engine
        .scan("/srv/data", &ScanOptions::default(), fresh_token())
        .await
        .unwrap_err();
    assert!(matches!(err, VolumeError::PermissionDenied(_)));

    // allow-listed prefix with the feature on is admitted
    let mut config = engine_config(Duration::from_secs(30));
    config.bind_mounts_enabled = true;
    config.bind_allow_list = vec!["/srv".to_string()];
    let harness = harness_with(
        Arc::new(volumetry_core::methods::NativeSizer::new()),
        config,
    )
    .await;
    harness
        .oracle
        .add_named_volume("/srv/data", dir.path().to_str().unwrap());
    let report = harness
        .engine
        .scan("/srv/data", &ScanOptions::default(), fresh_token())
        .await
        .unwrap();
    assert_eq!(report.total_size, 0);
}

#[tokio::test]
async fn missing_volume_is_volume_not_found() {
    let harness = native_harness().await;
    let err = harness
        .engine
        .scan("ghost", &ScanOptions::default(), fresh_token())
        .await
        .unwrap_err();
    assert!(matches!(err, VolumeError::VolumeNotFound(_)));
}
