//! Router-level tests over the in-memory store and the scripted oracle.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use volumetry_config::Settings;
use volumetry_core::methods::NativeSizer;
use volumetry_core::oracle::FakeOracle;
use volumetry_core::store::MemoryStore;
use volumetry_core::{
    engine::EngineConfig, reconciler::ReconcilerConfig, scheduler::SchedulerConfig, EventBus,
    Metrics, Reconciler, ScanCache, ScanEngine, Scheduler, VolumeStore,
};

use crate::routes::create_router;
use crate::state::AppState;

struct TestHarness {
    state: AppState,
    oracle: Arc<FakeOracle>,
    store: Arc<MemoryStore>,
}

async fn harness() -> TestHarness {
    let mut settings = Settings::default();
    settings.scan.methods_order = vec!["native".to_string()];
    let settings = Arc::new(settings);

    let store = Arc::new(MemoryStore::new(settings.system_regex()));
    let store_dyn: Arc<dyn VolumeStore> = store.clone();
    let oracle = Arc::new(FakeOracle::new());
    let cache = Arc::new(ScanCache::new(Duration::from_secs(300), 100));
    let bus = Arc::new(EventBus::default());
    let metrics = Arc::new(Metrics::new().unwrap());

    let engine = ScanEngine::new(
        Arc::clone(&store_dyn),
        oracle.clone(),
        Arc::clone(&cache),
        Arc::clone(&bus),
        Arc::clone(&metrics),
        vec![Arc::new(NativeSizer::new())],
        EngineConfig::from_settings(&settings),
    )
    .await
    .unwrap();

    let scheduler = Scheduler::new(
        Arc::clone(&engine),
        Arc::clone(&store_dyn),
        Arc::clone(&metrics),
        SchedulerConfig::from_settings(&settings),
    );
    let reconciler = Reconciler::new(
        oracle.clone(),
        Arc::clone(&store_dyn),
        Arc::clone(&cache),
        Arc::clone(&bus),
        Arc::clone(&metrics),
        ReconcilerConfig::from_settings(&settings),
    );

    let state = AppState::new(
        settings, store_dyn, oracle.clone(), cache, engine, scheduler, reconciler, bus, metrics,
    );
    TestHarness {
        state,
        oracle,
        store,
    }
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = to_bytes(response.into_body(), 1 << 20).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn empty_inventory_lists_cleanly() {
    let harness = harness().await;
    let app = create_router(harness.state);

    let response = app.oneshot(get("/volumes")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["total"], 0);
    assert_eq!(json["volumes"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn paging_coerces_instead_of_panicking() {
    let harness = harness().await;
    let app = create_router(harness.state);

    let response = app
        .oneshot(get("/volumes?page=0&page_size=0&sort=bogus:sideways"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["page"], 1);
    assert_eq!(json["page_size"], volumetry_model::filter::DEFAULT_PAGE_SIZE);
}

#[tokio::test]
async fn unknown_volume_detail_is_404_with_code() {
    let harness = harness().await;
    let app = create_router(harness.state);

    let response = app.oneshot(get("/volumes/ghost")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "volume_not_found");
}

#[tokio::test]
async fn scan_methods_reports_native_available() {
    let harness = harness().await;
    let app = create_router(harness.state);

    let response = app.oneshot(get("/scan-methods")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    let methods = json["methods"].as_array().unwrap();
    let native = methods.iter().find(|m| m["name"] == "native").unwrap();
    assert_eq!(native["available"], true);
    assert_eq!(native["reports_file_counts"], true);
}

#[tokio::test]
async fn refresh_then_cached_size_round_trip() {
    let harness = harness().await;

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.bin"), [0u8; 100]).unwrap();
    std::fs::write(dir.path().join("b.bin"), [0u8; 200]).unwrap();
    std::fs::write(dir.path().join("c.bin"), [0u8; 300]).unwrap();
    harness
        .oracle
        .add_named_volume("data", dir.path().to_str().unwrap());

    let app = create_router(harness.state.clone());
    let response = app
        .clone()
        .oneshot(post_json(
            "/volumes/data/size/refresh",
            serde_json::json!({"async": false, "method": "native"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["total_size"], 600);
    assert_eq!(json["file_count"], 3);
    assert_eq!(json["directory_count"], 1);
    assert_eq!(json["method"], "native");
    assert_eq!(json["cached"], false);

    // the follow-up read serves the recorded sample
    let response = app.oneshot(get("/volumes/data/size")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["total_size"], 600);
    assert_eq!(json["cached"], true);

    // history picked up exactly one sample
    let samples = harness.store.get_size_samples("data", None, 10).await.unwrap();
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].size_bytes, 600);
}

#[tokio::test]
async fn async_refresh_returns_scan_id_and_status_url() {
    let harness = harness().await;

    let dir = tempfile::tempdir().unwrap();
    harness
        .oracle
        .add_named_volume("data", dir.path().to_str().unwrap());

    let app = create_router(harness.state.clone());
    let response = app
        .clone()
        .oneshot(post_json(
            "/volumes/data/size/refresh",
            serde_json::json!({"async": true}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let json = body_json(response).await;
    assert_eq!(json["status_url"], "/volumes/data/scan/status");
    assert!(json["scan_id"].is_string());

    // the run exists immediately, in a queryable state
    let response = app.oneshot(get("/volumes/data/scan/status")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn bulk_scan_reports_totals_and_failures() {
    let harness = harness().await;

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("x.bin"), [0u8; 128]).unwrap();
    harness
        .oracle
        .add_named_volume("data", dir.path().to_str().unwrap());

    let app = create_router(harness.state);
    let response = app
        .oneshot(post_json(
            "/volumes/bulk-scan",
            serde_json::json!({"volume_names": ["data", "ghost"], "async": false}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["totals"]["requested"], 2);
    assert_eq!(json["totals"]["succeeded"], 1);
    assert_eq!(json["totals"]["failed"], 1);
    assert_eq!(json["failed"][0]["code"], "volume_not_found");
}

#[tokio::test]
async fn health_degrades_when_the_oracle_goes_away() {
    let harness = harness().await;
    harness.oracle.set_unreachable(true);

    let app = create_router(harness.state);
    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "degraded");
    assert_eq!(json["components"]["host_oracle"], "down");
    assert_eq!(json["components"]["persistence"], "up");
}

#[tokio::test]
async fn metrics_exposition_is_plaintext() {
    let harness = harness().await;
    let app = create_router(harness.state);

    let response = app.oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), 1 << 20).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("volumetry_"));
}
