//! Reconciler behaviour: idempotent event application, destroy cascades,
//! full diff passes, and live stream consumption.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{engine_config, harness_with, wait_for, StubBehavior, StubSizer};
use volumetry_core::oracle::{OracleContainer, OracleMount};
use volumetry_core::reconciler::{Reconciler, ReconcilerConfig};
use volumetry_model::{BusMessage, HostEvent, HostEventKind};

fn reconciler_for(harness: &common::CoreHarness) -> Arc<Reconciler> {
    Reconciler::new(
        harness.oracle.clone(),
        Arc::clone(&harness.store_dyn),
        Arc::clone(&harness.cache),
        Arc::clone(&harness.bus),
        Arc::clone(&harness.metrics),
        ReconcilerConfig {
            enabled: true,
            interval: Duration::from_secs(3_600),
        },
    )
}

fn running_container(id: &str, volume: &str) -> OracleContainer {
    OracleContainer {
        id: id.to_string(),
        name: format!("app-{id}"),
        image: "app:latest".to_string(),
        state: "running".to_string(),
        status: "Up 2 minutes".to_string(),
        started_at: Some(chrono::Utc::now()),
        finished_at: None,
        mounts: vec![OracleMount {
            volume_name: volume.to_string(),
            destination: "/data".to_string(),
            rw: true,
        }],
    }
}

async fn seed(harness: &common::CoreHarness) -> Arc<Reconciler> {
    harness.oracle.add_named_volume("data", "/tmp/data");
    harness.oracle.add_container(running_container("c1", "data"));
    let reconciler = reconciler_for(harness);
    reconciler.reconcile().await.unwrap();
    reconciler
}

#[tokio::test]
async fn full_pass_builds_the_inventory() {
    let stub = StubSizer::new(StubBehavior::Quick(1));
    let harness = harness_with(stub, engine_config(Duration::from_secs(30))).await;
    let _reconciler = seed(&harness).await;

    let volume = harness
        .store_dyn
        .get_volume_by_name("data")
        .await
        .unwrap()
        .unwrap();
    assert!(volume.is_active);

    let attachments = harness.store_dyn.get_attachments("data").await.unwrap();
    assert_eq!(attachments.len(), 1);
    assert_eq!(attachments[0].container_id, "c1");
    assert_eq!(attachments[0].container_name, "app-c1");
    assert!(attachments[0].rw);
}

#[tokio::test]
async fn reconcile_is_a_fixpoint() {
    let stub = StubSizer::new(StubBehavior::Quick(1));
    let harness = harness_with(stub, engine_config(Duration::from_secs(30))).await;
    let reconciler = seed(&harness).await;

    // a second pass against the same host view applies zero edits
    let edits = reconciler.reconcile().await.unwrap();
    assert_eq!(edits, 0);
}

#[tokio::test]
async fn volume_destroy_deactivates_and_notifies() {
    let stub = StubSizer::new(StubBehavior::Quick(1));
    let harness = harness_with(stub, engine_config(Duration::from_secs(30))).await;
    let reconciler = seed(&harness).await;

    let (_, mut bus_rx) = harness.bus.subscribe();
    harness.oracle.remove_volume("data");
    let event = HostEvent::new(HostEventKind::VolumeDestroy, "data");
    reconciler.apply_event(&event).await.unwrap();

    let volume = harness
        .store_dyn
        .get_volume_by_name("data")
        .await
        .unwrap()
        .unwrap();
    assert!(!volume.is_active);
    assert!(harness
        .store_dyn
        .list_active_mounts()
        .await
        .unwrap()
        .is_empty());

    // subscribers see an inventory frame that omits the destroyed volume
    let frame = bus_rx.recv().await.unwrap();
    match frame {
        BusMessage::VolumeUpdate { data, .. } => {
            assert!(data.iter().all(|v| v.name != "data"));
        }
        other => panic!("expected volume_update, got {other:?}"),
    }

    // replaying the event leaves the same state
    reconciler.apply_event(&event).await.unwrap();
    let volume = harness
        .store_dyn
        .get_volume_by_name("data")
        .await
        .unwrap()
        .unwrap();
    assert!(!volume.is_active);
}

#[tokio::test]
async fn mount_events_are_idempotent() {
    let stub = StubSizer::new(StubBehavior::Quick(1));
    let harness = harness_with(stub, engine_config(Duration::from_secs(30))).await;
    let reconciler = seed(&harness).await;

    let mount_event = HostEvent::new(HostEventKind::VolumeMount, "data")
        .with_attribute("container", "c2")
        .with_attribute("destination", "/var/lib/app");
    reconciler.apply_event(&mount_event).await.unwrap();
    reconciler.apply_event(&mount_event).await.unwrap();

    let attachments = harness.store_dyn.get_attachments("data").await.unwrap();
    // one for the seeded c1 and exactly one for c2
    assert_eq!(attachments.len(), 2);

    let unmount = HostEvent::new(HostEventKind::VolumeUnmount, "data")
        .with_attribute("container", "c2")
        .with_attribute("destination", "/var/lib/app");
    reconciler.apply_event(&unmount).await.unwrap();
    reconciler.apply_event(&unmount).await.unwrap();
    let attachments = harness.store_dyn.get_attachments("data").await.unwrap();
    assert_eq!(attachments.len(), 1);
}

#[tokio::test]
async fn container_stop_deactivates_its_mounts_but_keeps_the_row() {
    let stub = StubSizer::new(StubBehavior::Quick(1));
    let harness = harness_with(stub, engine_config(Duration::from_secs(30))).await;
    let reconciler = seed(&harness).await;

    let event = HostEvent::new(HostEventKind::ContainerDie, "c1");
    reconciler.apply_event(&event).await.unwrap();

    let container = harness
        .store_dyn
        .get_container("c1")
        .await
        .unwrap()
        .unwrap();
    assert!(container.is_active);
    assert_eq!(container.state, "exited");
    assert!(container.finished_at.is_some());
    assert!(harness
        .store_dyn
        .get_attachments("data")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn drift_is_repaired_by_the_next_full_pass() {
    let stub = StubSizer::new(StubBehavior::Quick(1));
    let harness = harness_with(stub, engine_config(Duration::from_secs(30))).await;
    let reconciler = seed(&harness).await;

    // the host loses the container and gains a volume while we are blind
    harness.oracle.remove_container("c1");
    harness.oracle.add_named_volume("fresh", "/tmp/fresh");

    let edits = reconciler.reconcile().await.unwrap();
    assert!(edits >= 2);

    assert!(harness
        .store_dyn
        .get_volume_by_name("fresh")
        .await
        .unwrap()
        .unwrap()
        .is_active);
    let container = harness
        .store_dyn
        .get_container("c1")
        .await
        .unwrap()
        .unwrap();
    assert!(!container.is_active);
    assert!(harness
        .store_dyn
        .get_attachments("data")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn started_reconciler_applies_streamed_events() {
    let stub = StubSizer::new(StubBehavior::Quick(1));
    let harness = harness_with(stub, engine_config(Duration::from_secs(30))).await;
    harness.oracle.add_named_volume("data", "/tmp/data");

    let reconciler = reconciler_for(&harness);
    reconciler.start().await;

    // give the stream consumer a moment to attach, then emit
    tokio::time::sleep(Duration::from_millis(100)).await;
    harness
        .oracle
        .emit(HostEvent::new(HostEventKind::VolumeCreate, "data"));

    let store = Arc::clone(&harness.store_dyn);
    wait_for(Duration::from_secs(5), || {
        let store = Arc::clone(&store);
        async move {
            matches!(
                store.get_volume_by_name("data").await,
                Ok(Some(volume)) if volume.is_active
            )
        }
    })
    .await;

    reconciler.stop().await;
}
