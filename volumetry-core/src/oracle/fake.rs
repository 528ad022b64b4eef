//! Scriptable in-memory oracle for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;

use volumetry_model::{HostEvent, VolumeError, VolumeResult};

use super::{EventStream, OracleContainer, OracleVolume, VolumeOracle};

/// In-memory oracle. Tests mutate the fixture state and push events through
/// `emit`; flipping `set_unreachable` makes every call fail the way a dead
/// host socket would.
pub struct FakeOracle {
    volumes: Mutex<HashMap<String, OracleVolume>>,
    containers: Mutex<HashMap<String, OracleContainer>>,
    events: broadcast::Sender<HostEvent>,
    unreachable: AtomicBool,
}

impl Default for FakeOracle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FakeOracle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeOracle")
            .field("unreachable", &self.unreachable.load(Ordering::Relaxed))
            .finish()
    }
}

impl FakeOracle {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            volumes: Mutex::new(HashMap::new()),
            containers: Mutex::new(HashMap::new()),
            events,
            unreachable: AtomicBool::new(false),
        }
    }

    pub fn add_volume(&self, volume: OracleVolume) {
        self.volumes
            .lock()
            .expect("fake oracle lock")
            .insert(volume.name.clone(), volume);
    }

    /// Convenience fixture: a local-driver volume rooted at `mountpoint`.
    pub fn add_named_volume(&self, name: &str, mountpoint: &str) {
        self.add_volume(OracleVolume {
            name: name.to_string(),
            driver: "local".to_string(),
            mountpoint: mountpoint.to_string(),
            labels: HashMap::new(),
            options: HashMap::new(),
            scope: "local".to_string(),
            status: None,
            created_at: Utc::now(),
        });
    }

    pub fn remove_volume(&self, name: &str) {
        self.volumes.lock().expect("fake oracle lock").remove(name);
    }

    pub fn add_container(&self, container: OracleContainer) {
        self.containers
            .lock()
            .expect("fake oracle lock")
            .insert(container.id.clone(), container);
    }

    pub fn remove_container(&self, id: &str) {
        self.containers.lock().expect("fake oracle lock").remove(id);
    }

    pub fn emit(&self, event: HostEvent) {
        let _ = self.events.send(event);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::Relaxed);
    }

    fn check_reachable(&self) -> VolumeResult<()> {
        if self.unreachable.load(Ordering::Relaxed) {
            Err(VolumeError::OracleUnavailable(
                "fake oracle marked unreachable".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl VolumeOracle for FakeOracle {
    async fn ping(&self) -> VolumeResult<()> {
        self.check_reachable()
    }

    async fn list_volumes(&self) -> VolumeResult<Vec<OracleVolume>> {
        self.check_reachable()?;
        let mut volumes: Vec<_> = self
            .volumes
            .lock()
            .expect("fake oracle lock")
            .values()
            .cloned()
            .collect();
        volumes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(volumes)
    }

    async fn get_volume(&self, name: &str) -> VolumeResult<Option<OracleVolume>> {
        self.check_reachable()?;
        Ok(self
            .volumes
            .lock()
            .expect("fake oracle lock")
            .get(name)
            .cloned())
    }

    async fn list_containers(&self) -> VolumeResult<Vec<OracleContainer>> {
        self.check_reachable()?;
        let mut containers: Vec<_> = self
            .containers
            .lock()
            .expect("fake oracle lock")
            .values()
            .cloned()
            .collect();
        containers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(containers)
    }

    async fn get_container(&self, id: &str) -> VolumeResult<Option<OracleContainer>> {
        self.check_reachable()?;
        Ok(self
            .containers
            .lock()
            .expect("fake oracle lock")
            .get(id)
            .cloned())
    }

    async fn get_volume_containers(&self, name: &str) -> VolumeResult<Vec<OracleContainer>> {
        let containers = self.list_containers().await?;
        Ok(containers
            .into_iter()
            .filter(|c| c.mounts.iter().any(|m| m.volume_name == name))
            .collect())
    }

    async fn stream_events(&self, cancel: CancellationToken) -> VolumeResult<EventStream> {
        self.check_reachable()?;
        let rx = self.events.subscribe();
        let stream = BroadcastStream::new(rx)
            .take_until(async move { cancel.cancelled().await })
            .filter_map(|item| async move {
                match item {
                    Ok(event) => Some(Ok(event)),
                    // lagged receivers drop events; reconciliation covers the gap
                    Err(_) => None,
                }
            });
        Ok(Box::pin(stream))
    }
}
