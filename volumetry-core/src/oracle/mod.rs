//! The host volume oracle: the service's window onto the container host.
//!
//! The oracle is a seam. Production uses the HTTP client against the
//! container engine API; tests script the in-memory fake.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use volumetry_model::{HostEvent, VolumeResult};

mod docker;
mod fake;

pub use docker::DockerOracle;
pub use fake::FakeOracle;

/// A volume as the host reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleVolume {
    pub name: String,
    pub driver: String,
    pub mountpoint: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub options: HashMap<String, String>,
    pub scope: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// A container as the host reports it, with its volume mounts inlined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub mounts: Vec<OracleMount>,
}

/// One volume mount of a container. Bind mounts carry the host path in
/// `volume_name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleMount {
    pub volume_name: String,
    pub destination: String,
    pub rw: bool,
}

impl OracleVolume {
    /// Inventory row for a freshly observed volume.
    pub fn into_volume(self) -> volumetry_model::Volume {
        let now = Utc::now();
        volumetry_model::Volume {
            name: self.name,
            driver: self.driver,
            mountpoint: self.mountpoint,
            labels: self.labels,
            options: self.options,
            scope: self.scope,
            status: self.status,
            is_active: true,
            last_scanned_at: None,
            created_at: self.created_at,
            updated_at: now,
        }
    }
}

impl OracleContainer {
    pub fn into_container(self) -> volumetry_model::Container {
        let is_active = true;
        volumetry_model::Container {
            id: self.id,
            name: self.name,
            image: self.image,
            state: self.state,
            status: self.status,
            started_at: self.started_at,
            finished_at: self.finished_at,
            is_active,
        }
    }

    /// Mount rows derived from this container's declared mounts.
    pub fn mount_rows(&self) -> Vec<volumetry_model::Mount> {
        self.mounts
            .iter()
            .map(|m| volumetry_model::Mount {
                volume_name: m.volume_name.clone(),
                container_id: self.id.clone(),
                mount_path: m.destination.clone(),
                access_mode: if m.rw {
                    volumetry_model::AccessMode::Rw
                } else {
                    volumetry_model::AccessMode::Ro
                },
                is_active: true,
            })
            .collect()
    }
}

pub type EventStream = BoxStream<'static, VolumeResult<HostEvent>>;

/// Read-only view of the container host plus its event firehose.
#[async_trait]
pub trait VolumeOracle: Send + Sync {
    /// Cheap reachability probe, used at startup and by `/health`.
    async fn ping(&self) -> VolumeResult<()>;

    async fn list_volumes(&self) -> VolumeResult<Vec<OracleVolume>>;

    async fn get_volume(&self, name: &str) -> VolumeResult<Option<OracleVolume>>;

    async fn list_containers(&self) -> VolumeResult<Vec<OracleContainer>>;

    async fn get_container(&self, id: &str) -> VolumeResult<Option<OracleContainer>>;

    /// Containers that currently mount the named volume.
    async fn get_volume_containers(&self, name: &str) -> VolumeResult<Vec<OracleContainer>>;

    /// Open the host event stream. The stream ends when the host closes it
    /// or `cancel` fires; callers own reconnect policy.
    async fn stream_events(&self, cancel: CancellationToken) -> VolumeResult<EventStream>;
}
