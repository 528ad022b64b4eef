//! HTTP client for a Docker-compatible engine API.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::StreamExt;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use volumetry_model::{HostEvent, HostEventKind, VolumeError, VolumeResult};

use super::{EventStream, OracleContainer, OracleMount, OracleVolume, VolumeOracle};

#[derive(Debug, Clone)]
pub struct DockerOracle {
    client: reqwest::Client,
    base_url: String,
}

fn unavailable(err: impl std::fmt::Display) -> VolumeError {
    VolumeError::OracleUnavailable(err.to_string())
}

impl DockerOracle {
    pub fn new(endpoint: &str, timeout: Duration) -> VolumeResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(unavailable)?;
        Ok(Self {
            client,
            base_url: endpoint.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> VolumeResult<T> {
        let response = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(unavailable)?;
        let status = response.status();
        if !status.is_success() {
            return Err(unavailable(format!("{path} returned {status}")));
        }
        response.json().await.map_err(unavailable)
    }
}

#[derive(Debug, Deserialize)]
struct VolumeListBody {
    #[serde(rename = "Volumes", default)]
    volumes: Option<Vec<WireVolume>>,
}

#[derive(Debug, Deserialize)]
struct WireVolume {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Driver", default)]
    driver: String,
    #[serde(rename = "Mountpoint", default)]
    mountpoint: String,
    #[serde(rename = "Labels", default)]
    labels: Option<HashMap<String, String>>,
    #[serde(rename = "Options", default)]
    options: Option<HashMap<String, String>>,
    #[serde(rename = "Scope", default)]
    scope: String,
    #[serde(rename = "Status", default)]
    status: Option<serde_json::Value>,
    #[serde(rename = "CreatedAt", default)]
    created_at: Option<String>,
}

impl WireVolume {
    fn into_oracle(self) -> OracleVolume {
        let created_at = self
            .created_at
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        OracleVolume {
            name: self.name,
            driver: self.driver,
            mountpoint: self.mountpoint,
            labels: self.labels.unwrap_or_default(),
            options: self.options.unwrap_or_default(),
            scope: if self.scope.is_empty() {
                "local".to_string()
            } else {
                self.scope
            },
            status: self.status,
            created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireContainerSummary {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Names", default)]
    names: Vec<String>,
    #[serde(rename = "Image", default)]
    image: String,
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "Status", default)]
    status: String,
    #[serde(rename = "Mounts", default)]
    mounts: Vec<WireMount>,
}

#[derive(Debug, Deserialize)]
struct WireMount {
    #[serde(rename = "Type", default)]
    mount_type: String,
    #[serde(rename = "Name", default)]
    name: Option<String>,
    #[serde(rename = "Source", default)]
    source: Option<String>,
    #[serde(rename = "Destination", default)]
    destination: String,
    #[serde(rename = "RW", default)]
    rw: bool,
}

impl WireMount {
    /// Named volumes key by volume name; bind mounts key by host path.
    fn into_oracle(self) -> Option<OracleMount> {
        let volume_name = match self.mount_type.as_str() {
            "volume" => self.name?,
            "bind" => self.source?,
            _ => return None,
        };
        Some(OracleMount {
            volume_name,
            destination: self.destination,
            rw: self.rw,
        })
    }
}

impl WireContainerSummary {
    fn into_oracle(self) -> OracleContainer {
        let name = self
            .names
            .first()
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_else(|| self.id.clone());
        OracleContainer {
            id: self.id,
            name,
            image: self.image,
            state: self.state,
            status: self.status,
            started_at: None,
            finished_at: None,
            mounts: self
                .mounts
                .into_iter()
                .filter_map(WireMount::into_oracle)
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireContainerInspect {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "Config", default)]
    config: Option<WireContainerConfig>,
    #[serde(rename = "State", default)]
    state: Option<WireContainerState>,
    #[serde(rename = "Mounts", default)]
    mounts: Vec<WireMount>,
}

#[derive(Debug, Default, Deserialize)]
struct WireContainerConfig {
    #[serde(rename = "Image", default)]
    image: String,
}

#[derive(Debug, Default, Deserialize)]
struct WireContainerState {
    #[serde(rename = "Status", default)]
    status: String,
    #[serde(rename = "StartedAt", default)]
    started_at: Option<String>,
    #[serde(rename = "FinishedAt", default)]
    finished_at: Option<String>,
}

fn parse_state_time(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?;
    // the engine reports zero-value timestamps for states never entered
    if raw.starts_with("0001-") {
        return None;
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

impl WireContainerInspect {
    fn into_oracle(self) -> OracleContainer {
        let state = self.state.unwrap_or_default();
        OracleContainer {
            name: self.name.trim_start_matches('/').to_string(),
            image: self.config.unwrap_or_default().image,
            state: state.status.clone(),
            status: state.status,
            started_at: parse_state_time(state.started_at.as_deref()),
            finished_at: parse_state_time(state.finished_at.as_deref()),
            mounts: self
                .mounts
                .into_iter()
                .filter_map(WireMount::into_oracle)
                .collect(),
            id: self.id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireEvent {
    #[serde(rename = "Type", default)]
    kind: String,
    #[serde(rename = "Action", default)]
    action: String,
    #[serde(rename = "Actor", default)]
    actor: Option<WireActor>,
    #[serde(rename = "time", default)]
    time: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct WireActor {
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(rename = "Attributes", default)]
    attributes: HashMap<String, String>,
}

fn map_event(event: WireEvent) -> Option<HostEvent> {
    let kind = match (event.kind.as_str(), event.action.as_str()) {
        ("volume", "create") => HostEventKind::VolumeCreate,
        ("volume", "destroy") => HostEventKind::VolumeDestroy,
        ("volume", "mount") => HostEventKind::VolumeMount,
        ("volume", "unmount") => HostEventKind::VolumeUnmount,
        ("container", "create") => HostEventKind::ContainerCreate,
        ("container", "start") => HostEventKind::ContainerStart,
        ("container", "die") => HostEventKind::ContainerDie,
        ("container", "stop") => HostEventKind::ContainerStop,
        ("container", "destroy") => HostEventKind::ContainerDestroy,
        _ => return None,
    };
    let actor = event.actor.unwrap_or_default();
    let timestamp = event
        .time
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .unwrap_or_else(Utc::now);
    Some(HostEvent {
        kind,
        actor_id: actor.id,
        attributes: actor.attributes,
        timestamp,
    })
}

#[async_trait]
impl VolumeOracle for DockerOracle {
    async fn ping(&self) -> VolumeResult<()> {
        let response = self
            .client
            .get(self.url("/_ping"))
            .send()
            .await
            .map_err(unavailable)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(unavailable(format!("ping returned {}", response.status())))
        }
    }

    async fn list_volumes(&self) -> VolumeResult<Vec<OracleVolume>> {
        let body: VolumeListBody = self.get_json("/volumes").await?;
        Ok(body
            .volumes
            .unwrap_or_default()
            .into_iter()
            .map(WireVolume::into_oracle)
            .collect())
    }

    async fn get_volume(&self, name: &str) -> VolumeResult<Option<OracleVolume>> {
        let response = self
            .client
            .get(self.url(&format!("/volumes/{name}")))
            .send()
            .await
            .map_err(unavailable)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(unavailable(format!(
                "volume inspect returned {}",
                response.status()
            )));
        }
        let wire: WireVolume = response.json().await.map_err(unavailable)?;
        Ok(Some(wire.into_oracle()))
    }

    async fn list_containers(&self) -> VolumeResult<Vec<OracleContainer>> {
        let wire: Vec<WireContainerSummary> = self.get_json("/containers/json?all=true").await?;
        Ok(wire
            .into_iter()
            .map(WireContainerSummary::into_oracle)
            .collect())
    }

    async fn get_container(&self, id: &str) -> VolumeResult<Option<OracleContainer>> {
        let response = self
            .client
            .get(self.url(&format!("/containers/{id}/json")))
            .send()
            .await
            .map_err(unavailable)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(unavailable(format!(
                "container inspect returned {}",
                response.status()
            )));
        }
        let wire: WireContainerInspect = response.json().await.map_err(unavailable)?;
        Ok(Some(wire.into_oracle()))
    }

    async fn get_volume_containers(&self, name: &str) -> VolumeResult<Vec<OracleContainer>> {
        let containers = self.list_containers().await?;
        Ok(containers
            .into_iter()
            .filter(|c| c.mounts.iter().any(|m| m.volume_name == name))
            .collect())
    }

    async fn stream_events(&self, cancel: CancellationToken) -> VolumeResult<EventStream> {
        let filters = r#"{"type":["volume","container"]}"#;
        let response = self
            .client
            .get(self.url("/events"))
            .query(&[("filters", filters)])
            .send()
            .await
            .map_err(unavailable)?;
        if !response.status().is_success() {
            return Err(unavailable(format!(
                "event stream returned {}",
                response.status()
            )));
        }

        let mut body = response.bytes_stream();
        let stream = async_stream::stream! {
            let mut buffer = Vec::new();
            loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("event stream canceled");
                        break;
                    }
                    chunk = body.next() => chunk,
                };
                let chunk = match chunk {
                    Some(Ok(chunk)) => chunk,
                    Some(Err(err)) => {
                        yield Err(unavailable(err));
                        break;
                    }
                    None => break,
                };
                buffer.extend_from_slice(&chunk);
                // the engine emits newline-delimited JSON objects
                while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line);
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<WireEvent>(line) {
                        Ok(wire) => {
                            if let Some(event) = map_event(wire) {
                                yield Ok(event);
                            }
                        }
                        Err(err) => {
                            warn!(error = %err, "dropping unparseable host event");
                        }
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}
