use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::volume::VolumeSummary;

/// Lifecycle event emitted by the host volume oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostEventKind {
    VolumeCreate,
    VolumeDestroy,
    VolumeMount,
    VolumeUnmount,
    ContainerCreate,
    ContainerStart,
    ContainerDie,
    ContainerStop,
    ContainerDestroy,
}

impl HostEventKind {
    pub fn is_volume_event(&self) -> bool {
        matches!(
            self,
            HostEventKind::VolumeCreate
                | HostEventKind::VolumeDestroy
                | HostEventKind::VolumeMount
                | HostEventKind::VolumeUnmount
        )
    }
}

/// A typed host event. `actor_id` is the volume name for volume events and
/// the container id for container events; mount events carry the peer entity
/// and mount path in `attributes` ("container", "destination", "read/write").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostEvent {
    pub kind: HostEventKind,
    pub actor_id: String,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl HostEvent {
    pub fn new(kind: HostEventKind, actor_id: impl Into<String>) -> Self {
        Self {
            kind,
            actor_id: actor_id.into(),
            attributes: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Progress sample for an in-flight scan, both stored against the run and
/// fanned out on the realtime bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanProgressUpdate {
    pub scan_id: Uuid,
    pub volume_name: String,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files_processed: Option<i64>,
}

/// Wire frames for the realtime bus. Every frame serializes as
/// `{type, data?, volume_id?, timestamp}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMessage {
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },
    Pong {
        timestamp: DateTime<Utc>,
    },
    VolumeUpdate {
        data: Vec<VolumeSummary>,
        timestamp: DateTime<Utc>,
    },
    ScanProgress {
        volume_id: String,
        data: ScanProgressUpdate,
        timestamp: DateTime<Utc>,
    },
    ScanComplete {
        volume_id: String,
        data: ScanCompletePayload,
        timestamp: DateTime<Utc>,
    },
    ScanError {
        volume_id: String,
        data: ScanErrorPayload,
        timestamp: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanCompletePayload {
    pub result: crate::scan::SizeReport,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanErrorPayload {
    pub error: String,
    pub code: String,
}

impl BusMessage {
    pub fn pong() -> Self {
        BusMessage::Pong {
            timestamp: Utc::now(),
        }
    }

    pub fn volume_update(data: Vec<VolumeSummary>) -> Self {
        BusMessage::VolumeUpdate {
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn scan_progress(update: ScanProgressUpdate) -> Self {
        BusMessage::ScanProgress {
            volume_id: update.volume_name.clone(),
            data: update,
            timestamp: Utc::now(),
        }
    }

    pub fn scan_complete(volume_id: impl Into<String>, result: crate::scan::SizeReport) -> Self {
        BusMessage::ScanComplete {
            volume_id: volume_id.into(),
            data: ScanCompletePayload { result },
            timestamp: Utc::now(),
        }
    }

    pub fn scan_error(
        volume_id: impl Into<String>,
        code: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        BusMessage::ScanError {
            volume_id: volume_id.into(),
            data: ScanErrorPayload {
                error: error.into(),
                code: code.into(),
            },
            timestamp: Utc::now(),
        }
    }
}
