use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A container observed on the host. Containers come and go quickly; rows are
/// deactivated rather than deleted so mount history stays resolvable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    Rw,
    Ro,
}

impl AccessMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessMode::Rw => "rw",
            AccessMode::Ro => "ro",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "ro" => AccessMode::Ro,
            _ => AccessMode::Rw,
        }
    }
}

/// Join row between a volume and a container. The natural key is
/// `(volume_name, container_id, mount_path)`; a row is active only while both
/// referenced entities are active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mount {
    pub volume_name: String,
    pub container_id: String,
    pub mount_path: String,
    pub access_mode: AccessMode,
    pub is_active: bool,
}

/// Attachment row shape returned by the volume detail API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeAttachment {
    pub container_id: String,
    pub container_name: String,
    pub mount_path: String,
    pub rw: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_mode_round_trips_through_str() {
        assert_eq!(AccessMode::parse("ro"), AccessMode::Ro);
        assert_eq!(AccessMode::parse("rw"), AccessMode::Rw);
        // unknown values default to rw, matching host API behaviour
        assert_eq!(AccessMode::parse("z"), AccessMode::Rw);
        assert_eq!(AccessMode::Ro.as_str(), "ro");
    }
}
