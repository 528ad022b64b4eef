use std::collections::HashMap;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// A storage volume as observed on the container host.
///
/// `name` is the stable natural key; everything else can change between
/// observations. Volumes are never deleted from the inventory, only marked
/// inactive when the host removes them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
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
    pub is_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_scanned_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn anonymous_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9a-f]{64}$").unwrap_or_else(|_| unreachable!()))
}

/// Host-generated anonymous volumes carry a 64-hex-char name.
pub fn is_anonymous_name(name: &str) -> bool {
    anonymous_name_re().is_match(name)
}

impl Volume {
    pub fn is_anonymous(&self) -> bool {
        is_anonymous_name(&self.name)
    }

    /// Bind mounts show up with a host path where a managed name would be.
    pub fn is_bind_mount(&self) -> bool {
        is_bind_mount_name(&self.name)
    }

    /// A volume is a system volume when its name matches the configured
    /// pattern, or when it is anonymous.
    pub fn is_system(&self, system_pattern: Option<&Regex>) -> bool {
        if self.is_anonymous() {
            return true;
        }
        system_pattern.is_some_and(|re| re.is_match(&self.name))
    }
}

/// Heuristic shared with the scheduler's admission filter: managed volume
/// names never contain a path separator.
pub fn is_bind_mount_name(name: &str) -> bool {
    name.contains('/') || name.contains('\\')
}

/// Volume row shape returned by the listing API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeSummary {
    pub name: String,
    pub driver: String,
    pub created_at: DateTime<Utc>,
    pub mountpoint: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<i64>,
    pub attachments_count: i64,
    pub is_system: bool,
    pub is_orphaned: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_scanned_at: Option<DateTime<Utc>>,
}
