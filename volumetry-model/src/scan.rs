use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of one attempted measurement. Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl ScanStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScanStatus::Completed | ScanStatus::Failed | ScanStatus::Canceled
        )
    }

    /// Legal transitions: queued → running | canceled,
    /// running → completed | failed | canceled.
    pub fn can_transition_to(&self, next: ScanStatus) -> bool {
        match self {
            ScanStatus::Queued => matches!(next, ScanStatus::Running | ScanStatus::Canceled),
            ScanStatus::Running => matches!(
                next,
                ScanStatus::Completed | ScanStatus::Failed | ScanStatus::Canceled
            ),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Queued => "queued",
            ScanStatus::Running => "running",
            ScanStatus::Completed => "completed",
            ScanStatus::Failed => "failed",
            ScanStatus::Canceled => "canceled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(ScanStatus::Queued),
            "running" => Some(ScanStatus::Running),
            "completed" => Some(ScanStatus::Completed),
            "failed" => Some(ScanStatus::Failed),
            "canceled" => Some(ScanStatus::Canceled),
            _ => None,
        }
    }
}

/// One attempted measurement of a volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRun {
    pub scan_id: Uuid,
    pub volume_name: String,
    pub method: String,
    pub status: ScanStatus,
    /// Percent complete, 0..=100.
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl ScanRun {
    pub fn queued(volume_name: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            scan_id: Uuid::new_v4(),
            volume_name: volume_name.into(),
            method: method.into(),
            status: ScanStatus::Queued,
            progress: 0,
            started_at: None,
            completed_at: None,
            error: None,
            result_ref: None,
            created_at: Utc::now(),
        }
    }
}

/// Whether a method measures logical file sizes or on-disk block usage.
/// A single history series must never mix the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeBasis {
    Logical,
    OnDisk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceClass {
    Fast,
    Medium,
    Slow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccuracyClass {
    Exact,
    Approximate,
}

/// Capability card for a sizing method, as exposed by `GET /scan-methods`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodDescriptor {
    pub name: String,
    pub performance: PerformanceClass,
    pub accuracy: AccuracyClass,
    pub basis: SizeBasis,
    pub reports_file_counts: bool,
    pub available: bool,
}

/// Options accepted by the scan entry points.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanOptions {
    #[serde(default)]
    pub force_refresh: bool,
    /// Overrides the configured method preference for this scan only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

/// The result of a successful measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizeReport {
    pub volume_name: String,
    /// Total size in bytes, on the basis declared by the method descriptor.
    pub total_size: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub largest_file: Option<i64>,
    pub method: String,
    pub basis: SizeBasis,
    pub scanned_at: DateTime<Utc>,
    pub duration_ms: i64,
    /// True when served from the result cache rather than a fresh measurement.
    pub cached: bool,
}

/// Append-only history row written once per successful scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizeSample {
    pub id: Uuid,
    pub volume_name: String,
    pub ts: DateTime<Utc>,
    pub size_bytes: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub largest_file: Option<i64>,
    pub method: String,
    pub duration_ms: i64,
}

/// One point of the aggregated size trend across a set of volumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendPoint {
    pub date: chrono::NaiveDate,
    pub total_bytes: i64,
    pub sample_count: i64,
}

impl SizeSample {
    pub fn from_report(report: &SizeReport) -> Self {
        Self {
            id: Uuid::new_v4(),
            volume_name: report.volume_name.clone(),
            ts: report.scanned_at,
            size_bytes: report.total_size,
            file_count: report.file_count,
            dir_count: report.directory_count,
            largest_file: report.largest_file,
            method: report.method.clone(),
            duration_ms: report.duration_ms,
        }
    }
}
