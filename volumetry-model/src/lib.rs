//! Core data model definitions shared across volumetry crates.

pub mod container;
pub mod error;
pub mod events;
pub mod filter;
pub mod scan;
pub mod volume;

pub use container::{AccessMode, Container, Mount, VolumeAttachment};
pub use error::{VolumeError, VolumeResult};
pub use events::{BusMessage, HostEvent, HostEventKind, ScanProgressUpdate};
pub use filter::{Page, SortField, VolumeFilters, VolumeSort};
pub use scan::{
    AccuracyClass, MethodDescriptor, PerformanceClass, ScanOptions, ScanRun, ScanStatus,
    SizeBasis, SizeReport, SizeSample, TrendPoint,
};
pub use volume::{Volume, VolumeSummary};
