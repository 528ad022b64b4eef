//! Core subsystems of the volumetry service: the scan engine, the periodic
//! scheduler, the host-event reconciler, persistence, and the realtime bus.
//!
//! Everything here is wired together by the server's composition root; the
//! only process-wide mutable resources are the result cache, the scheduler
//! queue, the engine's scan semaphore, and the persistence pool.

pub mod bus;
pub mod cache;
pub mod engine;
pub mod methods;
pub mod metrics;
pub mod oracle;
pub mod reconciler;
pub mod scheduler;
pub mod store;

pub use bus::EventBus;
pub use cache::{Fingerprint, ScanCache};
pub use engine::{BulkOutcome, EngineConfig, ScanEngine};
pub use metrics::Metrics;
pub use oracle::{OracleContainer, OracleMount, OracleVolume, VolumeOracle};
pub use reconciler::{Reconciler, ReconcilerConfig, ReconcilerHealth};
pub use scheduler::{BatchResult, ScanTask, Scheduler, SchedulerConfig, SchedulerStatus};
pub use store::VolumeStore;

pub use volumetry_model::{VolumeError, VolumeResult};
