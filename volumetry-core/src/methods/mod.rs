//! Pluggable directory sizers.
//!
//! A method is a value behind the [`Sizer`] trait: probe it once at startup,
//! then dispatch by name at scan time. Adding a method is additive; nothing
//! here knows about the engine's preference policy.

use std::path::Path;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use volumetry_model::{MethodDescriptor, VolumeResult};

mod external;
mod fast;
mod native;
mod portable;

pub use fast::FastSizer;
pub use native::NativeSizer;
pub use portable::PortableSizer;

/// How long a canceled method may take to tear down its work.
pub const CANCEL_GRACE: std::time::Duration = std::time::Duration::from_secs(2);

/// Raw measurement from one method invocation. Sizes are bytes on the basis
/// declared by the method's descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MethodOutput {
    pub total_bytes: i64,
    pub file_count: Option<i64>,
    pub dir_count: Option<i64>,
    pub largest_file: Option<i64>,
}

/// In-flight progress sample pushed by methods that can observe their own
/// position (currently only the native walker).
#[derive(Debug, Clone, PartialEq)]
pub struct MethodProgress {
    pub current_path: Option<String>,
    pub files_processed: i64,
    pub bytes_so_far: i64,
}

/// Per-invocation context threaded into every method.
#[derive(Debug, Clone)]
pub struct ScanContext {
    pub cancel: CancellationToken,
    pub progress: Option<mpsc::Sender<MethodProgress>>,
}

impl ScanContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            progress: None,
        }
    }

    pub fn with_progress(mut self, tx: mpsc::Sender<MethodProgress>) -> Self {
        self.progress = Some(tx);
        self
    }

    fn report(&self, progress: MethodProgress) {
        if let Some(tx) = &self.progress {
            // drop samples rather than stall the walk
            let _ = tx.try_send(progress);
        }
    }
}

#[async_trait]
pub trait Sizer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Capability card. `available` is a placeholder here; the engine fills
    /// it in from the startup probe.
    fn descriptor(&self) -> MethodDescriptor;

    /// Capability probe, run once at startup.
    async fn available(&self) -> bool;

    /// Measure the directory at `path`. Must observe `ctx.cancel` within
    /// [`CANCEL_GRACE`] and return a `scan_canceled` outcome.
    async fn scan(&self, path: &Path, ctx: &ScanContext) -> VolumeResult<MethodOutput>;
}

/// All built-in sizers, in no particular order; the engine orders them by
/// the configured preference.
pub fn builtin_sizers() -> Vec<std::sync::Arc<dyn Sizer>> {
    vec![
        std::sync::Arc::new(FastSizer::new()),
        std::sync::Arc::new(PortableSizer::new()),
        std::sync::Arc::new(NativeSizer::new()),
    ]
}
