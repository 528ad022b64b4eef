//! The fast method: one invocation of GNU `du` reporting apparent size.

use std::path::Path;

use async_trait::async_trait;

use volumetry_model::{
    AccuracyClass, MethodDescriptor, PerformanceClass, SizeBasis, VolumeResult,
};

use super::external::{parse_leading_number, probe, run_sizer};
use super::{MethodOutput, ScanContext, Sizer};

const ARGS: &[&str] = &["-sb"];

/// `du -sb` gives a single logical-byte total in one pass. GNU-only; the
/// probe fails on BSD userlands where `-b` is not understood.
#[derive(Debug, Clone, Default)]
pub struct FastSizer;

impl FastSizer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Sizer for FastSizer {
    fn name(&self) -> &'static str {
        "fast"
    }

    fn descriptor(&self) -> MethodDescriptor {
        MethodDescriptor {
            name: "fast".to_string(),
            performance: PerformanceClass::Fast,
            accuracy: AccuracyClass::Exact,
            basis: SizeBasis::Logical,
            reports_file_counts: false,
            available: false,
        }
    }

    async fn available(&self) -> bool {
        probe("du", ARGS).await
    }

    async fn scan(&self, path: &Path, ctx: &ScanContext) -> VolumeResult<MethodOutput> {
        let stdout = run_sizer(self.name(), "du", ARGS, path, ctx).await?;
        let total_bytes = parse_leading_number(self.name(), &stdout)?;
        Ok(MethodOutput {
            total_bytes,
            ..MethodOutput::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn measures_a_small_tree_when_available() {
        let sizer = FastSizer::new();
        if !sizer.available().await {
            // non-GNU userland; the engine would filter this method out
            return;
        }

        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("blob.bin")).unwrap();
        file.write_all(&[0u8; 512]).unwrap();
        drop(file);

        let ctx = ScanContext::new(CancellationToken::new());
        let output = sizer.scan(dir.path(), &ctx).await.unwrap();
        // du counts the directory entry itself too, so at least the file size
        assert!(output.total_bytes >= 512);
        assert_eq!(output.file_count, None);
    }

    #[tokio::test]
    async fn canceled_context_aborts_the_scan() {
        let sizer = FastSizer::new();
        if !sizer.available().await {
            return;
        }

        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let ctx = ScanContext::new(cancel);
        let result = sizer.scan(dir.path(), &ctx).await;
        assert!(matches!(
            result,
            Err(volumetry_model::VolumeError::ScanCanceled(_))
        ));
    }
}
