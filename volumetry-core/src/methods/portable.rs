//! The portable method: POSIX `du -sk`, block-based kilobytes.

use std::path::Path;

use async_trait::async_trait;

use volumetry_model::{
    AccuracyClass, MethodDescriptor, PerformanceClass, SizeBasis, VolumeResult,
};

use super::external::{parse_leading_number, probe, run_sizer};
use super::{MethodOutput, ScanContext, Sizer};

const ARGS: &[&str] = &["-sk"];

/// `du -sk` works on any POSIX userland but reports allocated 1K blocks,
/// not logical bytes; the descriptor declares the on-disk basis so history
/// series never silently mix the two.
#[derive(Debug, Clone, Default)]
pub struct PortableSizer;

impl PortableSizer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Sizer for PortableSizer {
    fn name(&self) -> &'static str {
        "portable"
    }

    fn descriptor(&self) -> MethodDescriptor {
        MethodDescriptor {
            name: "portable".to_string(),
            performance: PerformanceClass::Medium,
            accuracy: AccuracyClass::Approximate,
            basis: SizeBasis::OnDisk,
            reports_file_counts: false,
            available: false,
        }
    }

    async fn available(&self) -> bool {
        probe("du", ARGS).await
    }

    async fn scan(&self, path: &Path, ctx: &ScanContext) -> VolumeResult<MethodOutput> {
        let stdout = run_sizer(self.name(), "du", ARGS, path, ctx).await?;
        let kilobytes = parse_leading_number(self.name(), &stdout)?;
        Ok(MethodOutput {
            total_bytes: kilobytes.saturating_mul(1024),
            ..MethodOutput::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn reports_block_sizes_in_bytes() {
        let sizer = PortableSizer::new();
        if !sizer.available().await {
            return;
        }

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("blob.bin"), [0u8; 2048]).unwrap();

        let ctx = ScanContext::new(CancellationToken::new());
        let output = sizer.scan(dir.path(), &ctx).await.unwrap();
        // block-granular, so a multiple of 1024 and at least one block
        assert!(output.total_bytes >= 1024);
        assert_eq!(output.total_bytes % 1024, 0);
    }
}
