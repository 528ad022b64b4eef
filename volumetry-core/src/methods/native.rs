//! The native method: an in-process directory walker.
//!
//! Slower than shelling out, but the only method that can report file and
//! directory counts, the largest file, and live progress.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use volumetry_model::{
    AccuracyClass, MethodDescriptor, PerformanceClass, SizeBasis, VolumeError, VolumeResult,
};

use super::{MethodOutput, MethodProgress, ScanContext, Sizer};

/// Emit a progress sample every this many files.
const PROGRESS_EVERY_FILES: i64 = 256;

#[derive(Debug, Clone, Default)]
pub struct NativeSizer;

impl NativeSizer {
    pub fn new() -> Self {
        Self
    }
}

fn classify_root_error(path: &Path, err: std::io::Error) -> VolumeError {
    match err.kind() {
        std::io::ErrorKind::PermissionDenied => {
            VolumeError::PermissionDenied(path.display().to_string())
        }
        std::io::ErrorKind::NotFound => VolumeError::VolumeNotFound(path.display().to_string()),
        _ => VolumeError::MethodFailed {
            method: "native".to_string(),
            message: format!("cannot open {}: {err}", path.display()),
        },
    }
}

#[async_trait]
impl Sizer for NativeSizer {
    fn name(&self) -> &'static str {
        "native"
    }

    fn descriptor(&self) -> MethodDescriptor {
        MethodDescriptor {
            name: "native".to_string(),
            performance: PerformanceClass::Slow,
            accuracy: AccuracyClass::Exact,
            basis: SizeBasis::Logical,
            reports_file_counts: true,
            available: false,
        }
    }

    async fn available(&self) -> bool {
        // in-process walker has no external prerequisites
        true
    }

    async fn scan(&self, path: &Path, ctx: &ScanContext) -> VolumeResult<MethodOutput> {
        // fail fast on an unreadable root; unreadable subtrees are skipped
        let root = tokio::fs::read_dir(path)
            .await
            .map_err(|err| classify_root_error(path, err))?;

        let mut pending: Vec<PathBuf> = Vec::new();
        let mut current = Some(root);

        let mut total_bytes: i64 = 0;
        let mut file_count: i64 = 0;
        let mut dir_count: i64 = 1; // the root itself
        let mut largest_file: i64 = 0;
        let mut last_progress_at: i64 = 0;

        loop {
            let Some(reader) = current.as_mut() else {
                match pending.pop() {
                    Some(dir) => {
                        match tokio::fs::read_dir(&dir).await {
                            Ok(reader) => current = Some(reader),
                            Err(err) => {
                                debug!(path = %dir.display(), error = %err, "skipping unreadable directory");
                            }
                        }
                        continue;
                    }
                    None => break,
                }
            };

            if ctx.cancel.is_cancelled() {
                return Err(VolumeError::ScanCanceled(path.display().to_string()));
            }

            let entry = match reader.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    current = None;
                    continue;
                }
                Err(err) => {
                    debug!(error = %err, "directory iteration error, moving on");
                    current = None;
                    continue;
                }
            };

            // symlink_metadata semantics: never follow links, so volume
            // self-references cannot loop the walk
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(err) => {
                    debug!(path = %entry.path().display(), error = %err, "skipping unreadable entry");
                    continue;
                }
            };

            if metadata.is_dir() {
                dir_count += 1;
                pending.push(entry.path());
            } else if metadata.is_file() {
                let len = metadata.len() as i64;
                file_count += 1;
                total_bytes += len;
                largest_file = largest_file.max(len);

                if file_count - last_progress_at >= PROGRESS_EVERY_FILES {
                    last_progress_at = file_count;
                    ctx.report(MethodProgress {
                        current_path: Some(entry.path().display().to_string()),
                        files_processed: file_count,
                        bytes_so_far: total_bytes,
                    });
                }
            }
            // sockets, fifos, symlinks: present but not sized
        }

        Ok(MethodOutput {
            total_bytes,
            file_count: Some(file_count),
            dir_count: Some(dir_count),
            largest_file: Some(largest_file),
        })
    }
}
