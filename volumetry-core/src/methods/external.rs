//! Shared plumbing for methods that shell out to an external sizer.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

use volumetry_model::{VolumeError, VolumeResult};

use super::ScanContext;

/// Run an external sizer and capture its stdout. The child is killed when
/// the scan is canceled; `kill_on_drop` bounds teardown well inside the 2s
/// grace window.
pub(super) async fn run_sizer(
    method: &'static str,
    program: &str,
    args: &[&str],
    path: &Path,
    ctx: &ScanContext,
) -> VolumeResult<String> {
    let mut command = Command::new(program);
    command
        .args(args)
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command.spawn().map_err(|err| VolumeError::MethodFailed {
        method: method.to_string(),
        message: format!("failed to spawn {program}: {err}"),
    })?;

    let output = tokio::select! {
        output = child.wait_with_output() => output,
        _ = ctx.cancel.cancelled() => {
            debug!(method, path = %path.display(), "external sizer canceled");
            return Err(VolumeError::ScanCanceled(path.display().to_string()));
        }
    };

    let output = output.map_err(|err| VolumeError::MethodFailed {
        method: method.to_string(),
        message: format!("{program} did not complete: {err}"),
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        if stderr.to_ascii_lowercase().contains("permission denied") {
            return Err(VolumeError::PermissionDenied(path.display().to_string()));
        }
        return Err(VolumeError::MethodFailed {
            method: method.to_string(),
            message: format!("{program} exited with {}: {stderr}", output.status),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parse the leading numeric field of a `du`-style report line.
pub(super) fn parse_leading_number(method: &'static str, stdout: &str) -> VolumeResult<i64> {
    stdout
        .split_whitespace()
        .next()
        .and_then(|field| field.parse::<i64>().ok())
        .ok_or_else(|| VolumeError::MethodFailed {
            method: method.to_string(),
            message: format!("unparseable sizer output: {:?}", stdout.trim()),
        })
}

/// Probe an external sizer by pointing it at a path that always exists and
/// is free to measure.
pub(super) async fn probe(program: &str, args: &[&str]) -> bool {
    let probe_target = if cfg!(unix) { "/dev/null" } else { "." };
    let status = Command::new(program)
        .args(args)
        .arg(probe_target)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status()
        .await;
    matches!(status, Ok(status) if status.success())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_byte_totals() {
        assert_eq!(parse_leading_number("fast", "600\t/data\n").unwrap(), 600);
        assert_eq!(parse_leading_number("fast", "0 /empty").unwrap(), 0);
    }

    #[test]
    fn rejects_garbage_output() {
        assert!(parse_leading_number("fast", "").is_err());
        assert!(parse_leading_number("fast", "du: cannot read").is_err());
    }
}
