use thiserror::Error;

/// Error taxonomy shared by every component. Variants carry owned strings so
/// the whole enum stays `Clone` — single-flight waiters all receive the owner
/// outcome by value.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VolumeError {
    #[error("volume not found: {0}")]
    VolumeNotFound(String),

    #[error("scan not found: {0}")]
    ScanNotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("no scan method available")]
    AllMethodsFailed,

    #[error("scan timed out for volume {volume} after {seconds}s")]
    ScanTimeout { volume: String, seconds: u64 },

    #[error("scan canceled for volume {0}")]
    ScanCanceled(String),

    #[error("scan method unavailable: {0}")]
    MethodUnavailable(String),

    #[error("scan method {method} failed: {message}")]
    MethodFailed { method: String, message: String },

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("scan queue full")]
    QueueFull,

    #[error("persistence unavailable: {0}")]
    PersistenceUnavailable(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("failed to persist scan result: {0}")]
    ResultPersistFailed(String),

    #[error("host oracle unavailable: {0}")]
    OracleUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl VolumeError {
    /// Stable machine-readable code, used in scan_error frames, ScanRun
    /// error fields, and HTTP bodies.
    pub fn code(&self) -> &'static str {
        match self {
            VolumeError::VolumeNotFound(_) => "volume_not_found",
            VolumeError::ScanNotFound(_) => "scan_not_found",
            VolumeError::PermissionDenied(_) => "permission_denied",
            VolumeError::AllMethodsFailed => "all_methods_failed",
            VolumeError::ScanTimeout { .. } => "scan_timeout",
            VolumeError::ScanCanceled(_) => "scan_canceled",
            VolumeError::MethodUnavailable(_) => "method_unavailable",
            VolumeError::MethodFailed { .. } => "scan_failed",
            VolumeError::RateLimited { .. } => "rate_limited",
            VolumeError::QueueFull => "queue_full",
            VolumeError::PersistenceUnavailable(_) => "persistence_unavailable",
            VolumeError::Storage(_) => "persistence_unavailable",
            VolumeError::ResultPersistFailed(_) => "result_persist_failed",
            VolumeError::OracleUnavailable(_) => "host_oracle_unavailable",
            VolumeError::Internal(_) => "internal",
        }
    }

    /// HTTP status the API layer maps this error to.
    pub fn http_status(&self) -> u16 {
        match self {
            VolumeError::VolumeNotFound(_) | VolumeError::ScanNotFound(_) => 404,
            VolumeError::PermissionDenied(_) => 403,
            VolumeError::AllMethodsFailed => 500,
            VolumeError::ScanTimeout { .. } | VolumeError::ScanCanceled(_) => 408,
            VolumeError::MethodUnavailable(_) => 400,
            VolumeError::MethodFailed { .. } => 500,
            VolumeError::RateLimited { .. } => 429,
            VolumeError::QueueFull => 503,
            VolumeError::PersistenceUnavailable(_) | VolumeError::Storage(_) => 503,
            VolumeError::ResultPersistFailed(_) => 500,
            VolumeError::OracleUnavailable(_) => 503,
            VolumeError::Internal(_) => 500,
        }
    }
}

pub type VolumeResult<T> = std::result::Result<T, VolumeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_the_wire_contract() {
        assert_eq!(
            VolumeError::ScanTimeout {
                volume: "data".into(),
                seconds: 300
            }
            .code(),
            "scan_timeout"
        );
        assert_eq!(VolumeError::QueueFull.code(), "queue_full");
        assert_eq!(
            VolumeError::RateLimited { retry_after_secs: 30 }.code(),
            "rate_limited"
        );
    }

    #[test]
    fn status_mapping_follows_the_taxonomy() {
        assert_eq!(VolumeError::VolumeNotFound("x".into()).http_status(), 404);
        assert_eq!(VolumeError::PermissionDenied("x".into()).http_status(), 403);
        assert_eq!(VolumeError::QueueFull.http_status(), 503);
        assert_eq!(
            VolumeError::RateLimited { retry_after_secs: 5 }.http_status(),
            429
        );
        assert_eq!(VolumeError::ScanCanceled("x".into()).http_status(), 408);
    }
}
