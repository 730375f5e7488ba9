//! Service-level errors.

use crate::collector::CollectorError;
use crate::config::ConfigError;
use crate::store::StoreError;

/// Errors surfaced by [`crate::service::CaptureService`].
#[derive(Debug)]
pub enum CaptureError {
    /// The adapter cannot observe input. Fatal at startup.
    PermissionDenied,
    /// The writer exhausted its retries.
    StoreUnavailable(StoreError),
    /// A session invariant did not hold and could not be corrected.
    InvariantViolation(String),
    Collector(CollectorError),
    Config(ConfigError),
    Store(StoreError),
    /// A pipeline thread panicked.
    WorkerPanicked(&'static str),
}

impl std::fmt::Display for CaptureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureError::PermissionDenied => {
                write!(f, "Input monitoring permission not granted")
            }
            CaptureError::StoreUnavailable(e) => write!(f, "Store unavailable: {e}"),
            CaptureError::InvariantViolation(msg) => write!(f, "Invariant violation: {msg}"),
            CaptureError::Collector(e) => write!(f, "Collector error: {e}"),
            CaptureError::Config(e) => write!(f, "Config error: {e}"),
            CaptureError::Store(e) => write!(f, "Store error: {e}"),
            CaptureError::WorkerPanicked(name) => write!(f, "{name} thread panicked"),
        }
    }
}

impl std::error::Error for CaptureError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CaptureError::StoreUnavailable(e) | CaptureError::Store(e) => Some(e),
            CaptureError::Collector(e) => Some(e),
            CaptureError::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CollectorError> for CaptureError {
    fn from(e: CollectorError) -> Self {
        match e {
            CollectorError::PermissionDenied => CaptureError::PermissionDenied,
            other => CaptureError::Collector(other),
        }
    }
}

impl From<ConfigError> for CaptureError {
    fn from(e: ConfigError) -> Self {
        CaptureError::Config(e)
    }
}

impl From<StoreError> for CaptureError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable { .. } => CaptureError::StoreUnavailable(e),
            other => CaptureError::Store(other),
        }
    }
}

impl From<std::io::Error> for CaptureError {
    fn from(e: std::io::Error) -> Self {
        CaptureError::Store(StoreError::Io(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_denied_maps_to_fatal_variant() {
        let err: CaptureError = CollectorError::PermissionDenied.into();
        assert!(matches!(err, CaptureError::PermissionDenied));

        let err: CaptureError = CollectorError::AlreadyRunning.into();
        assert!(matches!(err, CaptureError::Collector(_)));
    }

    #[test]
    fn test_unavailable_store_maps_to_store_unavailable() {
        let err: CaptureError = StoreError::Unavailable {
            attempts: 6,
            last: rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
                None,
            ),
        }
        .into();
        assert!(matches!(err, CaptureError::StoreUnavailable(_)));
        assert!(err.to_string().contains("Store unavailable"));
    }
}
