use bridge_traits::BridgeError;
use core_metadata::MetadataError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    /// Malformed intent; dropped without retry
    #[error("Invalid {field}: {message}")]
    Validation { field: String, message: String },

    /// Concurrent writers or a stale remote revision
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Metadata store error: {0}")]
    Store(#[from] MetadataError),

    #[error("Transient IO error: {0}")]
    TransientIo(String),

    #[error("No more disk space: {0}")]
    DiskFull(String),

    #[error("Authentication rejected: {0}")]
    Auth(String),

    #[error("Remote storage is full: {0}")]
    QuotaExceeded(String),

    #[error("Abandoned {path} after {errors} failed attempts")]
    Poison { path: String, errors: u32 },

    #[error("Invalid move from {from} to {to}")]
    InvalidMove { from: String, to: String },

    #[error("Checksum mismatch on {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("Bridge error: {0}")]
    Bridge(BridgeError),

    #[error("Remote change feed failed: {0}")]
    FeedFailed(String),

    #[error("Sync cancelled")]
    Cancelled,

    #[error(transparent)]
    Config(#[from] core_runtime::Error),
}

impl SyncError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Conditions that cannot heal by retrying and stop the engine
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::DiskFull(_)
                | SyncError::Auth(_)
                | SyncError::QuotaExceeded(_)
                | SyncError::FeedFailed(_)
        )
    }

    pub fn is_unreachable(&self) -> bool {
        matches!(self, SyncError::TransientIo(_))
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            SyncError::Bridge(err) => err.is_not_found(),
            _ => false,
        }
    }
}

impl From<BridgeError> for SyncError {
    fn from(err: BridgeError) -> Self {
        if err.is_disk_full() {
            return SyncError::DiskFull(err.to_string());
        }
        match err {
            BridgeError::Unauthorized(msg) => SyncError::Auth(msg),
            BridgeError::QuotaExceeded(msg) => SyncError::QuotaExceeded(msg),
            BridgeError::Unreachable(msg) => SyncError::TransientIo(msg),
            BridgeError::Conflict(msg) => SyncError::Conflict(msg),
            other => SyncError::Bridge(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bridge_classification() {
        assert!(SyncError::from(BridgeError::Unauthorized("revoked".into())).is_fatal());
        assert!(SyncError::from(BridgeError::QuotaExceeded("full".into())).is_fatal());
        assert!(SyncError::from(BridgeError::Unreachable("down".into())).is_unreachable());
        assert!(matches!(
            SyncError::from(BridgeError::Conflict("id".into())),
            SyncError::Conflict(_)
        ));

        let missing = SyncError::from(BridgeError::NotFound("x".into()));
        assert!(missing.is_not_found());
        assert!(!missing.is_fatal());
    }

    #[cfg(unix)]
    #[test]
    fn test_disk_full_is_fatal() {
        let err = SyncError::from(BridgeError::Io(std::io::Error::from_raw_os_error(28)));
        assert!(matches!(err, SyncError::DiskFull(_)));
        assert!(err.is_fatal());
    }
}
