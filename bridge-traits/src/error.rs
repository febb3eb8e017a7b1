use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Bridge capability not available: {0}")]
    NotAvailable(String),

    #[error("Bridge operation failed: {0}")]
    OperationFailed(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The caller's revision token is stale.
    #[error("Revision conflict on {0}")]
    Conflict(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Remote unreachable: {0}")]
    Unreachable(String),

    #[error("Remote storage is full: {0}")]
    QuotaExceeded(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(unix)]
const ENOSPC: i32 = 28;
#[cfg(windows)]
const ENOSPC: i32 = 112; // ERROR_DISK_FULL

impl BridgeError {
    /// True when the local disk has no space left.
    pub fn is_disk_full(&self) -> bool {
        match self {
            #[cfg(any(unix, windows))]
            BridgeError::Io(err) => err.raw_os_error() == Some(ENOSPC),
            _ => false,
        }
    }

    /// True for an IO error of kind `NotFound` as well as the explicit variant.
    pub fn is_not_found(&self) -> bool {
        match self {
            BridgeError::NotFound(_) => true,
            BridgeError::Io(err) => err.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
