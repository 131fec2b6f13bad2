use thiserror::Error;

/// The error taxonomy shared by the bus, the bridges, and the kernel.
///
/// Component-local error enums (e.g. a storage module's own I/O error
/// type) convert into this one at the boundary where they cross into
/// kernel or service code.
#[derive(Debug, Error)]
pub enum KeyopError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("storage I/O: {0}")]
    StorageIo(#[from] std::io::Error),

    #[error("storage corrupt: {0}")]
    StorageCorrupt(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("transient: {0}")]
    Transient(String),

    #[error("handler failed: {0}")]
    HandlerFailed(String),

    #[error("ack timeout after {0:?}")]
    AckTimeout(std::time::Duration),

    #[error("fatal: {0}")]
    Fatal(String),
}

pub type KeyopResult<T> = Result<T, KeyopError>;

impl From<serde_json::Error> for KeyopError {
    fn from(e: serde_json::Error) -> Self {
        KeyopError::StorageCorrupt(e.to_string())
    }
}
