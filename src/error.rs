//! Closed error taxonomy for the broker.
//!
//! Parsing and backpressure errors never escape the runtime — they are
//! downgraded to `raw` blocks or `BackpressureDropped` frames internally.
//! Everything else here is a `BrokerError` a caller can match on.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("adapter for tool {0:?} is not installed")]
    AdapterUnavailable(String),

    #[error("failed to spawn child process: {0}")]
    ChildSpawnFailed(String),

    #[error("child process exited abnormally: {0}")]
    ChildCrashed(String),

    #[error("storage operation failed: {0}")]
    StorageError(String),

    #[error("subscriber buffer overflowed and was dropped")]
    Backpressure,

    #[error("operation requires a successful auth handshake")]
    AuthRequired,

    #[error("conversation {0:?} not found")]
    NotFound(String),

    #[error("operation not permitted in current state: {0}")]
    InvalidState(String),

    #[error("store was called before init()")]
    FailedPrecondition,
}

pub type BrokerResult<T> = Result<T, BrokerError>;

impl From<rusqlite::Error> for BrokerError {
    fn from(err: rusqlite::Error) -> Self {
        BrokerError::StorageError(err.to_string())
    }
}

impl From<std::io::Error> for BrokerError {
    fn from(err: std::io::Error) -> Self {
        BrokerError::ChildSpawnFailed(err.to_string())
    }
}
