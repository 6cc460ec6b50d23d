//! Sync error types.

use crate::remote::RemoteError;
use fieldsync_storage::StorageError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while syncing or writing through the repository.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("remote unreachable: {0}")]
    RemoteUnreachable(String),

    #[error("remote rejected the operation: {0}")]
    RemoteRejected(String),

    #[error("no authenticated session")]
    NoSession,

    #[error("orchestrator is not running")]
    ChannelClosed,

    #[error("background task failed: {0}")]
    Task(String),
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Unreachable(msg) => SyncError::RemoteUnreachable(msg),
            RemoteError::Rejected(msg) => SyncError::RemoteRejected(msg),
        }
    }
}

impl SyncError {
    /// Storage failures mean the local data may be stale; the UI should show
    /// a degraded indicator rather than a plain "offline".
    pub fn is_degraded(&self) -> bool {
        matches!(self, SyncError::Storage(_) | SyncError::Task(_))
    }

    /// Transient failures are retried on the next triggered cycle.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::RemoteUnreachable(_))
    }
}
