//! Storage error types.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur in the local store.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The storage medium failed (device full, file corruption, I/O error).
    /// Callers must surface this rather than swallow it.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("migration to schema version {version} failed: {reason}")]
    MigrationFailed { version: u32, reason: String },

    #[error("entity not found: {0}")]
    NotFound(String),

    #[error("server id already assigned for entity {entity_id}: {existing}")]
    ServerIdAlreadyAssigned { entity_id: String, existing: String },

    #[error("invalid stored data: {0}")]
    InvalidData(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<duckdb::Error> for StorageError {
    fn from(err: duckdb::Error) -> Self {
        StorageError::Unavailable(err.to_string())
    }
}

impl StorageError {
    /// Returns true for failures of the underlying medium.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }
}
