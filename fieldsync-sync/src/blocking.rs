use crate::error::{SyncError, SyncResult};
use fieldsync_storage::{LocalStore, StorageResult};

/// Runs a store call on the blocking pool so DuckDB I/O stays off the async workers.
pub(crate) async fn with_store<T, F>(store: &LocalStore, f: F) -> SyncResult<T>
where
    F: FnOnce(&LocalStore) -> StorageResult<T> + Send + 'static,
    T: Send + 'static,
{
    let store = store.clone();
    match tokio::task::spawn_blocking(move || f(&store)).await {
        Ok(result) => result.map_err(SyncError::from),
        Err(e) => Err(SyncError::Task(e.to_string())),
    }
}
