//! DuckDB local store for FieldSync.
//!
//! The store is the single source of truth on the device. Everything the
//! sync layer needs to survive a restart lives here:
//!
//! - Entities as opaque JSON payloads plus their sync state
//! - The outbox of locally-originated mutations, ordered by sequence
//! - Conflicts recorded during merge, awaiting external resolution
//! - A key/value metadata table (schema version, reset marker, last sync)
//!
//! Schema migrations run on open. A store that cannot be migrated is reset
//! to an empty store at the current schema version rather than left half
//! migrated.

mod config;
mod error;
mod local_store;
mod outbox_rows;
mod remote_apply;
pub mod schema;

pub use config::StoreConfig;
pub use error::{StorageError, StorageResult};
pub use local_store::{EntityFilter, LocalStore, SyncCounts};
pub use outbox_rows::Acknowledgment;
pub use remote_apply::{ConflictRecord, MergeOutcome};
pub use schema::{CURRENT_SCHEMA_VERSION, Migration, Schema};

use std::path::{Path, PathBuf};
use tracing::{error, warn};

/// Well-known metadata keys.
pub mod metadata_keys {
    /// Schema version of the on-disk layout.
    pub const SCHEMA_VERSION: &str = "schema_version";
    /// Marker of the last one-shot reset that was applied.
    pub const RESET_APPLIED: &str = "reset_applied";
    /// RFC 3339 timestamp of the newest remote change merged so far.
    pub const LAST_SYNC_AT: &str = "last_sync_at";
}

/// Open a DuckDB connection with stale WAL recovery and resource limits.
///
/// If the initial open fails and a `.wal` file exists alongside the database,
/// the WAL is moved aside (see [`set_aside_wal`]) and the open is retried
/// once. An unclean shutdown on a phone (process killed, battery pulled) can
/// leave a WAL that prevents reopening. Writes only in that WAL are not in the
/// reopened store; the moved file keeps them for manual recovery.
pub fn open_duckdb_with_wal_recovery(
    path: &Path,
    memory_limit: &str,
    threads: u32,
) -> StorageResult<duckdb::Connection> {
    let conn = match duckdb::Connection::open(path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!("[STORE] open failed: {first_err}");
            let Some(aside) = set_aside_wal(path)? else {
                return Err(first_err.into());
            };
            error!(
                "[STORE] uncheckpointed writes moved to {} and are not in the reopened store",
                aside.display()
            );
            duckdb::Connection::open(path)?
        }
    };
    apply_resource_limits(&conn, memory_limit, threads)?;
    Ok(conn)
}

/// Path of the write-ahead log DuckDB keeps next to `path`.
pub fn wal_path(path: &Path) -> PathBuf {
    path.with_extension(
        path.extension()
            .map(|ext| format!("{}.wal", ext.to_string_lossy()))
            .unwrap_or_else(|| "wal".to_string()),
    )
}

/// Renames the database's WAL to `<wal>.unreplayed-<millis>` so DuckDB opens
/// without it. Returns the new path, or `None` when there is no WAL.
pub fn set_aside_wal(path: &Path) -> StorageResult<Option<PathBuf>> {
    let wal = wal_path(path);
    if !wal.exists() {
        return Ok(None);
    }
    let mut aside = wal.clone().into_os_string();
    aside.push(format!(".unreplayed-{}", chrono::Utc::now().timestamp_millis()));
    let aside = PathBuf::from(aside);
    std::fs::rename(&wal, &aside).map_err(|e| {
        StorageError::Unavailable(format!("cannot move WAL {}: {e}", wal.display()))
    })?;
    Ok(Some(aside))
}

/// Apply memory and thread limits to a DuckDB connection.
fn apply_resource_limits(
    conn: &duckdb::Connection,
    memory_limit: &str,
    threads: u32,
) -> StorageResult<()> {
    conn.execute_batch(&format!(
        "PRAGMA memory_limit='{}'; PRAGMA threads={};",
        memory_limit, threads
    ))?;
    Ok(())
}
