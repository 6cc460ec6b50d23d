//! The local store: entities, metadata and reset.
//!
//! One DuckDB connection behind a mutex is the single serialized write path
//! for the whole data layer. Outbox and remote-merge operations are further
//! `impl LocalStore` blocks in sibling modules so that each multi-row change
//! commits in one transaction on that same connection.

use crate::config::StoreConfig;
use crate::error::{StorageError, StorageResult};
use crate::metadata_keys;
use crate::schema::{self, Schema};
use chrono::{DateTime, Utc};
use duckdb::{Connection, params};
use fieldsync_types::{EntityId, EntityRecord, Payload, SyncStatus};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Filter for [`LocalStore::query_all`].
#[derive(Clone, Debug, Default)]
pub struct EntityFilter {
    pub status: Option<SyncStatus>,
    pub include_deleted: bool,
    pub limit: Option<usize>,
}

impl EntityFilter {
    pub fn with_status(mut self, status: SyncStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn including_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Entity counts per sync status plus outbox depth.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncCounts {
    pub pending: usize,
    pub syncing: usize,
    pub synced: usize,
    pub conflict: usize,
    pub failed: usize,
    pub outbox_entries: usize,
}

impl SyncCounts {
    /// Entities whose local state is not yet confirmed by the remote.
    pub fn unsynced(&self) -> usize {
        self.pending + self.syncing + self.conflict + self.failed
    }
}

/// Durable on-device store backed by DuckDB.
#[derive(Clone)]
pub struct LocalStore {
    conn: Arc<Mutex<Connection>>,
    schema: Arc<Schema>,
}

impl LocalStore {
    /// Opens or creates a store at the given path with the current schema.
    pub fn open(path: &Path, config: &StoreConfig) -> StorageResult<Self> {
        Self::open_with_schema(path, config, Schema::current())
    }

    /// Opens an in-memory store (for testing).
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::initialize(conn, &StoreConfig::default(), Schema::current())
    }

    /// Opens a store against an explicit schema and migration chain.
    pub fn open_with_schema(
        path: &Path,
        config: &StoreConfig,
        schema: Schema,
    ) -> StorageResult<Self> {
        let conn =
            crate::open_duckdb_with_wal_recovery(path, &config.memory_limit, config.threads)?;
        Self::initialize(conn, config, schema)
    }

    fn initialize(
        mut conn: Connection,
        config: &StoreConfig,
        schema: Schema,
    ) -> StorageResult<Self> {
        schema::initialize(&mut conn, &schema, config)?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            schema: Arc::new(schema),
        };

        if let Some(marker) = &config.one_shot_reset {
            store.apply_one_shot_reset(marker)?;
        }
        store.recover_interrupted_syncs()?;
        Ok(store)
    }

    pub(crate) fn conn(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StorageError::Unavailable("store connection poisoned".to_string()))
    }

    /// Schema version recorded on disk.
    pub fn schema_version(&self) -> StorageResult<Option<u32>> {
        let conn = self.conn()?;
        schema::read_schema_version(&conn)
    }

    /// Names of all tables currently in the store.
    pub fn table_names(&self) -> StorageResult<Vec<String>> {
        let conn = self.conn()?;
        schema::list_tables(&conn)
    }

    fn apply_one_shot_reset(&self, marker: &str) -> StorageResult<()> {
        if self.get_metadata(metadata_keys::RESET_APPLIED)?.as_deref() == Some(marker) {
            return Ok(());
        }
        info!("[STORE] applying one-shot reset '{marker}'");
        self.reset_database()?;
        self.set_metadata(metadata_keys::RESET_APPLIED, marker)
    }

    /// Entities left `SYNCING` by a process that died mid-drain go back to
    /// `PENDING`; their outbox entries are still queued.
    fn recover_interrupted_syncs(&self) -> StorageResult<()> {
        let conn = self.conn()?;
        let recovered = conn.execute(
            "UPDATE entities SET sync_status = ? WHERE sync_status = ?",
            params![SyncStatus::Pending.as_str(), SyncStatus::Syncing.as_str()],
        )?;
        if recovered > 0 {
            warn!("[STORE] recovered {recovered} entities interrupted mid-sync");
        }
        Ok(())
    }

    // -- Entities --

    /// Writes the entity, incrementing its `local_version`.
    ///
    /// Returns the record as stored. A `server_id` already held by the stored
    /// row is kept; attempting to replace it with a different one fails.
    pub fn upsert(&self, entity: &EntityRecord) -> StorageResult<EntityRecord> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let stored = upsert_in(&tx, entity, entity.sync_status)?;
        tx.commit()?;
        Ok(stored)
    }

    /// Gets a single entity by id, tombstoned or not.
    pub fn get_by_id(&self, id: &EntityId) -> StorageResult<Option<EntityRecord>> {
        let conn = self.conn()?;
        get_in(&conn, id)
    }

    /// Gets the entity the remote knows as `server_id`.
    pub fn get_by_server_id(&self, server_id: &str) -> StorageResult<Option<EntityRecord>> {
        let conn = self.conn()?;
        get_by_server_id_in(&conn, server_id)
    }

    /// Lists entities of a type, most recently updated first.
    pub fn query_all(
        &self,
        entity_type: &str,
        filter: &EntityFilter,
    ) -> StorageResult<Vec<EntityRecord>> {
        let conn = self.conn()?;

        let mut sql = format!("SELECT {ENTITY_COLUMNS} FROM entities WHERE entity_type = ?");
        if !filter.include_deleted {
            sql.push_str(" AND deleted_locally = FALSE");
        }
        if filter.status.is_some() {
            sql.push_str(" AND sync_status = ?");
        }
        sql.push_str(" ORDER BY updated_at DESC, id");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut stmt = conn.prepare(&sql)?;
        let rows = match filter.status {
            Some(status) => stmt
                .query_map(params![entity_type, status.as_str()], EntityRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?,
            None => stmt
                .query_map(params![entity_type], EntityRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?,
        };

        rows.into_iter().map(EntityRow::into_record).collect()
    }

    /// Tombstones an entity. The row stays until its deletion is acknowledged
    /// remotely and [`purge`](Self::purge) removes it.
    pub fn mark_deleted(&self, id: &EntityId) -> StorageResult<EntityRecord> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut record =
            get_in(&tx, id)?.ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        record.deleted_locally = true;
        let stored = upsert_in(&tx, &record, SyncStatus::Pending)?;
        tx.commit()?;
        Ok(stored)
    }

    /// Physically removes an entity and any recorded conflict for it.
    pub fn purge(&self, id: &EntityId) -> StorageResult<bool> {
        let conn = self.conn()?;
        purge_in(&conn, id)
    }

    /// Sets the sync status of an entity.
    pub fn set_sync_status(&self, id: &EntityId, status: SyncStatus) -> StorageResult<()> {
        let conn = self.conn()?;
        set_status_in(&conn, id, status)
    }

    /// Counts entities per sync status, and the outbox depth.
    pub fn sync_counts(&self) -> StorageResult<SyncCounts> {
        let conn = self.conn()?;
        let mut counts = SyncCounts::default();

        let mut stmt =
            conn.prepare("SELECT sync_status, COUNT(*) FROM entities GROUP BY sync_status")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        for (status, count) in rows {
            let count = count as usize;
            match status.parse::<SyncStatus>() {
                Ok(SyncStatus::Pending) => counts.pending = count,
                Ok(SyncStatus::Syncing) => counts.syncing = count,
                Ok(SyncStatus::Synced) => counts.synced = count,
                Ok(SyncStatus::Conflict) => counts.conflict = count,
                Ok(SyncStatus::Failed) => counts.failed = count,
                Err(e) => warn!("[STORE] ignoring rows with {e}"),
            }
        }

        let outbox: i64 = conn.query_row("SELECT COUNT(*) FROM outbox", [], |row| row.get(0))?;
        counts.outbox_entries = outbox as usize;
        Ok(counts)
    }

    // -- Metadata --

    pub fn get_metadata(&self, key: &str) -> StorageResult<Option<String>> {
        let conn = self.conn()?;
        let result = conn.query_row(
            "SELECT value FROM metadata WHERE key = ?",
            params![key],
            |row| row.get::<_, String>(0),
        );
        match result {
            Ok(value) => Ok(Some(value)),
            Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn set_metadata(&self, key: &str, value: &str) -> StorageResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES (?, ?)",
            params![key, value],
        )?;
        Ok(())
    }

    /// Timestamp of the last fully successful sync cycle.
    pub fn last_sync_at(&self) -> StorageResult<Option<DateTime<Utc>>> {
        match self.get_metadata(metadata_keys::LAST_SYNC_AT)? {
            Some(raw) => DateTime::parse_from_rfc3339(&raw)
                .map(|dt| Some(dt.with_timezone(&Utc)))
                .map_err(|e| StorageError::InvalidData(format!("last_sync_at '{raw}': {e}"))),
            None => Ok(None),
        }
    }

    pub fn set_last_sync_at(&self, at: DateTime<Utc>) -> StorageResult<()> {
        self.set_metadata(metadata_keys::LAST_SYNC_AT, &at.to_rfc3339())
    }

    // -- Reset --

    /// Drops every entity, outbox, conflict and metadata row and recreates the
    /// schema at the store's version. Destructive.
    pub fn reset_database(&self) -> StorageResult<()> {
        let mut conn = self.conn()?;
        schema::reset_schema(&mut conn, &self.schema)
    }
}

// -- Row helpers shared with the outbox and merge modules --

pub(crate) const ENTITY_COLUMNS: &str =
    "id, entity_type, server_id, payload_json, local_version, sync_status, updated_at, deleted_locally";

/// Raw entity row; converted outside the DuckDB row callback so parse errors
/// surface as [`StorageError::InvalidData`].
pub(crate) struct EntityRow {
    id: String,
    entity_type: String,
    server_id: Option<String>,
    payload_json: String,
    local_version: i64,
    sync_status: String,
    updated_at: i64,
    deleted_locally: bool,
}

impl EntityRow {
    pub(crate) fn from_row(row: &duckdb::Row<'_>) -> duckdb::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            entity_type: row.get(1)?,
            server_id: row.get(2)?,
            payload_json: row.get(3)?,
            local_version: row.get(4)?,
            sync_status: row.get(5)?,
            updated_at: row.get(6)?,
            deleted_locally: row.get(7)?,
        })
    }

    pub(crate) fn into_record(self) -> StorageResult<EntityRecord> {
        Ok(EntityRecord {
            id: self
                .id
                .parse()
                .map_err(|e| StorageError::InvalidData(format!("entity id '{}': {e}", self.id)))?,
            entity_type: self.entity_type,
            server_id: self.server_id,
            payload: serde_json::from_str::<Payload>(&self.payload_json)?,
            local_version: self.local_version,
            sync_status: self
                .sync_status
                .parse()
                .map_err(|e| StorageError::InvalidData(format!("{e}")))?,
            updated_at: millis_to_datetime(self.updated_at)?,
            deleted_locally: self.deleted_locally,
        })
    }
}

/// Current time at the millisecond precision rows are stored with.
pub(crate) fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

pub(crate) fn millis_to_datetime(ms: i64) -> StorageResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StorageError::InvalidData(format!("timestamp out of range: {ms}")))
}

pub(crate) fn get_in(conn: &Connection, id: &EntityId) -> StorageResult<Option<EntityRecord>> {
    let result = conn.query_row(
        &format!("SELECT {ENTITY_COLUMNS} FROM entities WHERE id = ?"),
        params![id.to_string()],
        EntityRow::from_row,
    );
    match result {
        Ok(row) => Ok(Some(row.into_record()?)),
        Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn get_by_server_id_in(
    conn: &Connection,
    server_id: &str,
) -> StorageResult<Option<EntityRecord>> {
    let result = conn.query_row(
        &format!("SELECT {ENTITY_COLUMNS} FROM entities WHERE server_id = ? LIMIT 1"),
        params![server_id],
        EntityRow::from_row,
    );
    match result {
        Ok(row) => Ok(Some(row.into_record()?)),
        Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Local write: bumps `local_version`, stamps `updated_at`, keeps an
/// existing `server_id`.
pub(crate) fn upsert_in(
    conn: &Connection,
    entity: &EntityRecord,
    status: SyncStatus,
) -> StorageResult<EntityRecord> {
    let existing = get_in(conn, &entity.id)?;

    let mut stored = entity.clone();
    stored.sync_status = status;
    stored.updated_at = now_millis();
    stored.local_version = match &existing {
        Some(prev) => prev.local_version.max(entity.local_version) + 1,
        None => entity.local_version + 1,
    };
    stored.server_id = match (existing.and_then(|e| e.server_id), &entity.server_id) {
        (Some(held), Some(new)) if &held != new => {
            return Err(StorageError::ServerIdAlreadyAssigned {
                entity_id: entity.id.to_string(),
                existing: held,
            });
        }
        (Some(held), _) => Some(held),
        (None, new) => new.clone(),
    };

    write_in(conn, &stored)?;
    debug!("[STORE] wrote {} v{}", stored.id, stored.local_version);
    Ok(stored)
}

/// Writes the record exactly as given.
pub(crate) fn write_in(conn: &Connection, record: &EntityRecord) -> StorageResult<()> {
    let payload_json = serde_json::to_string(&record.payload)?;
    conn.execute(
        r#"
        INSERT OR REPLACE INTO entities (
            id, entity_type, server_id, payload_json,
            local_version, sync_status, updated_at, deleted_locally
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            record.id.to_string(),
            record.entity_type,
            record.server_id.as_deref(),
            payload_json,
            record.local_version,
            record.sync_status.as_str(),
            record.updated_at.timestamp_millis(),
            record.deleted_locally,
        ],
    )?;
    Ok(())
}

pub(crate) fn set_status_in(
    conn: &Connection,
    id: &EntityId,
    status: SyncStatus,
) -> StorageResult<()> {
    conn.execute(
        "UPDATE entities SET sync_status = ? WHERE id = ?",
        params![status.as_str(), id.to_string()],
    )?;
    Ok(())
}

pub(crate) fn purge_in(conn: &Connection, id: &EntityId) -> StorageResult<bool> {
    let id = id.to_string();
    conn.execute("DELETE FROM conflicts WHERE entity_id = ?", params![id])?;
    let removed = conn.execute("DELETE FROM entities WHERE id = ?", params![id])?;
    Ok(removed > 0)
}
