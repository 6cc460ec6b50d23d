//! Applying pulled remote records, and the conflicts they produce.
//!
//! Each remote record is applied in its own transaction: the "is anything
//! still queued for this entity" check and the overwrite happen under the same
//! lock, so a local write cannot slip in between and get clobbered.

use crate::error::{StorageError, StorageResult};
use crate::local_store::{
    LocalStore, get_by_server_id_in, get_in, millis_to_datetime, now_millis, purge_in, set_status_in,
    write_in,
};
use crate::outbox_rows::count_for_in;
use chrono::{DateTime, Utc};
use duckdb::{Connection, params};
use fieldsync_types::{EntityId, EntityRecord, Payload, RemoteRecord, SyncStatus};
use tracing::{debug, info};

/// Result of applying one remote record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    /// No local record had this server id; a new entity was created.
    Inserted(EntityId),
    /// The remote version replaced an idle local record.
    Overwritten(EntityId),
    /// A remote deletion removed an idle local record.
    Purged(EntityId),
    /// Local changes are queued and differ from the remote version.
    Conflict(EntityId),
    /// Local changes are queued but already match the remote version.
    Unchanged(EntityId),
    /// Remote deletion of a record this device never had.
    Ignored,
}

/// The remote side of a detected conflict.
#[derive(Clone, Debug, PartialEq)]
pub struct ConflictRecord {
    pub entity_id: EntityId,
    pub remote: RemoteRecord,
    pub detected_at: DateTime<Utc>,
}

impl LocalStore {
    /// Merges one authoritative record into the store.
    pub fn apply_remote(&self, remote: &RemoteRecord) -> StorageResult<MergeOutcome> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let outcome = match get_by_server_id_in(&tx, &remote.server_id)? {
            None if remote.deleted => MergeOutcome::Ignored,
            None => {
                let record = EntityRecord {
                    id: EntityId::new(),
                    entity_type: remote.entity_type.clone(),
                    server_id: Some(remote.server_id.clone()),
                    payload: remote.payload.clone(),
                    local_version: 0,
                    sync_status: SyncStatus::Synced,
                    updated_at: now_millis(),
                    deleted_locally: false,
                };
                write_in(&tx, &record)?;
                MergeOutcome::Inserted(record.id)
            }
            Some(local) if count_for_in(&tx, &local.id)? == 0 => {
                if remote.deleted {
                    purge_in(&tx, &local.id)?;
                    MergeOutcome::Purged(local.id)
                } else {
                    let record = EntityRecord {
                        payload: remote.payload.clone(),
                        entity_type: remote.entity_type.clone(),
                        sync_status: SyncStatus::Synced,
                        updated_at: now_millis(),
                        ..local
                    };
                    write_in(&tx, &record)?;
                    tx.execute(
                        "DELETE FROM conflicts WHERE entity_id = ?",
                        params![record.id.to_string()],
                    )?;
                    MergeOutcome::Overwritten(record.id)
                }
            }
            Some(local) => {
                let same = !remote.deleted && !local.deleted_locally && local.payload == remote.payload;
                if same {
                    MergeOutcome::Unchanged(local.id)
                } else {
                    record_conflict_in(&tx, &local.id, remote)?;
                    set_status_in(&tx, &local.id, SyncStatus::Conflict)?;
                    info!("[STORE] conflict on {} (server id {})", local.id, remote.server_id);
                    MergeOutcome::Conflict(local.id)
                }
            }
        };

        tx.commit()?;
        debug!("[STORE] applied remote {}: {outcome:?}", remote.server_id);
        Ok(outcome)
    }

    /// The recorded remote version for a conflicted entity.
    pub fn get_conflict(&self, id: &EntityId) -> StorageResult<Option<ConflictRecord>> {
        let conn = self.conn()?;
        conflict_in(&conn, id)
    }

    /// All recorded conflicts, oldest first.
    pub fn list_conflicts(&self) -> StorageResult<Vec<ConflictRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONFLICT_COLUMNS} FROM conflicts ORDER BY detected_at, entity_id"
        ))?;
        let rows = stmt
            .query_map([], ConflictRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(ConflictRow::into_record).collect()
    }

    /// Resolves a conflict in favor of the local version: the entity returns to
    /// `PENDING` so its queued writes overwrite the remote.
    pub fn keep_local_version(&self, id: &EntityId) -> StorageResult<EntityRecord> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let local = get_in(&tx, id)?.ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        tx.execute("DELETE FROM conflicts WHERE entity_id = ?", params![id.to_string()])?;
        let status = if count_for_in(&tx, id)? > 0 {
            SyncStatus::Pending
        } else {
            SyncStatus::Synced
        };
        set_status_in(&tx, id, status)?;
        tx.commit()?;
        Ok(EntityRecord {
            sync_status: status,
            ..local
        })
    }

    /// Resolves a conflict in favor of the remote version: queued writes are
    /// dropped and the recorded remote payload replaces the local one.
    /// Returns `None` when the remote side was a deletion and the entity was purged.
    pub fn take_remote_version(&self, id: &EntityId) -> StorageResult<Option<EntityRecord>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let local = get_in(&tx, id)?.ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        let conflict = conflict_in(&tx, id)?
            .ok_or_else(|| StorageError::NotFound(format!("conflict for {id}")))?;

        tx.execute("DELETE FROM outbox WHERE entity_id = ?", params![id.to_string()])?;
        let adopted = adopt_remote_in(&tx, local, conflict)?;
        tx.commit()?;
        Ok(adopted)
    }
}

/// Replaces the local entity with the recorded remote side of its conflict and
/// drops the conflict row. Returns `None` when the remote side was a deletion.
pub(crate) fn adopt_remote_in(
    conn: &Connection,
    local: EntityRecord,
    conflict: ConflictRecord,
) -> StorageResult<Option<EntityRecord>> {
    let id = local.id;
    conn.execute("DELETE FROM conflicts WHERE entity_id = ?", params![id.to_string()])?;

    if conflict.remote.deleted {
        purge_in(conn, &id)?;
        return Ok(None);
    }

    let record = EntityRecord {
        payload: conflict.remote.payload,
        entity_type: conflict.remote.entity_type,
        server_id: Some(conflict.remote.server_id),
        sync_status: SyncStatus::Synced,
        deleted_locally: false,
        updated_at: now_millis(),
        ..local
    };
    write_in(conn, &record)?;
    Ok(Some(record))
}

const CONFLICT_COLUMNS: &str = "entity_id, server_id, entity_type, remote_payload_json, remote_updated_at, remote_deleted, detected_at";

fn record_conflict_in(conn: &Connection, id: &EntityId, remote: &RemoteRecord) -> StorageResult<()> {
    conn.execute(
        r#"
        INSERT OR REPLACE INTO conflicts (
            entity_id, server_id, entity_type, remote_payload_json,
            remote_updated_at, remote_deleted, detected_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            id.to_string(),
            remote.server_id,
            remote.entity_type,
            serde_json::to_string(&remote.payload)?,
            remote.updated_at.timestamp_millis(),
            remote.deleted,
            Utc::now().timestamp_millis(),
        ],
    )?;
    Ok(())
}

pub(crate) fn conflict_in(conn: &Connection, id: &EntityId) -> StorageResult<Option<ConflictRecord>> {
    let result = conn.query_row(
        &format!("SELECT {CONFLICT_COLUMNS} FROM conflicts WHERE entity_id = ?"),
        params![id.to_string()],
        ConflictRow::from_row,
    );
    match result {
        Ok(row) => Ok(Some(row.into_record()?)),
        Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

struct ConflictRow {
    entity_id: String,
    server_id: String,
    entity_type: String,
    payload_json: String,
    remote_updated_at: i64,
    remote_deleted: bool,
    detected_at: i64,
}

impl ConflictRow {
    fn from_row(row: &duckdb::Row<'_>) -> duckdb::Result<Self> {
        Ok(Self {
            entity_id: row.get(0)?,
            server_id: row.get(1)?,
            entity_type: row.get(2)?,
            payload_json: row.get(3)?,
            remote_updated_at: row.get(4)?,
            remote_deleted: row.get(5)?,
            detected_at: row.get(6)?,
        })
    }

    fn into_record(self) -> StorageResult<ConflictRecord> {
        Ok(ConflictRecord {
            entity_id: self.entity_id.parse().map_err(|e| {
                StorageError::InvalidData(format!("conflict entity id '{}': {e}", self.entity_id))
            })?,
            remote: RemoteRecord {
                server_id: self.server_id,
                entity_type: self.entity_type,
                payload: serde_json::from_str::<Payload>(&self.payload_json)?,
                updated_at: millis_to_datetime(self.remote_updated_at)?,
                deleted: self.remote_deleted,
            },
            detected_at: millis_to_datetime(self.detected_at)?,
        })
    }
}
