//! Durable outbox rows.
//!
//! Sequence numbers come from a single-row counter bumped in the same
//! transaction as the insert, so they are strictly increasing and never reused
//! even after entries are acknowledged and removed.

use crate::error::{StorageError, StorageResult};
use crate::local_store::{
    LocalStore, get_in, millis_to_datetime, purge_in, set_status_in, upsert_in,
};
use crate::remote_apply::{adopt_remote_in, conflict_in};
use chrono::Utc;
use duckdb::{Connection, params};
use fieldsync_types::{EntityId, EntityRecord, OperationType, OutboxEntry, Payload, SyncStatus};
use tracing::{debug, warn};

/// What the remote authority confirmed for an outbox entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Acknowledgment {
    Created { server_id: String },
    Updated,
    Deleted,
}

const OUTBOX_COLUMNS: &str = "sequence, entity_id, entity_type, operation, payload_json, attempts, last_error, enqueued_at";

impl LocalStore {
    /// Applies a local write and queues it for the remote in one transaction.
    ///
    /// `Delete` tombstones the entity instead of removing it.
    pub fn commit_local_change(
        &self,
        operation: OperationType,
        entity: &EntityRecord,
    ) -> StorageResult<(EntityRecord, OutboxEntry)> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let mut record = entity.clone();
        if operation == OperationType::Delete {
            record.deleted_locally = true;
        }
        // Conflicted and failed entities keep their state until resolved or retried.
        let status = match get_in(&tx, &record.id)? {
            Some(prev)
                if matches!(prev.sync_status, SyncStatus::Conflict | SyncStatus::Failed) =>
            {
                prev.sync_status
            }
            _ => SyncStatus::Pending,
        };
        let stored = upsert_in(&tx, &record, status)?;
        let entry = append_in(&tx, operation, &stored)?;

        tx.commit()?;
        Ok((stored, entry))
    }

    /// Appends an entry for `entity` with the next sequence number.
    pub fn append_outbox(
        &self,
        operation: OperationType,
        entity: &EntityRecord,
    ) -> StorageResult<OutboxEntry> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let entry = append_in(&tx, operation, entity)?;
        tx.execute(
            "UPDATE entities SET sync_status = ? WHERE id = ? AND sync_status = ?",
            params![
                SyncStatus::Pending.as_str(),
                entity.id.to_string(),
                SyncStatus::Synced.as_str()
            ],
        )?;
        tx.commit()?;
        Ok(entry)
    }

    /// All entries in ascending sequence order.
    pub fn outbox_entries(&self) -> StorageResult<Vec<OutboxEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox ORDER BY sequence"
        ))?;
        let rows = stmt
            .query_map([], OutboxRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(OutboxRow::into_entry).collect()
    }

    /// Entries of one entity in ascending sequence order.
    pub fn outbox_entries_for(&self, id: &EntityId) -> StorageResult<Vec<OutboxEntry>> {
        let conn = self.conn()?;
        entries_for_in(&conn, id)
    }

    pub fn has_pending_outbox(&self, id: &EntityId) -> StorageResult<bool> {
        let conn = self.conn()?;
        Ok(count_for_in(&conn, id)? > 0)
    }

    pub fn outbox_len(&self) -> StorageResult<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM outbox", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Removes an acknowledged entry and applies its local consequences.
    ///
    /// `Created` records the server id, `Deleted` purges the tombstoned entity
    /// (and anything still queued for it). When nothing else is queued for the
    /// entity it becomes `SYNCED`. Returns the entity afterwards, `None` if purged.
    pub fn acknowledge_outbox(
        &self,
        sequence: i64,
        ack: &Acknowledgment,
    ) -> StorageResult<Option<EntityRecord>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let entry = entry_in(&tx, sequence)?
            .ok_or_else(|| StorageError::NotFound(format!("outbox entry {sequence}")))?;
        let id = entry.entity_id;
        tx.execute("DELETE FROM outbox WHERE sequence = ?", params![sequence])?;

        match ack {
            Acknowledgment::Created { server_id } => assign_server_id_in(&tx, &id, server_id)?,
            Acknowledgment::Updated => {}
            Acknowledgment::Deleted => {
                let dropped = tx.execute(
                    "DELETE FROM outbox WHERE entity_id = ?",
                    params![id.to_string()],
                )?;
                if dropped > 0 {
                    debug!("[STORE] dropped {dropped} entries queued after delete of {id}");
                }
                purge_in(&tx, &id)?;
                tx.commit()?;
                return Ok(None);
            }
        }

        if let Some(current) = get_in(&tx, &id)? {
            let status = if count_for_in(&tx, &id)? > 0 {
                SyncStatus::Pending
            } else {
                SyncStatus::Synced
            };
            if current.sync_status != SyncStatus::Conflict {
                set_status_in(&tx, &id, status)?;
            }
        }

        let after = get_in(&tx, &id)?;
        tx.commit()?;
        Ok(after)
    }

    /// Records a failed send. Returns the new attempt count.
    ///
    /// With `mark_failed` the entity moves to `FAILED`; otherwise it returns to
    /// `PENDING` for the next drain.
    pub fn record_outbox_failure(
        &self,
        sequence: i64,
        error: &str,
        mark_failed: bool,
    ) -> StorageResult<u32> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let entry = entry_in(&tx, sequence)?
            .ok_or_else(|| StorageError::NotFound(format!("outbox entry {sequence}")))?;
        tx.execute(
            "UPDATE outbox SET attempts = attempts + 1, last_error = ? WHERE sequence = ?",
            params![error, sequence],
        )?;
        let status = if mark_failed {
            SyncStatus::Failed
        } else {
            SyncStatus::Pending
        };
        set_status_in(&tx, &entry.entity_id, status)?;

        tx.commit()?;
        Ok(entry.attempts.saturating_add(1))
    }

    /// Clears attempt counters and errors for an entity and makes it eligible
    /// for the next drain again. Returns the number of entries reset.
    pub fn reset_outbox_attempts(&self, id: &EntityId) -> StorageResult<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let reset = tx.execute(
            "UPDATE outbox SET attempts = 0, last_error = NULL WHERE entity_id = ?",
            params![id.to_string()],
        )?;
        if reset > 0 {
            set_status_in(&tx, id, SyncStatus::Pending)?;
        }
        tx.commit()?;
        Ok(reset)
    }

    /// Drops every queued entry for an entity.
    ///
    /// A conflicted entity takes the recorded remote version, since no local
    /// write is left to defend it. A tombstoned entity is purged. Otherwise
    /// the row stays: `SYNCED` if the remote knows it, `FAILED` if it never
    /// reached the remote.
    pub fn discard_outbox(&self, id: &EntityId) -> StorageResult<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let dropped = tx.execute(
            "DELETE FROM outbox WHERE entity_id = ?",
            params![id.to_string()],
        )?;
        if let Some(record) = get_in(&tx, id)? {
            if let Some(conflict) = conflict_in(&tx, id)? {
                adopt_remote_in(&tx, record, conflict)?;
            } else if record.deleted_locally {
                purge_in(&tx, id)?;
            } else if record.server_id.is_some() {
                set_status_in(&tx, id, SyncStatus::Synced)?;
            } else {
                set_status_in(&tx, id, SyncStatus::Failed)?;
            }
        }
        tx.commit()?;
        if dropped > 0 {
            warn!("[STORE] discarded {dropped} outbox entries for {id}");
        }
        Ok(dropped)
    }
}

fn append_in(
    conn: &Connection,
    operation: OperationType,
    entity: &EntityRecord,
) -> StorageResult<OutboxEntry> {
    conn.execute(
        "UPDATE outbox_counter SET last_sequence = last_sequence + 1 WHERE id = 1",
        [],
    )?;
    let sequence: i64 = conn.query_row(
        "SELECT last_sequence FROM outbox_counter WHERE id = 1",
        [],
        |row| row.get(0),
    )?;

    let enqueued_at = Utc::now();
    conn.execute(
        r#"
        INSERT INTO outbox (
            sequence, entity_id, entity_type, operation,
            payload_json, attempts, last_error, enqueued_at
        ) VALUES (?, ?, ?, ?, ?, 0, NULL, ?)
        "#,
        params![
            sequence,
            entity.id.to_string(),
            entity.entity_type,
            operation.as_str(),
            serde_json::to_string(&entity.payload)?,
            enqueued_at.timestamp_millis(),
        ],
    )?;
    debug!("[STORE] queued #{sequence} {operation} for {}", entity.id);

    Ok(OutboxEntry {
        sequence,
        entity_id: entity.id,
        entity_type: entity.entity_type.clone(),
        operation,
        payload_snapshot: entity.payload.clone(),
        attempts: 0,
        last_error: None,
        // Round-trip through millis so the value matches what a reload returns.
        enqueued_at: millis_to_datetime(enqueued_at.timestamp_millis())?,
    })
}

fn entry_in(conn: &Connection, sequence: i64) -> StorageResult<Option<OutboxEntry>> {
    let result = conn.query_row(
        &format!("SELECT {OUTBOX_COLUMNS} FROM outbox WHERE sequence = ?"),
        params![sequence],
        OutboxRow::from_row,
    );
    match result {
        Ok(row) => Ok(Some(row.into_entry()?)),
        Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn entries_for_in(conn: &Connection, id: &EntityId) -> StorageResult<Vec<OutboxEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {OUTBOX_COLUMNS} FROM outbox WHERE entity_id = ? ORDER BY sequence"
    ))?;
    let rows = stmt
        .query_map(params![id.to_string()], OutboxRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(OutboxRow::into_entry).collect()
}

pub(crate) fn count_for_in(conn: &Connection, id: &EntityId) -> StorageResult<usize> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM outbox WHERE entity_id = ?",
        params![id.to_string()],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

/// `server_id` is written once; re-acknowledging the same id is a no-op.
fn assign_server_id_in(conn: &Connection, id: &EntityId, server_id: &str) -> StorageResult<()> {
    let Some(record) = get_in(conn, id)? else {
        warn!("[STORE] create acknowledged for missing entity {id}");
        return Ok(());
    };
    match record.server_id {
        Some(held) if held == server_id => Ok(()),
        Some(held) => Err(StorageError::ServerIdAlreadyAssigned {
            entity_id: id.to_string(),
            existing: held,
        }),
        None => {
            conn.execute(
                "UPDATE entities SET server_id = ? WHERE id = ?",
                params![server_id, id.to_string()],
            )?;
            Ok(())
        }
    }
}

struct OutboxRow {
    sequence: i64,
    entity_id: String,
    entity_type: String,
    operation: String,
    payload_json: String,
    attempts: i64,
    last_error: Option<String>,
    enqueued_at: i64,
}

impl OutboxRow {
    fn from_row(row: &duckdb::Row<'_>) -> duckdb::Result<Self> {
        Ok(Self {
            sequence: row.get(0)?,
            entity_id: row.get(1)?,
            entity_type: row.get(2)?,
            operation: row.get(3)?,
            payload_json: row.get(4)?,
            attempts: row.get(5)?,
            last_error: row.get(6)?,
            enqueued_at: row.get(7)?,
        })
    }

    fn into_entry(self) -> StorageResult<OutboxEntry> {
        Ok(OutboxEntry {
            sequence: self.sequence,
            entity_id: self.entity_id.parse().map_err(|e| {
                StorageError::InvalidData(format!("outbox entity id '{}': {e}", self.entity_id))
            })?,
            entity_type: self.entity_type,
            operation: self
                .operation
                .parse()
                .map_err(|e| StorageError::InvalidData(format!("{e}")))?,
            payload_snapshot: serde_json::from_str::<Payload>(&self.payload_json)?,
            attempts: u32::try_from(self.attempts).unwrap_or(u32::MAX),
            last_error: self.last_error,
            enqueued_at: millis_to_datetime(self.enqueued_at)?,
        })
    }
}
