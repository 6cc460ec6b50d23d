//! Local-first entity repository.
//!
//! Every UI read and write goes through the local store; writes commit the
//! entity change and its outbox entry atomically and return immediately,
//! regardless of connectivity.

use crate::error::{SyncError, SyncResult};
use fieldsync_storage::{ConflictRecord, EntityFilter, LocalStore, StorageError, SyncCounts};
use fieldsync_types::{EntityId, EntityRecord, OperationType, Payload};
use tracing::{info, warn};

/// How to settle a conflict.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictResolution {
    /// Keep the local version; queued writes go out on the next drain.
    KeepLocal,
    /// Take the remote version; queued writes are dropped.
    TakeRemote,
}

/// Read/write surface over the local store.
#[derive(Clone)]
pub struct EntityRepository {
    store: LocalStore,
}

impl EntityRepository {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    /// Creates an entity and queues its creation.
    pub fn create(&self, entity_type: &str, payload: Payload) -> SyncResult<EntityRecord> {
        let record = EntityRecord::new(entity_type, payload);
        let (stored, entry) = self
            .store
            .commit_local_change(OperationType::Create, &record)?;
        info!("[SYNC] created {} {} (#{})", stored.entity_type, stored.id, entry.sequence);
        Ok(stored)
    }

    /// Replaces an entity's payload and queues the update.
    pub fn update(&self, id: &EntityId, payload: Payload) -> SyncResult<EntityRecord> {
        let current = self.live(id)?;
        let record = EntityRecord { payload, ..current };
        let (stored, _) = self
            .store
            .commit_local_change(OperationType::Update, &record)?;
        Ok(stored)
    }

    /// Tombstones an entity and queues the deletion. The row is purged once
    /// the remote confirms.
    pub fn delete(&self, id: &EntityId) -> SyncResult<EntityRecord> {
        let current = self.live(id)?;
        let (stored, _) = self
            .store
            .commit_local_change(OperationType::Delete, &current)?;
        info!("[SYNC] deleted {} {}", stored.entity_type, stored.id);
        Ok(stored)
    }

    /// Looks up an entity; tombstoned entities read as absent.
    pub fn get(&self, id: &EntityId) -> SyncResult<Option<EntityRecord>> {
        Ok(self
            .store
            .get_by_id(id)?
            .filter(|record| !record.deleted_locally))
    }

    pub fn list(&self, entity_type: &str, filter: &EntityFilter) -> SyncResult<Vec<EntityRecord>> {
        Ok(self.store.query_all(entity_type, filter)?)
    }

    pub fn sync_counts(&self) -> SyncResult<SyncCounts> {
        Ok(self.store.sync_counts()?)
    }

    pub fn conflicts(&self) -> SyncResult<Vec<ConflictRecord>> {
        Ok(self.store.list_conflicts()?)
    }

    /// Settles a conflict. Returns the entity afterwards, `None` when taking
    /// the remote version removed it.
    pub fn resolve_conflict(
        &self,
        id: &EntityId,
        resolution: ConflictResolution,
    ) -> SyncResult<Option<EntityRecord>> {
        if self.store.get_conflict(id)?.is_none() {
            return Err(SyncError::Storage(StorageError::NotFound(format!(
                "conflict for {id}"
            ))));
        }
        let resolved = match resolution {
            ConflictResolution::KeepLocal => Some(self.store.keep_local_version(id)?),
            ConflictResolution::TakeRemote => self.store.take_remote_version(id)?,
        };
        info!("[SYNC] conflict on {id} resolved: {resolution:?}");
        Ok(resolved)
    }

    /// Wipes every entity, queued write and conflict. Used on sign-out.
    pub fn clear_local_data(&self) -> SyncResult<()> {
        warn!("[SYNC] clearing all local data");
        Ok(self.store.reset_database()?)
    }

    fn live(&self, id: &EntityId) -> SyncResult<EntityRecord> {
        self.get(id)?
            .ok_or_else(|| SyncError::Storage(StorageError::NotFound(id.to_string())))
    }
}
