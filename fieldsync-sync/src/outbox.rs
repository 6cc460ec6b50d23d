//! Durable outbox of local writes and its drain.
//!
//! Entries live in the local store and survive restarts. A drain sends them to
//! the remote authority in sequence order per entity: an entity's entries are
//! sent one at a time and the first failure stops that entity until the next
//! drain, while other entities proceed independently.

use crate::blocking::with_store;
use crate::config::SyncConfig;
use crate::error::SyncResult;
use crate::remote::{RemoteAuthority, RemoteError, with_timeout};
use fieldsync_storage::{Acknowledgment, LocalStore};
use fieldsync_types::{EntityId, EntityRecord, OperationType, OutboxEntry, SyncStatus};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// What one drain accomplished.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Entries acknowledged by the remote (or settled locally) and removed.
    pub sent: usize,
    /// Entries whose send failed; they stay queued.
    pub failed: usize,
    /// Entries not attempted because their entity is blocked or conflicted.
    pub skipped: usize,
    /// Entities that moved to `FAILED` during this drain.
    pub newly_failed: Vec<EntityId>,
    /// Last remote error per entity that hit one.
    pub errors: Vec<(EntityId, RemoteError)>,
}

impl DrainReport {
    fn absorb(&mut self, drained: EntityDrain) {
        self.sent += drained.sent;
        self.skipped += drained.skipped;
        if let Some((error, now_failed)) = drained.error {
            self.failed += 1;
            if now_failed {
                self.newly_failed.push(drained.entity_id);
            }
            self.errors.push((drained.entity_id, error));
        }
    }
}

struct EntityDrain {
    entity_id: EntityId,
    sent: usize,
    skipped: usize,
    error: Option<(RemoteError, bool)>,
}

impl EntityDrain {
    fn new(entity_id: EntityId) -> Self {
        Self {
            entity_id,
            sent: 0,
            skipped: 0,
            error: None,
        }
    }
}

/// Outbox front-end over the local store.
#[derive(Clone)]
pub struct Outbox {
    store: LocalStore,
    config: SyncConfig,
}

impl Outbox {
    pub fn new(store: LocalStore, config: SyncConfig) -> Self {
        Self { store, config }
    }

    /// Queues `operation` for `entity` with the next sequence number.
    pub fn enqueue(
        &self,
        operation: OperationType,
        entity: &EntityRecord,
    ) -> SyncResult<OutboxEntry> {
        let entry = self.store.append_outbox(operation, entity)?;
        debug!(
            "[SYNC] queued {} #{} for {}",
            entry.operation, entry.sequence, entry.entity_id
        );
        Ok(entry)
    }

    /// All queued entries in sequence order.
    pub fn pending(&self) -> SyncResult<Vec<OutboxEntry>> {
        Ok(self.store.outbox_entries()?)
    }

    pub fn len(&self) -> SyncResult<usize> {
        Ok(self.store.outbox_len()?)
    }

    pub fn is_empty(&self) -> SyncResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Makes a `FAILED` entity eligible again: attempt counters are cleared.
    pub fn retry(&self, id: &EntityId) -> SyncResult<usize> {
        let reset = self.store.reset_outbox_attempts(id)?;
        info!("[SYNC] retry requested for {id} ({reset} entries)");
        Ok(reset)
    }

    /// Drops every queued entry for an entity.
    pub fn discard(&self, id: &EntityId) -> SyncResult<usize> {
        Ok(self.store.discard_outbox(id)?)
    }

    /// Sends queued entries to the remote authority.
    ///
    /// Remote failures are recorded on their entries and reported, never
    /// returned as errors. A storage failure is returned after every entity
    /// group has finished, progress already committed stays committed.
    pub async fn drain(&self, remote: &dyn RemoteAuthority) -> SyncResult<DrainReport> {
        let entries = with_store(&self.store, |store| store.outbox_entries()).await?;
        if entries.is_empty() {
            return Ok(DrainReport::default());
        }
        let groups = group_by_entity(entries);
        debug!("[SYNC] draining outbox for {} entities", groups.len());

        let results: Vec<SyncResult<EntityDrain>> = stream::iter(groups)
            .map(|(id, entries)| self.drain_entity(remote, id, entries))
            .buffer_unordered(self.config.max_concurrent_entities.max(1))
            .collect()
            .await;

        let mut report = DrainReport::default();
        let mut storage_error = None;
        for result in results {
            match result {
                Ok(drained) => report.absorb(drained),
                Err(e) => {
                    warn!("[SYNC] drain storage error: {e}");
                    storage_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = storage_error {
            return Err(e);
        }

        info!(
            "[SYNC] drain done: sent={} failed={} skipped={}",
            report.sent, report.failed, report.skipped
        );
        Ok(report)
    }

    async fn drain_entity(
        &self,
        remote: &dyn RemoteAuthority,
        id: EntityId,
        entries: Vec<OutboxEntry>,
    ) -> SyncResult<EntityDrain> {
        let mut drained = EntityDrain::new(id);
        let entity = with_store(&self.store, move |store| store.get_by_id(&id)).await?;

        let blocked = match &entity {
            Some(e) if e.sync_status == SyncStatus::Conflict => {
                debug!("[SYNC] {id} is in conflict, holding {} entries", entries.len());
                true
            }
            Some(e) if e.sync_status == SyncStatus::Failed => true,
            _ => entries
                .first()
                .is_some_and(|head| head.attempts >= self.config.max_attempts),
        };
        if blocked {
            drained.skipped = entries.len();
            return Ok(drained);
        }

        let mut server_id = entity.as_ref().and_then(|e| e.server_id.clone());
        let total = entries.len();
        for (index, entry) in entries.into_iter().enumerate() {
            if entity.is_some() {
                with_store(&self.store, move |store| {
                    store.set_sync_status(&id, SyncStatus::Syncing)
                })
                .await?;
            }

            let sequence = entry.sequence;
            match self.send(remote, &entry, server_id.as_deref()).await {
                Ok(ack) => {
                    let after = with_store(&self.store, move |store| {
                        store.acknowledge_outbox(sequence, &ack)
                    })
                    .await?;
                    drained.sent += 1;
                    match after {
                        Some(record) => server_id = record.server_id,
                        // Purged after a delete; anything left was dropped with it.
                        None => break,
                    }
                }
                Err(error) => {
                    let mark_failed = matches!(error, RemoteError::Rejected(_))
                        || entry.attempts.saturating_add(1) >= self.config.max_attempts;
                    let message = error.to_string();
                    let attempts = with_store(&self.store, move |store| {
                        store.record_outbox_failure(sequence, &message, mark_failed)
                    })
                    .await?;
                    if mark_failed {
                        warn!("[SYNC] {id} failed after {attempts} attempts: {error}");
                    } else {
                        debug!("[SYNC] {id} send #{sequence} failed (attempt {attempts}): {error}");
                    }
                    drained.skipped = total - index - 1;
                    drained.error = Some((error, mark_failed));
                    break;
                }
            }
        }
        Ok(drained)
    }

    async fn send(
        &self,
        remote: &dyn RemoteAuthority,
        entry: &OutboxEntry,
        server_id: Option<&str>,
    ) -> Result<Acknowledgment, RemoteError> {
        let limit = self.config.remote_timeout();
        let payload = &entry.payload_snapshot;
        match (entry.operation, server_id) {
            (OperationType::Create, None) => {
                let server_id =
                    with_timeout(limit, remote.create_remote(&entry.entity_type, payload)).await?;
                Ok(Acknowledgment::Created { server_id })
            }
            // The remote already holds this entity; a second create would duplicate it.
            (OperationType::Create, Some(existing)) => {
                with_timeout(limit, remote.update_remote(existing, payload)).await?;
                Ok(Acknowledgment::Updated)
            }
            (OperationType::Update, Some(existing)) => {
                with_timeout(limit, remote.update_remote(existing, payload)).await?;
                Ok(Acknowledgment::Updated)
            }
            (OperationType::Update, None) => Err(RemoteError::Rejected(format!(
                "entity {} has no server id to update",
                entry.entity_id
            ))),
            (OperationType::Delete, Some(existing)) => {
                with_timeout(limit, remote.delete_remote(existing)).await?;
                Ok(Acknowledgment::Deleted)
            }
            // Never reached the remote, so there is nothing to delete there.
            (OperationType::Delete, None) => Ok(Acknowledgment::Deleted),
        }
    }
}

/// Groups entries per entity, keeping sequence order within each group and
/// ordering groups by their oldest entry.
fn group_by_entity(entries: Vec<OutboxEntry>) -> Vec<(EntityId, Vec<OutboxEntry>)> {
    let mut index: HashMap<EntityId, usize> = HashMap::new();
    let mut groups: Vec<(EntityId, Vec<OutboxEntry>)> = Vec::new();
    for entry in entries {
        match index.get(&entry.entity_id) {
            Some(&i) => groups[i].1.push(entry),
            None => {
                index.insert(entry.entity_id, groups.len());
                groups.push((entry.entity_id, vec![entry]));
            }
        }
    }
    groups
}
