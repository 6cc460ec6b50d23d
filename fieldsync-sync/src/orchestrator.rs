//! Sync orchestrator.
//!
//! Runs sync cycles (drain the outbox, pull remote changes, merge them) one at
//! a time. Triggers that arrive while a cycle is running are coalesced into at
//! most one follow-up cycle. The orchestrator runs as a long-lived task driven
//! by [`SyncCommand`]s and the connectivity monitor; progress goes out as
//! [`SyncEvent`]s and a [`SyncHealth`] snapshot on a watch channel.

use crate::blocking::with_store;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::outbox::{DrainReport, Outbox};
use crate::remote::{RemoteAuthority, SessionProvider, with_timeout};
use chrono::{DateTime, Utc};
use fieldsync_storage::{LocalStore, MergeOutcome};
use fieldsync_types::EntityId;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Where the orchestrator is in its cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    DrainingOutbox,
    PullingRemote,
    Merging,
    /// A cycle stopped on an error. Transient: the orchestrator returns to `Idle`.
    Failed,
}

/// Why a cycle was requested.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    Boot,
    ConnectivityRestored,
    UserRefresh,
}

/// Commands accepted by the orchestrator.
#[derive(Debug)]
pub enum SyncCommand {
    Trigger(SyncTrigger),
    Shutdown,
}

/// Events emitted while syncing.
#[derive(Clone, Debug)]
pub enum SyncEvent {
    CycleStarted { trigger: SyncTrigger },
    StateChanged { state: SyncState },
    ConflictDetected { entity_id: EntityId },
    CycleCompleted { report: CycleReport },
    CycleFailed { error: String, degraded: bool },
}

/// Outcome of one sync cycle.
#[derive(Clone, Debug, PartialEq)]
pub struct CycleReport {
    pub trigger: SyncTrigger,
    pub drain: DrainReport,
    pub pulled: usize,
    pub inserted: usize,
    pub overwritten: usize,
    pub purged: usize,
    pub unchanged: usize,
    pub conflicts: Vec<EntityId>,
    /// The new high-water mark, set only when pull and merge both completed.
    pub last_sync_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl CycleReport {
    fn new(trigger: SyncTrigger) -> Self {
        Self {
            trigger,
            drain: DrainReport::default(),
            pulled: 0,
            inserted: 0,
            overwritten: 0,
            purged: 0,
            unchanged: 0,
            conflicts: Vec::new(),
            last_sync_at: None,
            error: None,
        }
    }

    fn absorb(&mut self, outcome: MergeOutcome) {
        match outcome {
            MergeOutcome::Inserted(_) => self.inserted += 1,
            MergeOutcome::Overwritten(_) => self.overwritten += 1,
            MergeOutcome::Purged(_) => self.purged += 1,
            MergeOutcome::Unchanged(_) => self.unchanged += 1,
            MergeOutcome::Conflict(id) => self.conflicts.push(id),
            MergeOutcome::Ignored => {}
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// What the UI shows about sync.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SyncHealth {
    pub state: SyncState,
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Entities not yet confirmed by the remote.
    pub unsynced: usize,
    pub failed: usize,
    pub conflicts: usize,
    /// Local storage misbehaved during the last cycle; shown data may be stale.
    pub degraded: bool,
    pub last_error: Option<String>,
}

impl Default for SyncHealth {
    fn default() -> Self {
        Self {
            state: SyncState::Idle,
            last_sync_at: None,
            unsynced: 0,
            failed: 0,
            conflicts: 0,
            degraded: false,
            last_error: None,
        }
    }
}

/// Handle for talking to a running orchestrator.
#[derive(Clone)]
pub struct OrchestratorHandle {
    command_tx: mpsc::Sender<SyncCommand>,
    health_rx: watch::Receiver<SyncHealth>,
}

impl OrchestratorHandle {
    /// Sends a command to the orchestrator.
    pub async fn send(&self, cmd: SyncCommand) -> SyncResult<()> {
        self.command_tx
            .send(cmd)
            .await
            .map_err(|_| SyncError::ChannelClosed)
    }

    pub async fn trigger(&self, trigger: SyncTrigger) -> SyncResult<()> {
        self.send(SyncCommand::Trigger(trigger)).await
    }

    /// Pull-to-refresh.
    pub async fn request_sync(&self) -> SyncResult<()> {
        self.trigger(SyncTrigger::UserRefresh).await
    }

    pub async fn shutdown(&self) -> SyncResult<()> {
        self.send(SyncCommand::Shutdown).await
    }

    /// The latest health snapshot.
    pub fn health(&self) -> SyncHealth {
        self.health_rx.borrow().clone()
    }

    pub fn subscribe_health(&self) -> watch::Receiver<SyncHealth> {
        self.health_rx.clone()
    }
}

/// The sync orchestrator.
pub struct SyncOrchestrator {
    store: LocalStore,
    outbox: Outbox,
    remote: Arc<dyn RemoteAuthority>,
    session: Arc<dyn SessionProvider>,
    connectivity: watch::Receiver<bool>,
    connectivity_open: bool,
    was_online: bool,
    config: SyncConfig,
    state: SyncState,
    degraded: bool,
    last_error: Option<String>,
    event_tx: mpsc::Sender<SyncEvent>,
    health_tx: watch::Sender<SyncHealth>,
}

/// Creates an orchestrator and its channels.
///
/// Spawn `orchestrator.run(command_rx)` on the runtime; keep the handle for
/// triggers and health, and read the event receiver for progress.
pub fn create_orchestrator(
    store: LocalStore,
    remote: Arc<dyn RemoteAuthority>,
    session: Arc<dyn SessionProvider>,
    connectivity: watch::Receiver<bool>,
    config: SyncConfig,
) -> (
    OrchestratorHandle,
    mpsc::Receiver<SyncEvent>,
    mpsc::Receiver<SyncCommand>,
    SyncOrchestrator,
) {
    let capacity = config.channel_capacity.max(1);
    let (command_tx, command_rx) = mpsc::channel(capacity);
    let (event_tx, event_rx) = mpsc::channel(capacity);
    let (health_tx, health_rx) = watch::channel(SyncHealth::default());

    let handle = OrchestratorHandle {
        command_tx,
        health_rx,
    };

    let was_online = *connectivity.borrow();
    let orchestrator = SyncOrchestrator {
        outbox: Outbox::new(store.clone(), config.clone()),
        store,
        remote,
        session,
        was_online,
        connectivity,
        connectivity_open: true,
        config,
        state: SyncState::Idle,
        degraded: false,
        last_error: None,
        event_tx,
        health_tx,
    };

    (handle, event_rx, command_rx, orchestrator)
}

impl SyncOrchestrator {
    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// Runs until shutdown or until every handle is dropped.
    ///
    /// Boots with a cycle when a session exists and the device is online, then
    /// syncs on each offline-to-online transition and on explicit requests.
    pub async fn run(mut self, mut command_rx: mpsc::Receiver<SyncCommand>) {
        info!("[SYNC] orchestrator started");
        self.publish_health().await;
        self.was_online = *self.connectivity.borrow_and_update();

        if self.can_sync() {
            if !self.run_coalesced(SyncTrigger::Boot, &mut command_rx).await {
                info!("[SYNC] orchestrator stopped");
                return;
            }
        } else {
            debug!("[SYNC] boot sync skipped (offline or no session)");
        }

        loop {
            tokio::select! {
                cmd = command_rx.recv() => match cmd {
                    Some(SyncCommand::Trigger(trigger)) => {
                        if !self.can_sync() {
                            debug!("[SYNC] {trigger:?} deferred until online with a session");
                            continue;
                        }
                        if !self.run_coalesced(trigger, &mut command_rx).await {
                            break;
                        }
                    }
                    Some(SyncCommand::Shutdown) | None => break,
                },
                changed = self.connectivity.changed(), if self.connectivity_open => {
                    if changed.is_err() {
                        warn!("[SYNC] connectivity monitor dropped");
                        self.connectivity_open = false;
                        continue;
                    }
                    if self.observe_connectivity() && self.can_sync()
                        && !self.run_coalesced(SyncTrigger::ConnectivityRestored, &mut command_rx).await
                    {
                        break;
                    }
                }
            }
        }

        info!("[SYNC] orchestrator stopped");
    }

    /// Runs a cycle, then at most one more for whatever arrived meanwhile.
    /// Returns `false` when a shutdown was received.
    async fn run_coalesced(
        &mut self,
        first: SyncTrigger,
        command_rx: &mut mpsc::Receiver<SyncCommand>,
    ) -> bool {
        let mut trigger = first;
        loop {
            self.run_cycle(trigger).await;

            let mut rerun = None;
            let mut stop = false;
            while let Ok(cmd) = command_rx.try_recv() {
                match cmd {
                    SyncCommand::Trigger(t) => {
                        rerun.get_or_insert(t);
                    }
                    SyncCommand::Shutdown => stop = true,
                }
            }
            if self.connectivity_open
                && self.connectivity.has_changed().unwrap_or(false)
                && self.observe_connectivity()
            {
                rerun.get_or_insert(SyncTrigger::ConnectivityRestored);
            }

            if stop {
                return false;
            }
            match rerun {
                Some(next) if self.can_sync() => {
                    debug!("[SYNC] running coalesced follow-up cycle ({next:?})");
                    trigger = next;
                }
                _ => return true,
            }
        }
    }

    /// Marks the connectivity change as seen. Returns `true` on an
    /// offline-to-online transition.
    fn observe_connectivity(&mut self) -> bool {
        let online = *self.connectivity.borrow_and_update();
        let restored = online && !self.was_online;
        self.was_online = online;
        restored
    }

    fn can_sync(&self) -> bool {
        *self.connectivity.borrow() && self.session.has_valid_session()
    }

    /// Runs one full cycle: drain, pull, merge.
    ///
    /// `last_sync_at` advances only when pull and merge both completed, and
    /// only to the newest remote `updated_at` seen, so the watermark is on the
    /// remote's clock and never moves backward.
    pub async fn run_cycle(&mut self, trigger: SyncTrigger) -> CycleReport {
        info!("[SYNC] cycle started ({trigger:?})");
        self.emit(SyncEvent::CycleStarted { trigger });
        let mut report = CycleReport::new(trigger);

        match self.cycle_steps(&mut report).await {
            Ok(()) => {
                self.degraded = false;
                self.last_error = None;
                self.set_state(SyncState::Idle);
                info!(
                    "[SYNC] cycle done: sent={} pulled={} conflicts={}",
                    report.drain.sent,
                    report.pulled,
                    report.conflicts.len()
                );
                self.publish_health().await;
                self.emit(SyncEvent::CycleCompleted {
                    report: report.clone(),
                });
            }
            Err(e) => {
                let degraded = e.is_degraded();
                if degraded {
                    error!("[SYNC] cycle failed, local store degraded: {e}");
                } else {
                    warn!("[SYNC] cycle failed: {e}");
                }
                report.error = Some(e.to_string());
                self.degraded = degraded;
                self.last_error = Some(e.to_string());
                self.set_state(SyncState::Failed);
                self.emit(SyncEvent::CycleFailed {
                    error: e.to_string(),
                    degraded,
                });
                self.set_state(SyncState::Idle);
                self.publish_health().await;
            }
        }
        report
    }

    async fn cycle_steps(&mut self, report: &mut CycleReport) -> SyncResult<()> {
        self.set_state(SyncState::DrainingOutbox);
        report.drain = self.outbox.drain(self.remote.as_ref()).await?;

        self.set_state(SyncState::PullingRemote);
        let since = with_store(&self.store, |store| store.last_sync_at()).await?;
        let records = with_timeout(
            self.config.remote_timeout(),
            self.remote.pull_changes_since(since),
        )
        .await?;
        report.pulled = records.len();
        debug!("[SYNC] pulled {} records since {since:?}", records.len());

        let watermark = records.iter().map(|r| r.updated_at).chain(since).max();

        self.set_state(SyncState::Merging);
        for record in records {
            let outcome = with_store(&self.store, move |store| store.apply_remote(&record)).await?;
            if let MergeOutcome::Conflict(entity_id) = outcome {
                self.emit(SyncEvent::ConflictDetected { entity_id });
            }
            report.absorb(outcome);
        }

        if let Some(mark) = watermark.filter(|mark| Some(*mark) != since) {
            with_store(&self.store, move |store| store.set_last_sync_at(mark)).await?;
        }
        report.last_sync_at = watermark;
        Ok(())
    }

    fn set_state(&mut self, state: SyncState) {
        if self.state != state {
            self.state = state;
            self.emit(SyncEvent::StateChanged { state });
        }
    }

    /// Recomputes the health snapshot from the store.
    async fn publish_health(&mut self) {
        let snapshot = with_store(&self.store, |store| {
            Ok((store.sync_counts()?, store.last_sync_at()?))
        })
        .await;

        let health = match snapshot {
            Ok((counts, last_sync_at)) => SyncHealth {
                state: self.state,
                last_sync_at,
                unsynced: counts.unsynced(),
                failed: counts.failed,
                conflicts: counts.conflict,
                degraded: self.degraded,
                last_error: self.last_error.clone(),
            },
            Err(e) => {
                error!("[SYNC] cannot read sync counts: {e}");
                SyncHealth {
                    state: self.state,
                    degraded: true,
                    last_error: Some(e.to_string()),
                    ..self.health_tx.borrow().clone()
                }
            }
        };
        self.health_tx.send_replace(health);
    }

    fn emit(&self, event: SyncEvent) {
        // Dropped when nobody listens or the listener falls behind.
        if let Err(e) = self.event_tx.try_send(event) {
            debug!("[SYNC] event not delivered: {e}");
        }
    }
}
