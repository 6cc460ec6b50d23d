//! Sync orchestrator tests.

mod support;

use fieldsync_storage::LocalStore;
use fieldsync_sync::logging::init_logging;
use fieldsync_sync::{
    ConflictResolution, ConnectivityMonitor, DebugOverrides, EntityRepository, OrchestratorHandle,
    Reachability, RemoteError, SyncConfig, SyncEvent, SyncOrchestrator, SyncState, SyncTrigger,
    create_orchestrator,
};
use fieldsync_types::SyncStatus;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use support::{MockRemote, RemoteCall, StaticSession, doc, remote_record};
use tokio::sync::mpsc;
use tokio::time::timeout;

struct Harness {
    store: LocalStore,
    repo: EntityRepository,
    monitor: ConnectivityMonitor,
    handle: OrchestratorHandle,
    events: mpsc::Receiver<SyncEvent>,
    commands: Option<mpsc::Receiver<fieldsync_sync::SyncCommand>>,
    orchestrator: Option<SyncOrchestrator>,
}

fn harness(remote: Arc<MockRemote>, session: Arc<StaticSession>, online: bool) -> Harness {
    init_logging();
    let store = LocalStore::open_in_memory().unwrap();
    let monitor = ConnectivityMonitor::new(DebugOverrides::new());
    if online {
        monitor.report(Reachability::online());
    }
    let config = SyncConfig {
        channel_capacity: 256,
        ..SyncConfig::default()
    };
    let (handle, events, commands, orchestrator) =
        create_orchestrator(store.clone(), remote, session, monitor.subscribe(), config);
    Harness {
        repo: EntityRepository::new(store.clone()),
        store,
        monitor,
        handle,
        events,
        commands: Some(commands),
        orchestrator: Some(orchestrator),
    }
}

impl Harness {
    fn orchestrator(&mut self) -> &mut SyncOrchestrator {
        self.orchestrator.as_mut().unwrap()
    }

    /// Spawns the run loop and waits until it has published its first health snapshot.
    async fn spawn(&mut self) -> tokio::task::JoinHandle<()> {
        let orchestrator = self.orchestrator.take().unwrap();
        let commands = self.commands.take().unwrap();
        let mut health = self.handle.subscribe_health();
        let task = tokio::spawn(orchestrator.run(commands));
        timeout(Duration::from_secs(5), health.changed())
            .await
            .expect("orchestrator never started")
            .unwrap();
        task
    }

    fn drain_events(&mut self) -> Vec<SyncEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    async fn next_cycle_end(&mut self) -> SyncEvent {
        timeout(Duration::from_secs(5), async {
            loop {
                match self.events.recv().await {
                    Some(
                        event @ (SyncEvent::CycleCompleted { .. } | SyncEvent::CycleFailed { .. }),
                    ) => return event,
                    Some(_) => continue,
                    None => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("no cycle finished in time")
    }
}

fn states(events: &[SyncEvent]) -> Vec<SyncState> {
    events
        .iter()
        .filter_map(|event| match event {
            SyncEvent::StateChanged { state } => Some(*state),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn offline_create_syncs_on_next_cycle() {
    let remote = MockRemote::new();
    let mut h = harness(remote.clone(), StaticSession::signed_in(), true);
    let created = h.repo.create("visit", doc(json!({"site": "ridge"}))).unwrap();
    assert_eq!(created.sync_status, SyncStatus::Pending);
    assert!(created.server_id.is_none());

    let report = h.orchestrator().run_cycle(SyncTrigger::UserRefresh).await;

    assert!(report.succeeded());
    assert_eq!(report.drain.sent, 1);
    // Nothing pulled yet, so there is no remote watermark.
    assert!(report.last_sync_at.is_none());
    let synced = h.repo.get(&created.id).unwrap().unwrap();
    assert_eq!(synced.server_id.as_deref(), Some("srv-1"));
    assert_eq!(synced.sync_status, SyncStatus::Synced);
    assert_eq!(h.store.last_sync_at().unwrap(), report.last_sync_at);

    let health = h.handle.health();
    assert_eq!(health.state, SyncState::Idle);
    assert_eq!(health.unsynced, 0);
    assert_eq!(health.last_sync_at, report.last_sync_at);
    assert!(!health.degraded);
}

#[tokio::test]
async fn cycle_walks_the_state_machine() {
    let remote = MockRemote::new();
    let mut h = harness(remote, StaticSession::signed_in(), true);

    h.orchestrator().run_cycle(SyncTrigger::Boot).await;

    let events = h.drain_events();
    assert!(matches!(
        events.first(),
        Some(SyncEvent::CycleStarted {
            trigger: SyncTrigger::Boot
        })
    ));
    assert_eq!(
        states(&events),
        vec![
            SyncState::DrainingOutbox,
            SyncState::PullingRemote,
            SyncState::Merging,
            SyncState::Idle,
        ]
    );
    assert!(matches!(events.last(), Some(SyncEvent::CycleCompleted { .. })));
}

#[tokio::test]
async fn pulled_records_are_merged() {
    let remote = MockRemote::new();
    let mut h = harness(remote.clone(), StaticSession::signed_in(), true);
    let local = h.repo.create("visit", doc(json!({"v": 1}))).unwrap();
    h.orchestrator().run_cycle(SyncTrigger::Boot).await;

    remote.queue_pull(Ok(vec![
        remote_record("srv-1", json!({"v": "edited elsewhere"})),
        remote_record("srv-77", json!({"v": "new"})),
    ]));
    let report = h.orchestrator().run_cycle(SyncTrigger::UserRefresh).await;

    assert_eq!(report.pulled, 2);
    assert_eq!(report.overwritten, 1);
    assert_eq!(report.inserted, 1);
    assert_eq!(
        h.repo.get(&local.id).unwrap().unwrap().payload,
        doc(json!({"v": "edited elsewhere"}))
    );
    let inserted = h.store.get_by_server_id("srv-77").unwrap().unwrap();
    assert_eq!(inserted.sync_status, SyncStatus::Synced);
}

#[tokio::test]
async fn divergent_remote_change_becomes_a_conflict() {
    let remote = MockRemote::new();
    let mut h = harness(remote.clone(), StaticSession::signed_in(), true);
    let local = h.repo.create("visit", doc(json!({"v": 1}))).unwrap();
    h.orchestrator().run_cycle(SyncTrigger::Boot).await;
    h.drain_events();

    h.repo.update(&local.id, doc(json!({"v": "mine"}))).unwrap();
    remote.script_push([Some(RemoteError::Unreachable("flaky".into()))]);
    remote.queue_pull(Ok(vec![remote_record("srv-1", json!({"v": "theirs"}))]));

    let report = h.orchestrator().run_cycle(SyncTrigger::UserRefresh).await;

    assert!(report.succeeded());
    assert_eq!(report.conflicts, vec![local.id]);
    let events = h.drain_events();
    assert!(events.iter().any(|event| matches!(
        event,
        SyncEvent::ConflictDetected { entity_id } if *entity_id == local.id
    )));
    let conflicted = h.repo.get(&local.id).unwrap().unwrap();
    assert_eq!(conflicted.sync_status, SyncStatus::Conflict);
    assert_eq!(conflicted.payload, doc(json!({"v": "mine"})));
    assert_eq!(h.handle.health().conflicts, 1);

    // Conflicted writes are held until resolved.
    let held = h.orchestrator().run_cycle(SyncTrigger::UserRefresh).await;
    assert_eq!(held.drain.skipped, 1);

    let resolved = h
        .repo
        .resolve_conflict(&local.id, ConflictResolution::TakeRemote)
        .unwrap()
        .unwrap();
    assert_eq!(resolved.payload, doc(json!({"v": "theirs"})));
    assert_eq!(resolved.sync_status, SyncStatus::Synced);
    assert!(h.store.outbox_entries_for(&local.id).unwrap().is_empty());
}

#[tokio::test]
async fn keep_local_resolution_pushes_on_next_cycle() {
    let remote = MockRemote::new();
    let mut h = harness(remote.clone(), StaticSession::signed_in(), true);
    let local = h.repo.create("visit", doc(json!({"v": 1}))).unwrap();
    h.orchestrator().run_cycle(SyncTrigger::Boot).await;

    h.repo.update(&local.id, doc(json!({"v": "mine"}))).unwrap();
    remote.script_push([Some(RemoteError::Unreachable("flaky".into()))]);
    remote.queue_pull(Ok(vec![remote_record("srv-1", json!({"v": "theirs"}))]));
    h.orchestrator().run_cycle(SyncTrigger::UserRefresh).await;

    let kept = h
        .repo
        .resolve_conflict(&local.id, ConflictResolution::KeepLocal)
        .unwrap()
        .unwrap();
    assert_eq!(kept.sync_status, SyncStatus::Pending);

    let report = h.orchestrator().run_cycle(SyncTrigger::UserRefresh).await;
    assert_eq!(report.drain.sent, 1);
    assert_eq!(remote.record("srv-1"), Some(doc(json!({"v": "mine"}))));
    assert_eq!(
        h.repo.get(&local.id).unwrap().unwrap().sync_status,
        SyncStatus::Synced
    );
}

#[tokio::test]
async fn watermark_follows_remote_clock_not_device_clock() {
    let remote = MockRemote::new();
    let mut h = harness(remote.clone(), StaticSession::signed_in(), true);
    // Remote clock an hour behind the device.
    let server_time = chrono::Utc::now() - chrono::Duration::hours(1);
    let mut record = remote_record("srv-60", json!({"v": 1}));
    record.updated_at = server_time;
    remote.queue_pull(Ok(vec![record]));

    let report = h.orchestrator().run_cycle(SyncTrigger::Boot).await;

    assert!(report.succeeded());
    assert_eq!(report.last_sync_at, Some(server_time));
    assert_eq!(h.store.last_sync_at().unwrap(), Some(server_time));

    h.orchestrator().run_cycle(SyncTrigger::UserRefresh).await;
    assert_eq!(
        remote.calls().last(),
        Some(&RemoteCall::Pull {
            since: Some(server_time)
        })
    );
}

#[tokio::test]
async fn watermark_never_moves_backward() {
    let remote = MockRemote::new();
    let mut h = harness(remote.clone(), StaticSession::signed_in(), true);
    let mark = chrono::Utc::now();
    h.store.set_last_sync_at(mark).unwrap();

    let mut stale = remote_record("srv-61", json!({"v": 1}));
    stale.updated_at = mark - chrono::Duration::hours(2);
    remote.queue_pull(Ok(vec![stale]));
    let report = h.orchestrator().run_cycle(SyncTrigger::UserRefresh).await;

    assert!(report.succeeded());
    assert_eq!(report.inserted, 1);
    assert_eq!(report.last_sync_at, Some(mark));
    assert_eq!(h.store.last_sync_at().unwrap(), Some(mark));

    // An empty pull keeps the watermark too.
    let empty = h.orchestrator().run_cycle(SyncTrigger::UserRefresh).await;
    assert_eq!(empty.last_sync_at, Some(mark));
    assert_eq!(h.store.last_sync_at().unwrap(), Some(mark));
}

#[tokio::test]
async fn failed_pull_keeps_last_sync_at() {
    let remote = MockRemote::new();
    let mut h = harness(remote.clone(), StaticSession::signed_in(), true);
    remote.queue_pull(Ok(vec![remote_record("srv-40", json!({"v": "seed"}))]));
    let first = h.orchestrator().run_cycle(SyncTrigger::Boot).await;
    let mark = first.last_sync_at;
    assert!(mark.is_some());
    h.drain_events();

    h.repo.create("visit", doc(json!({"v": 1}))).unwrap();
    remote.queue_pull(Err(RemoteError::Unreachable("gateway timeout".into())));
    let failed = h.orchestrator().run_cycle(SyncTrigger::UserRefresh).await;

    assert!(!failed.succeeded());
    assert!(failed.last_sync_at.is_none());
    // The drain half of the cycle still happened.
    assert_eq!(failed.drain.sent, 1);
    assert_eq!(h.store.last_sync_at().unwrap(), mark);

    let events = h.drain_events();
    assert_eq!(
        states(&events),
        vec![
            SyncState::DrainingOutbox,
            SyncState::PullingRemote,
            SyncState::Failed,
            SyncState::Idle,
        ]
    );
    assert!(events.iter().any(|event| matches!(
        event,
        SyncEvent::CycleFailed { degraded: false, .. }
    )));

    let health = h.handle.health();
    assert_eq!(health.last_sync_at, mark);
    assert!(!health.degraded);
    assert!(health.last_error.as_deref().unwrap().contains("gateway timeout"));

    // The next good cycle pulls from the old mark and clears the error.
    let recovered = h.orchestrator().run_cycle(SyncTrigger::UserRefresh).await;
    assert!(recovered.succeeded());
    let pulls: Vec<_> = remote
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            RemoteCall::Pull { since } => Some(since),
            _ => None,
        })
        .collect();
    assert_eq!(pulls, vec![None, mark, mark]);
    assert!(h.handle.health().last_error.is_none());
}

#[tokio::test]
async fn boot_syncs_when_online_with_session() {
    let remote = MockRemote::new();
    let mut h = harness(remote.clone(), StaticSession::signed_in(), true);
    let created = h.repo.create("visit", doc(json!({"v": 1}))).unwrap();
    let task = h.spawn().await;

    let end = h.next_cycle_end().await;
    assert!(matches!(end, SyncEvent::CycleCompleted { ref report } if report.trigger == SyncTrigger::Boot));
    assert!(h.repo.get(&created.id).unwrap().unwrap().is_synced());

    h.handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn nothing_runs_without_a_session() {
    let remote = MockRemote::new();
    let mut h = harness(remote.clone(), StaticSession::signed_out(), true);
    h.repo.create("visit", doc(json!({"v": 1}))).unwrap();
    let task = h.spawn().await;

    h.handle.request_sync().await.unwrap();
    h.handle.shutdown().await.unwrap();
    task.await.unwrap();

    assert_eq!(remote.pull_count(), 0);
    assert!(remote.push_calls().is_empty());
    assert_eq!(h.store.outbox_len().unwrap(), 1);
}

#[tokio::test]
async fn reconnect_triggers_a_cycle() {
    let remote = MockRemote::new();
    let mut h = harness(remote.clone(), StaticSession::signed_in(), false);
    let created = h.repo.create("visit", doc(json!({"v": 1}))).unwrap();
    let task = h.spawn().await;

    h.handle.request_sync().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(remote.pull_count(), 0);
    h.monitor.report(Reachability::online());

    let end = h.next_cycle_end().await;
    assert!(matches!(
        end,
        SyncEvent::CycleCompleted { ref report } if report.trigger == SyncTrigger::ConnectivityRestored
    ));
    assert!(h.repo.get(&created.id).unwrap().unwrap().is_synced());

    h.handle.shutdown().await.unwrap();
    task.await.unwrap();
    assert_eq!(remote.pull_count(), 1);
}

#[cfg(any(debug_assertions, feature = "debug-tools"))]
#[tokio::test]
async fn forced_offline_defers_until_lifted() {
    let remote = MockRemote::new();
    let mut h = harness(remote.clone(), StaticSession::signed_in(), true);
    h.monitor.set_forced_offline(true);
    let task = h.spawn().await;

    h.handle.request_sync().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(remote.pull_count(), 0);
    h.monitor.set_forced_offline(false);

    let end = h.next_cycle_end().await;
    assert!(matches!(
        end,
        SyncEvent::CycleCompleted { ref report } if report.trigger == SyncTrigger::ConnectivityRestored
    ));

    h.handle.shutdown().await.unwrap();
    task.await.unwrap();
    assert_eq!(remote.pull_count(), 1);
}

#[tokio::test]
async fn triggers_during_a_cycle_coalesce_into_one_rerun() {
    let (remote, started, release) = MockRemote::with_pull_gate();
    let mut h = harness(remote.clone(), StaticSession::signed_in(), true);
    let task = h.spawn().await;

    timeout(Duration::from_secs(5), started.notified())
        .await
        .expect("boot cycle never pulled");
    for _ in 0..5 {
        h.handle.request_sync().await.unwrap();
    }
    release.notify_one();

    let first = h.next_cycle_end().await;
    let second = h.next_cycle_end().await;
    assert!(matches!(first, SyncEvent::CycleCompleted { ref report } if report.trigger == SyncTrigger::Boot));
    assert!(matches!(second, SyncEvent::CycleCompleted { ref report } if report.trigger == SyncTrigger::UserRefresh));

    h.handle.shutdown().await.unwrap();
    task.await.unwrap();
    assert_eq!(remote.pull_count(), 2);
}

#[tokio::test]
async fn handle_reports_closed_orchestrator() {
    let remote = MockRemote::new();
    let mut h = harness(remote, StaticSession::signed_in(), false);
    let task = h.spawn().await;
    h.handle.shutdown().await.unwrap();
    task.await.unwrap();

    assert!(matches!(
        h.handle.request_sync().await,
        Err(fieldsync_sync::SyncError::ChannelClosed)
    ));
}
