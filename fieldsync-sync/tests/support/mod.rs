//! Shared test doubles for the sync integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fieldsync_sync::{RemoteAuthority, RemoteError, SessionProvider};
use fieldsync_types::{Payload, RemoteRecord};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// One call observed by [`MockRemote`].
#[derive(Clone, Debug, PartialEq)]
pub enum RemoteCall {
    Create { entity_type: String, payload: Payload },
    Update { server_id: String, payload: Payload },
    Delete { server_id: String },
    Pull { since: Option<DateTime<Utc>> },
}

#[derive(Default)]
struct MockState {
    next_id: u64,
    records: HashMap<String, (String, Payload)>,
    calls: Vec<RemoteCall>,
    delivered: Vec<RemoteCall>,
    /// Scripted results for the next push calls; `None` means succeed.
    push_script: VecDeque<Option<RemoteError>>,
    pull_responses: VecDeque<Result<Vec<RemoteRecord>, RemoteError>>,
    push_delay: Option<Duration>,
}

/// In-memory remote authority that records every call.
#[derive(Default)]
pub struct MockRemote {
    state: Mutex<MockState>,
    offline: AtomicBool,
    pulls: AtomicUsize,
    gate: Option<PullGate>,
    gate_used: AtomicBool,
}

/// Holds the first pull until released, so tests can act mid-cycle.
pub struct PullGate {
    pub started: Arc<Notify>,
    pub release: Arc<Notify>,
}

impl MockRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_pull_gate() -> (Arc<Self>, Arc<Notify>, Arc<Notify>) {
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let remote = Self {
            gate: Some(PullGate {
                started: started.clone(),
                release: release.clone(),
            }),
            ..Self::default()
        };
        (Arc::new(remote), started, release)
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Queues outcomes for upcoming create/update/delete calls.
    pub fn script_push(&self, results: impl IntoIterator<Item = Option<RemoteError>>) {
        self.state.lock().unwrap().push_script.extend(results);
    }

    pub fn queue_pull(&self, result: Result<Vec<RemoteRecord>, RemoteError>) {
        self.state.lock().unwrap().pull_responses.push_back(result);
    }

    pub fn set_push_delay(&self, delay: Duration) {
        self.state.lock().unwrap().push_delay = Some(delay);
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Push calls that succeeded, in the order the remote applied them.
    pub fn delivered(&self) -> Vec<RemoteCall> {
        self.state.lock().unwrap().delivered.clone()
    }

    pub fn push_calls(&self) -> Vec<RemoteCall> {
        self.calls()
            .into_iter()
            .filter(|c| !matches!(c, RemoteCall::Pull { .. }))
            .collect()
    }

    pub fn pull_count(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    /// Payload the remote currently holds for `server_id`.
    pub fn record(&self, server_id: &str) -> Option<Payload> {
        self.state
            .lock()
            .unwrap()
            .records
            .get(server_id)
            .map(|(_, payload)| payload.clone())
    }

    pub fn record_count(&self) -> usize {
        self.state.lock().unwrap().records.len()
    }

    async fn before_push(&self, call: &RemoteCall) -> Result<(), RemoteError> {
        let (delay, scripted) = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(call.clone());
            (state.push_delay, state.push_script.pop_front().flatten())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::Unreachable("network down".into()));
        }
        match scripted {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteAuthority for MockRemote {
    async fn create_remote(
        &self,
        entity_type: &str,
        payload: &Payload,
    ) -> Result<String, RemoteError> {
        let call = RemoteCall::Create {
            entity_type: entity_type.to_string(),
            payload: payload.clone(),
        };
        self.before_push(&call).await?;
        let mut state = self.state.lock().unwrap();
        state.delivered.push(call);
        state.next_id += 1;
        let server_id = format!("srv-{}", state.next_id);
        state
            .records
            .insert(server_id.clone(), (entity_type.to_string(), payload.clone()));
        Ok(server_id)
    }

    async fn update_remote(&self, server_id: &str, payload: &Payload) -> Result<(), RemoteError> {
        let call = RemoteCall::Update {
            server_id: server_id.to_string(),
            payload: payload.clone(),
        };
        self.before_push(&call).await?;
        let mut state = self.state.lock().unwrap();
        match state.records.get_mut(server_id) {
            Some(record) => {
                record.1 = payload.clone();
                state.delivered.push(call);
                Ok(())
            }
            None => Err(RemoteError::Rejected(format!("unknown record {server_id}"))),
        }
    }

    async fn delete_remote(&self, server_id: &str) -> Result<(), RemoteError> {
        let call = RemoteCall::Delete {
            server_id: server_id.to_string(),
        };
        self.before_push(&call).await?;
        let mut state = self.state.lock().unwrap();
        state.records.remove(server_id);
        state.delivered.push(call);
        Ok(())
    }

    async fn pull_changes_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RemoteRecord>, RemoteError> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        self.state
            .lock()
            .unwrap()
            .calls
            .push(RemoteCall::Pull { since });

        if let Some(gate) = &self.gate {
            if !self.gate_used.swap(true, Ordering::SeqCst) {
                gate.started.notify_one();
                gate.release.notified().await;
            }
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::Unreachable("network down".into()));
        }
        self.state
            .lock()
            .unwrap()
            .pull_responses
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

/// Session provider with a switchable answer.
pub struct StaticSession(AtomicBool);

impl StaticSession {
    pub fn signed_in() -> Arc<Self> {
        Arc::new(Self(AtomicBool::new(true)))
    }

    pub fn signed_out() -> Arc<Self> {
        Arc::new(Self(AtomicBool::new(false)))
    }
}

impl SessionProvider for StaticSession {
    fn has_valid_session(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub fn doc(value: serde_json::Value) -> Payload {
    Payload::Json(value)
}

pub fn remote_record(server_id: &str, value: serde_json::Value) -> RemoteRecord {
    RemoteRecord {
        server_id: server_id.to_string(),
        entity_type: "visit".to_string(),
        payload: Payload::Json(value),
        updated_at: Utc::now(),
        deleted: false,
    }
}
