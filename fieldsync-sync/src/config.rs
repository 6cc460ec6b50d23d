//! Sync configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the outbox drain and the sync orchestrator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Attempts after which an unreachable entry marks its entity `FAILED`.
    pub max_attempts: u32,

    /// Bound on every remote call, in milliseconds. Exceeding it counts as unreachable.
    pub remote_timeout_ms: u64,

    /// Entities drained concurrently. Entries of one entity are always sequential.
    pub max_concurrent_entities: usize,

    /// Capacity of the orchestrator command and event channels.
    pub channel_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            remote_timeout_ms: 15_000,
            max_concurrent_entities: 4,
            channel_capacity: 64,
        }
    }
}

impl SyncConfig {
    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }
}
