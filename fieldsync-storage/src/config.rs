//! Local store configuration.

use serde::{Deserialize, Serialize};

/// Configuration for opening a [`LocalStore`](crate::LocalStore).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    /// DuckDB memory cap (e.g., "128MB"). Phones cannot afford the default.
    pub memory_limit: String,

    /// DuckDB worker threads.
    pub threads: u32,

    /// How many times a failing migration step is retried before the store
    /// falls back to a full reset.
    pub migration_retries: u32,

    /// Named one-shot reset. When set and the `reset_applied` metadata key does
    /// not already hold this marker, the store is reset once on open and the
    /// marker recorded. `None` means normal start with no reset.
    pub one_shot_reset: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            memory_limit: "128MB".to_string(),
            threads: 1,
            migration_retries: 1,
            one_shot_reset: None,
        }
    }
}
