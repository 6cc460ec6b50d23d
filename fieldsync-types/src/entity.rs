//! Entity records and their sync state.

use crate::ParseEnumError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Client-generated identifier of an entity. Immutable for the record's lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(Uuid);

impl EntityId {
    /// Generates a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for EntityId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Opaque entity content.
///
/// The data layer stores, ships and compares payloads but never looks inside
/// them. Field-level meaning belongs to the application.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Payload {
    Json(serde_json::Value),
    Binary(Vec<u8>),
}

impl Payload {
    pub fn json(value: serde_json::Value) -> Self {
        Self::Json(value)
    }

    /// Returns the JSON value if this is a JSON payload.
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(v) => Some(v),
            Self::Binary(_) => None,
        }
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

/// Reconciliation state of an entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    /// Local changes are waiting in the outbox.
    Pending,
    /// An outbox entry for this entity is in flight.
    Syncing,
    /// Local and remote agree.
    Synced,
    /// Both sides changed since the last sync; needs external resolution.
    Conflict,
    /// The remote rejected a write, or retries hit the ceiling.
    Failed,
}

impl SyncStatus {
    pub const ALL: [SyncStatus; 5] = [
        SyncStatus::Pending,
        SyncStatus::Syncing,
        SyncStatus::Synced,
        SyncStatus::Conflict,
        SyncStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Syncing => "SYNCING",
            Self::Synced => "SYNCED",
            Self::Conflict => "CONFLICT",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "SYNCING" => Ok(Self::Syncing),
            "SYNCED" => Ok(Self::Synced),
            "CONFLICT" => Ok(Self::Conflict),
            "FAILED" => Ok(Self::Failed),
            other => Err(ParseEnumError {
                kind: "sync status",
                value: other.to_string(),
            }),
        }
    }
}

/// A domain object held by the local store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: EntityId,
    /// Domain type, e.g. `service_order`, `client`, `expense`.
    pub entity_type: String,
    /// Assigned once by the remote authority on first acknowledged create.
    pub server_id: Option<String>,
    pub payload: Payload,
    /// Incremented by the store on every local write.
    pub local_version: i64,
    pub sync_status: SyncStatus,
    pub updated_at: DateTime<Utc>,
    /// Tombstone kept until the deletion is acknowledged remotely.
    pub deleted_locally: bool,
}

impl EntityRecord {
    /// Creates a fresh, never-synced record.
    pub fn new(entity_type: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: EntityId::new(),
            entity_type: entity_type.into(),
            server_id: None,
            payload,
            local_version: 0,
            sync_status: SyncStatus::Pending,
            updated_at: Utc::now(),
            deleted_locally: false,
        }
    }

    pub fn is_synced(&self) -> bool {
        self.sync_status == SyncStatus::Synced
    }
}
