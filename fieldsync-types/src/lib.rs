//! Shared record types for FieldSync.
//!
//! These are the values that flow between the local store, the outbox and
//! the sync orchestrator:
//! - [`EntityRecord`]: a locally owned domain object with its sync state
//! - [`OutboxEntry`]: one durable mutation intent awaiting acknowledgment
//! - [`RemoteRecord`]: an authoritative record pulled from the remote side
//!
//! Entity payloads are opaque to the data layer; see [`Payload`].

mod entity;
mod outbox;
mod remote;

pub use entity::{EntityId, EntityRecord, Payload, SyncStatus};
pub use outbox::{OperationType, OutboxEntry};
pub use remote::RemoteRecord;

use thiserror::Error;

/// Error returned when parsing one of the textual enum forms stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} value: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}
