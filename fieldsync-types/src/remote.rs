//! Records as reported by the remote authority.

use crate::entity::Payload;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An authoritative record returned by a pull.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub server_id: String,
    pub entity_type: String,
    pub payload: Payload,
    pub updated_at: DateTime<Utc>,
    /// The record was deleted on the remote side.
    #[serde(default)]
    pub deleted: bool,
}
