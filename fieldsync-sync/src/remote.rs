//! Capabilities supplied by the host application.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fieldsync_types::{Payload, RemoteRecord};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Failure reported by the remote authority.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// Network down, server unavailable, or the call timed out. Retried on a later cycle.
    #[error("remote unreachable: {0}")]
    Unreachable(String),

    /// The authority refused the operation (e.g. validation). Not retried automatically.
    #[error("remote rejected the operation: {0}")]
    Rejected(String),
}

/// The remote source of truth.
#[async_trait]
pub trait RemoteAuthority: Send + Sync {
    /// Creates a record and returns the id the authority assigned to it.
    async fn create_remote(&self, entity_type: &str, payload: &Payload)
    -> Result<String, RemoteError>;

    async fn update_remote(&self, server_id: &str, payload: &Payload) -> Result<(), RemoteError>;

    async fn delete_remote(&self, server_id: &str) -> Result<(), RemoteError>;

    /// Records modified after `since`; everything when `since` is `None`.
    async fn pull_changes_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RemoteRecord>, RemoteError>;
}

/// Reports whether an authenticated session exists.
pub trait SessionProvider: Send + Sync {
    fn has_valid_session(&self) -> bool;
}

/// Bounds a remote call; a timeout is reported as [`RemoteError::Unreachable`].
pub(crate) async fn with_timeout<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, RemoteError>>,
) -> Result<T, RemoteError> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::Unreachable(format!(
            "no response within {}ms",
            limit.as_millis()
        ))),
    }
}
