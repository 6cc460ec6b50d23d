//! Sync engine for FieldSync.
//!
//! Reconciles the local store with a remote authority:
//! - [`connectivity`]: reachability plus the debug forced-offline override
//! - [`outbox`]: durable per-entity ordered queue of local writes, and its drain
//! - [`orchestrator`]: sync cycles, run one at a time
//! - [`repository`]: the local-first read/write surface the UI talks to
//!
//! The remote authority and the session check are capabilities supplied by
//! the caller ([`RemoteAuthority`], [`SessionProvider`]); transport is not
//! this crate's concern.

mod blocking;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod outbox;
pub mod remote;
pub mod repository;

pub use config::SyncConfig;
pub use connectivity::{ConnectivityMonitor, DebugOverrides, Reachability};
pub use error::{SyncError, SyncResult};
pub use orchestrator::{
    CycleReport, OrchestratorHandle, SyncCommand, SyncEvent, SyncHealth, SyncOrchestrator,
    SyncState, SyncTrigger, create_orchestrator,
};
pub use outbox::{DrainReport, Outbox};
pub use remote::{RemoteAuthority, RemoteError, SessionProvider};
pub use repository::{ConflictResolution, EntityRepository};
