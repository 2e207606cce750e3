//! Workitems crate - multi-source reconciliation and sync engine
//!
//! Pulls tasks, calendar events, email threads and pull requests from
//! linked provider accounts and keeps one canonical record per
//! (user, external id, source):
//! - Domain models (CanonicalRecord, Email, SyncCursor, JobLock)
//! - Provider adapters behind a capability-gated registry
//! - Record store abstraction with SQLite and in-memory backends
//! - Reconciler with set-on-insert fields and ordering reset rules
//! - Incremental thread sync and parallel multi-account fan-out
//! - Run-once job locks and user-initiated actions
//!
//! The crate has no UI dependencies; a host builds an [`EngineContext`]
//! once and drives everything through it.

pub mod actions;
pub mod config;
pub mod context;
pub mod error;
pub mod jobs;
pub mod models;
pub mod providers;
pub mod reconcile;
pub mod storage;
pub mod sync;

pub use actions::ActionHandler;
pub use config::EngineConfig;
pub use context::{EngineContext, default_registry};
pub use error::{ProviderError, SyncError, SyncResult};
pub use jobs::JobLockManager;
pub use models::{
    AccountId, CanonicalRecord, Email, EmailAddress, Granularity, JobLock, Payload, RecordId,
    RecordKey, RecordKind, SourceId, SyncCursor, UserId,
};
pub use providers::{
    Capability, CapabilitySet, CredentialStore, FetchedItem, Provider, ProviderContext,
    ProviderRegistry, ThreadSource,
};
pub use reconcile::{NewRecord, RecordFilter, RecordUpdate, Reconciled, Reconciler};
pub use storage::{InMemoryRecordStore, RecordStore, SqliteRecordStore};
pub use sync::{CancelToken, FanOut, RetryPolicy, SyncReport, sync_threads};
