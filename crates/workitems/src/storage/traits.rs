//! Storage trait definitions

use anyhow::Result;

use crate::models::{
    AccountId, CanonicalRecord, CursorKey, JobLock, RecordId, RecordKey, RecordKind, SourceId,
    SyncCursor, UserId,
};
use crate::reconcile::{NewRecord, RecordFilter, RecordUpdate};

/// Stored data could not be decoded, or contradicts the requested write
///
/// Returned inside `anyhow::Error` by stores; the reconciliation layer
/// downcasts it to surface a data integrity failure instead of a store one.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct IntegrityError(pub String);

/// Result of an atomic find-and-update
#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    /// Record as it was before the write
    pub before: CanonicalRecord,
    /// Record as persisted by the write
    pub after: CanonicalRecord,
    /// Whether the ordering key was force-reset by this write
    pub ordering_reset: bool,
}

/// Query over one user's records, served by the (user, completed, kind) index
#[derive(Debug, Clone)]
pub struct RecordQuery {
    pub user_id: UserId,
    pub kind: Option<RecordKind>,
    pub completed: Option<bool>,
    pub source_id: Option<SourceId>,
    pub account_id: Option<AccountId>,
    pub include_deleted: bool,
}

impl RecordQuery {
    pub fn for_user(user_id: UserId) -> Self {
        Self {
            user_id,
            kind: None,
            completed: None,
            source_id: None,
            account_id: None,
            include_deleted: false,
        }
    }

    pub fn kind(mut self, kind: RecordKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn completed(mut self, completed: bool) -> Self {
        self.completed = Some(completed);
        self
    }

    pub fn source(mut self, source_id: SourceId) -> Self {
        self.source_id = Some(source_id);
        self
    }

    pub fn account(mut self, account_id: AccountId) -> Self {
        self.account_id = Some(account_id);
        self
    }

    pub fn include_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    pub fn matches(&self, record: &CanonicalRecord) -> bool {
        record.user_id == self.user_id
            && self.kind.is_none_or(|k| record.kind() == k)
            && self.completed.is_none_or(|c| record.completed == c)
            && self.source_id.as_ref().is_none_or(|s| &record.source_id == s)
            && self.account_id.as_ref().is_none_or(|a| &record.account_id == a)
            && (self.include_deleted || !record.deleted)
    }
}

/// Trait for canonical record storage
///
/// Every write that reconciliation relies on for race safety is atomic in
/// the backend: [`RecordStore::insert_if_absent`] never creates a second
/// record for a key, and [`RecordStore::find_and_update`] reads the
/// pre-image and writes the post-image without interleaving.
pub trait RecordStore: Send + Sync {
    /// Insert a record unless one already exists for `key`
    ///
    /// Returns `true` if this call created the record.
    fn insert_if_absent(&self, key: &RecordKey, new: &NewRecord) -> Result<bool>;

    /// Atomically apply `update` to the record matching `key` and `filters`
    ///
    /// Returns `None` if no record matches.
    fn find_and_update(
        &self,
        key: &RecordKey,
        filters: &[RecordFilter],
        update: &RecordUpdate,
    ) -> Result<Option<UpdateOutcome>>;

    /// Get the record matching `key` and `filters`
    fn find_one(&self, key: &RecordKey, filters: &[RecordFilter]) -> Result<Option<CanonicalRecord>>;

    /// Get a user's record by id
    fn get_record(&self, user_id: &UserId, id: RecordId) -> Result<Option<CanonicalRecord>>;

    /// Apply `update` to a user's record by id; `None` if nothing matched
    fn update_by_id(
        &self,
        user_id: &UserId,
        id: RecordId,
        update: &RecordUpdate,
    ) -> Result<Option<CanonicalRecord>>;

    /// Record a user's manual placement; marks the record as reordered
    fn set_ordering(
        &self,
        user_id: &UserId,
        id: RecordId,
        ordering_key: i64,
        section_id: Option<String>,
    ) -> Result<Option<CanonicalRecord>>;

    /// List records matching `query`, ordered by id
    fn list_records(&self, query: &RecordQuery) -> Result<Vec<CanonicalRecord>>;

    /// Count records matching `query`
    fn count_records(&self, query: &RecordQuery) -> Result<usize>;

    /// Get the sync cursor for a (user, provider, account)
    fn get_cursor(&self, key: &CursorKey) -> Result<Option<SyncCursor>>;

    /// Save a sync cursor (upsert)
    fn save_cursor(&self, cursor: &SyncCursor) -> Result<()>;

    /// Delete a sync cursor
    fn delete_cursor(&self, key: &CursorKey) -> Result<()>;

    /// Write a job lock unless one already exists for its (job, bucket)
    ///
    /// Returns `false` on duplicate; locks are never released.
    fn insert_job_lock(&self, lock: &JobLock) -> Result<bool>;

    /// Get the lock claimed for a (job, bucket)
    fn get_job_lock(&self, job_name: &str, bucket: &str) -> Result<Option<JobLock>>;

    /// Clear all data (for testing)
    fn clear(&self) -> Result<()>;
}
