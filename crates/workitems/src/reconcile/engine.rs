//! Reconciliation primitives over a [`RecordStore`]

use log::{debug, error, info};
use std::collections::HashSet;
use std::sync::Arc;

use super::{NewRecord, RecordFilter, RecordUpdate};
use crate::error::{SyncError, SyncResult};
use crate::models::{
    AccountId, CanonicalRecord, RecordId, RecordKey, RecordKind, SourceId, UserId,
};
use crate::storage::{IntegrityError, RecordQuery, RecordStore};

/// Outcome of reconciling one fetched item
#[derive(Debug, Clone)]
pub struct Reconciled {
    /// The record as persisted, with its assigned id and current ordering key
    pub record: CanonicalRecord,
    /// Whether this call created the record
    pub created: bool,
    /// Whether this call force-reset the ordering key
    pub ordering_reset: bool,
}

/// Merges fetched provider data into canonical records
///
/// Holds no locks of its own: concurrent callers for the same record are
/// serialized by the store's conditional writes.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn RecordStore>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Upsert a fetched item
    ///
    /// Insert-only fields are written once, on first sight, with a
    /// set-on-insert write; always-set fields are then applied with an
    /// atomic find-and-update that also evaluates the ordering-reset rule.
    pub fn reconcile(
        &self,
        key: &RecordKey,
        new: Option<&NewRecord>,
        update: &RecordUpdate,
        filters: &[RecordFilter],
    ) -> SyncResult<Reconciled> {
        let created = match new {
            Some(new) => self.store.insert_if_absent(key, new).map_err(store_error)?,
            None => false,
        };

        if update.is_empty() {
            let record = self.find_required(key, filters)?;
            return Ok(Reconciled {
                record,
                created,
                ordering_reset: false,
            });
        }

        match self
            .store
            .find_and_update(key, filters, update)
            .map_err(store_error)?
        {
            Some(outcome) => {
                if outcome.ordering_reset {
                    debug!(
                        "[STORE] Reset ordering of {} (was {})",
                        key, outcome.before.ordering_key
                    );
                }
                Ok(Reconciled {
                    record: outcome.after,
                    created,
                    ordering_reset: outcome.ordering_reset,
                })
            }
            None => Err(self.missing(key, filters)),
        }
    }

    /// Find or create without applying any always-set fields
    pub fn get_or_create(&self, key: &RecordKey, new: &NewRecord) -> SyncResult<Reconciled> {
        let created = self.store.insert_if_absent(key, new).map_err(store_error)?;
        let record = self.find_required(key, &[])?;
        Ok(Reconciled {
            record,
            created,
            ordering_reset: false,
        })
    }

    /// Mark a user's record completed
    pub fn mark_complete(&self, user_id: &UserId, id: RecordId) -> SyncResult<CanonicalRecord> {
        let update = RecordUpdate {
            completed: Some(true),
            ..Default::default()
        };
        self.store
            .update_by_id(user_id, id, &update)
            .map_err(store_error)?
            .ok_or_else(|| SyncError::NotFound(format!("record {} for user {}", id, user_id)))
    }

    /// Soft-delete a record; history is kept
    pub fn soft_delete(&self, key: &RecordKey) -> SyncResult<CanonicalRecord> {
        let update = RecordUpdate {
            deleted: Some(true),
            ..Default::default()
        };
        self.store
            .find_and_update(key, &[], &update)
            .map_err(store_error)?
            .map(|outcome| outcome.after)
            .ok_or_else(|| SyncError::NotFound(key.to_string()))
    }

    /// Record a user's manual placement
    pub fn set_ordering(
        &self,
        user_id: &UserId,
        id: RecordId,
        ordering_key: i64,
        section_id: Option<String>,
    ) -> SyncResult<CanonicalRecord> {
        self.store
            .set_ordering(user_id, id, ordering_key, section_id)
            .map_err(store_error)?
            .ok_or_else(|| SyncError::NotFound(format!("record {} for user {}", id, user_id)))
    }

    /// Complete open tasks of a (source, account) that a successful fetch
    /// no longer lists
    ///
    /// Returns the number of tasks completed.
    pub fn complete_missing(
        &self,
        user_id: &UserId,
        source_id: &SourceId,
        account_id: &AccountId,
        seen: &HashSet<String>,
    ) -> SyncResult<usize> {
        let query = RecordQuery::for_user(user_id.clone())
            .kind(RecordKind::Task)
            .completed(false)
            .source(source_id.clone())
            .account(account_id.clone());
        let open = self.store.list_records(&query).map_err(store_error)?;

        let mut completed = 0;
        for record in open.iter().filter(|r| !seen.contains(&r.external_id)) {
            self.mark_complete(user_id, record.id)?;
            completed += 1;
        }
        if completed > 0 {
            info!(
                "[STORE] Completed {} {} tasks no longer listed for {}",
                completed, source_id, account_id
            );
        }
        Ok(completed)
    }

    fn find_required(&self, key: &RecordKey, filters: &[RecordFilter]) -> SyncResult<CanonicalRecord> {
        match self.store.find_one(key, filters).map_err(store_error)? {
            Some(record) => Ok(record),
            None => Err(self.missing(key, filters)),
        }
    }

    /// Classify a write that matched nothing
    ///
    /// A record that exists under the key but fails the extra filters
    /// contradicts the caller's view of it.
    fn missing(&self, key: &RecordKey, filters: &[RecordFilter]) -> SyncError {
        if filters.is_empty() {
            return SyncError::NotFound(key.to_string());
        }
        match self.store.find_one(key, &[]) {
            Ok(Some(existing)) => {
                let err = SyncError::DataIntegrity(format!(
                    "{} exists as a {} record but does not match {:?}",
                    key,
                    existing.kind(),
                    filters
                ));
                error!("[STORE] {}", err);
                err
            }
            Ok(None) => SyncError::NotFound(key.to_string()),
            Err(e) => store_error(e),
        }
    }
}

/// Map a storage failure into the engine taxonomy
pub(crate) fn store_error(e: anyhow::Error) -> SyncError {
    if e.downcast_ref::<IntegrityError>().is_some() {
        error!("[STORE] Data integrity failure: {:#}", e);
        SyncError::DataIntegrity(format!("{:#}", e))
    } else {
        SyncError::Store(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Payload, TaskDetails};
    use crate::storage::InMemoryRecordStore;

    fn reconciler() -> Reconciler {
        Reconciler::new(Arc::new(InMemoryRecordStore::new()))
    }

    fn key(id: &str) -> RecordKey {
        RecordKey::new(UserId::new("u1"), id, SourceId::Jira)
    }

    fn task(priority: &str) -> Payload {
        Payload::Task(TaskDetails {
            priority_id: Some(priority.to_string()),
            due_date: None,
        })
    }

    fn new_task(priority: &str) -> NewRecord {
        NewRecord::new(AccountId::new("site-1"), "Ticket", task(priority))
    }

    fn update_task(priority: &str) -> RecordUpdate {
        RecordUpdate {
            title: Some("Ticket".to_string()),
            payload: Some(task(priority)),
            completed: Some(false),
            ..Default::default()
        }
    }

    #[test]
    fn test_reconcile_creates_then_updates() {
        let r = reconciler();
        let first = r
            .reconcile(&key("J-1"), Some(&new_task("P1")), &update_task("P1"), &[])
            .unwrap();
        assert!(first.created);

        let second = r
            .reconcile(&key("J-1"), Some(&new_task("P1")), &update_task("P1"), &[])
            .unwrap();
        assert!(!second.created);
        assert_eq!(first.record.id, second.record.id);
        assert!(!second.ordering_reset);
    }

    #[test]
    fn test_update_without_insert_fields_on_absent_record() {
        let r = reconciler();
        let err = r
            .reconcile(&key("J-404"), None, &update_task("P1"), &[])
            .unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    #[test]
    fn test_filter_mismatch_is_integrity_error() {
        let r = reconciler();
        r.get_or_create(&key("J-1"), &new_task("P1")).unwrap();
        let err = r
            .reconcile(
                &key("J-1"),
                None,
                &update_task("P1"),
                &[RecordFilter::Kind(RecordKind::Event)],
            )
            .unwrap_err();
        assert!(matches!(err, SyncError::DataIntegrity(_)));
    }

    #[test]
    fn test_payload_kind_change_is_integrity_error() {
        let r = reconciler();
        r.get_or_create(&key("J-1"), &new_task("P1")).unwrap();
        let update = RecordUpdate {
            payload: Some(Payload::PullRequest(crate::models::PullRequestDetails {
                repository: "acme/api".to_string(),
                number: 1,
                review_state: crate::models::ReviewState::Authored,
                opened_at: chrono::Utc::now(),
            })),
            ..Default::default()
        };
        let err = r.reconcile(&key("J-1"), None, &update, &[]).unwrap_err();
        assert!(matches!(err, SyncError::DataIntegrity(_)));
    }

    #[test]
    fn test_mark_complete_missing_record() {
        let r = reconciler();
        let err = r.mark_complete(&UserId::new("u1"), RecordId(99)).unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    #[test]
    fn test_soft_delete() {
        let r = reconciler();
        r.get_or_create(&key("J-1"), &new_task("P1")).unwrap();
        let deleted = r.soft_delete(&key("J-1")).unwrap();
        assert!(deleted.deleted);
        assert!(deleted.deleted_at.is_some());
        assert!(matches!(
            r.soft_delete(&key("J-2")).unwrap_err(),
            SyncError::NotFound(_)
        ));
    }

    #[test]
    fn test_complete_missing() {
        let r = reconciler();
        for id in ["J-1", "J-2", "J-3"] {
            r.get_or_create(&key(id), &new_task("P1")).unwrap();
        }
        let seen: HashSet<String> = ["J-1".to_string(), "J-3".to_string()].into();

        let completed = r
            .complete_missing(
                &UserId::new("u1"),
                &SourceId::Jira,
                &AccountId::new("site-1"),
                &seen,
            )
            .unwrap();
        assert_eq!(completed, 1);

        let j2 = r.store().find_one(&key("J-2"), &[]).unwrap().unwrap();
        assert!(j2.completed);
        let j1 = r.store().find_one(&key("J-1"), &[]).unwrap().unwrap();
        assert!(!j1.completed);
    }
}
