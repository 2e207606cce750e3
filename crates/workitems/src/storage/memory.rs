//! In-memory storage implementation
//!
//! Used for tests and for running the engine without a database file.

use anyhow::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicI64, Ordering};

use super::{RecordQuery, RecordStore, UpdateOutcome};
use crate::models::{CanonicalRecord, CursorKey, JobLock, RecordId, RecordKey, SyncCursor, UserId};
use crate::reconcile::{NewRecord, RecordFilter, RecordUpdate};

/// Records indexed by key, with an id lookup beside them
///
/// Both maps live under one lock so a key and its id never diverge.
#[derive(Default)]
struct RecordTable {
    by_key: HashMap<RecordKey, CanonicalRecord>,
    by_id: HashMap<RecordId, RecordKey>,
}

impl RecordTable {
    fn get_mut_by_id(&mut self, user_id: &UserId, id: RecordId) -> Option<&mut CanonicalRecord> {
        let key = self.by_id.get(&id)?;
        self.by_key
            .get_mut(key)
            .filter(|record| &record.user_id == user_id)
    }
}

/// In-memory implementation of RecordStore
///
/// Uses HashMaps protected by RwLocks for thread-safe access. Conditional
/// writes hold the write lock for their whole read-modify-write.
pub struct InMemoryRecordStore {
    records: RwLock<RecordTable>,
    cursors: RwLock<HashMap<CursorKey, SyncCursor>>,
    job_locks: RwLock<HashMap<(String, String), JobLock>>,
    next_id: AtomicI64,
}

impl InMemoryRecordStore {
    /// Create a new empty in-memory store
    pub fn new() -> Self {
        Self {
            records: RwLock::new(RecordTable::default()),
            cursors: RwLock::new(HashMap::new()),
            job_locks: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordStore for InMemoryRecordStore {
    fn insert_if_absent(&self, key: &RecordKey, new: &NewRecord) -> Result<bool> {
        let mut table = self.records.write().unwrap();
        if table.by_key.contains_key(key) {
            return Ok(false);
        }

        let id = RecordId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let record = new.clone().into_record(id, key, Utc::now());
        table.by_id.insert(id, key.clone());
        table.by_key.insert(key.clone(), record);
        Ok(true)
    }

    fn find_and_update(
        &self,
        key: &RecordKey,
        filters: &[RecordFilter],
        update: &RecordUpdate,
    ) -> Result<Option<UpdateOutcome>> {
        let mut table = self.records.write().unwrap();
        let Some(record) = table.by_key.get_mut(key) else {
            return Ok(None);
        };
        if !RecordFilter::matches_all(filters, record) {
            return Ok(None);
        }

        let before = record.clone();
        let mut after = before.clone();
        let ordering_reset = update.apply(&mut after, Utc::now())?;
        *record = after.clone();

        Ok(Some(UpdateOutcome {
            before,
            after,
            ordering_reset,
        }))
    }

    fn find_one(&self, key: &RecordKey, filters: &[RecordFilter]) -> Result<Option<CanonicalRecord>> {
        let table = self.records.read().unwrap();
        Ok(table
            .by_key
            .get(key)
            .filter(|record| RecordFilter::matches_all(filters, record))
            .cloned())
    }

    fn get_record(&self, user_id: &UserId, id: RecordId) -> Result<Option<CanonicalRecord>> {
        let table = self.records.read().unwrap();
        Ok(table
            .by_id
            .get(&id)
            .and_then(|key| table.by_key.get(key))
            .filter(|record| &record.user_id == user_id)
            .cloned())
    }

    fn update_by_id(
        &self,
        user_id: &UserId,
        id: RecordId,
        update: &RecordUpdate,
    ) -> Result<Option<CanonicalRecord>> {
        let mut table = self.records.write().unwrap();
        let Some(record) = table.get_mut_by_id(user_id, id) else {
            return Ok(None);
        };

        let mut after = record.clone();
        update.apply(&mut after, Utc::now())?;
        *record = after.clone();
        Ok(Some(after))
    }

    fn set_ordering(
        &self,
        user_id: &UserId,
        id: RecordId,
        ordering_key: i64,
        section_id: Option<String>,
    ) -> Result<Option<CanonicalRecord>> {
        let mut table = self.records.write().unwrap();
        let Some(record) = table.get_mut_by_id(user_id, id) else {
            return Ok(None);
        };

        record.ordering_key = ordering_key;
        record.has_been_reordered = true;
        if section_id.is_some() {
            record.section_id = section_id;
        }
        record.updated_at = Utc::now();
        Ok(Some(record.clone()))
    }

    fn list_records(&self, query: &RecordQuery) -> Result<Vec<CanonicalRecord>> {
        let table = self.records.read().unwrap();
        let mut records: Vec<CanonicalRecord> = table
            .by_key
            .values()
            .filter(|record| query.matches(record))
            .cloned()
            .collect();
        records.sort_by_key(|record| record.id);
        Ok(records)
    }

    fn count_records(&self, query: &RecordQuery) -> Result<usize> {
        let table = self.records.read().unwrap();
        Ok(table.by_key.values().filter(|r| query.matches(r)).count())
    }

    fn get_cursor(&self, key: &CursorKey) -> Result<Option<SyncCursor>> {
        Ok(self.cursors.read().unwrap().get(key).cloned())
    }

    fn save_cursor(&self, cursor: &SyncCursor) -> Result<()> {
        self.cursors
            .write()
            .unwrap()
            .insert(cursor.key(), cursor.clone());
        Ok(())
    }

    fn delete_cursor(&self, key: &CursorKey) -> Result<()> {
        self.cursors.write().unwrap().remove(key);
        Ok(())
    }

    fn insert_job_lock(&self, lock: &JobLock) -> Result<bool> {
        let mut locks = self.job_locks.write().unwrap();
        let slot = (lock.job_name.clone(), lock.bucket.clone());
        if locks.contains_key(&slot) {
            return Ok(false);
        }
        locks.insert(slot, lock.clone());
        Ok(true)
    }

    fn get_job_lock(&self, job_name: &str, bucket: &str) -> Result<Option<JobLock>> {
        let locks = self.job_locks.read().unwrap();
        Ok(locks
            .get(&(job_name.to_string(), bucket.to_string()))
            .cloned())
    }

    fn clear(&self) -> Result<()> {
        *self.records.write().unwrap() = RecordTable::default();
        self.cursors.write().unwrap().clear();
        self.job_locks.write().unwrap().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AccountId, Payload, RecordKind, SourceId, TaskDetails};
    use std::sync::Arc;

    fn key(external_id: &str) -> RecordKey {
        RecordKey::new(UserId::new("u1"), external_id, SourceId::Jira)
    }

    fn new_task(priority: &str) -> NewRecord {
        NewRecord::new(
            AccountId::new("me@example.com"),
            "Fix the build",
            Payload::Task(TaskDetails {
                priority_id: Some(priority.to_string()),
                due_date: None,
            }),
        )
    }

    #[test]
    fn test_insert_if_absent_is_write_once() {
        let store = InMemoryRecordStore::new();
        assert!(store.insert_if_absent(&key("J-1"), &new_task("P1")).unwrap());
        assert!(!store.insert_if_absent(&key("J-1"), &new_task("P3")).unwrap());

        let record = store.find_one(&key("J-1"), &[]).unwrap().unwrap();
        assert_eq!(record.payload.as_task().unwrap().priority_id.as_deref(), Some("P1"));
        assert_eq!(record.id, RecordId(1));
    }

    #[test]
    fn test_concurrent_inserts_create_one_record() {
        let store = Arc::new(InMemoryRecordStore::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || store.insert_if_absent(&key("J-7"), &new_task("P1")).unwrap())
            })
            .collect();

        let created: usize = handles
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(created, 1);
        let query = RecordQuery::for_user(UserId::new("u1"));
        assert_eq!(store.count_records(&query).unwrap(), 1);
    }

    #[test]
    fn test_find_and_update_respects_filters() {
        let store = InMemoryRecordStore::new();
        store.insert_if_absent(&key("J-1"), &new_task("P1")).unwrap();

        let update = RecordUpdate {
            title: Some("Renamed".to_string()),
            ..Default::default()
        };
        let miss = store
            .find_and_update(&key("J-1"), &[RecordFilter::Kind(RecordKind::Event)], &update)
            .unwrap();
        assert!(miss.is_none());

        let hit = store
            .find_and_update(&key("J-1"), &[RecordFilter::Kind(RecordKind::Task)], &update)
            .unwrap()
            .unwrap();
        assert_eq!(hit.before.title, "Fix the build");
        assert_eq!(hit.after.title, "Renamed");
    }

    #[test]
    fn test_set_ordering_marks_reordered() {
        let store = InMemoryRecordStore::new();
        store.insert_if_absent(&key("J-1"), &new_task("P1")).unwrap();
        let id = store.find_one(&key("J-1"), &[]).unwrap().unwrap().id;

        let record = store
            .set_ordering(&UserId::new("u1"), id, 4, Some("today".to_string()))
            .unwrap()
            .unwrap();
        assert_eq!(record.ordering_key, 4);
        assert!(record.has_been_reordered);
        assert_eq!(record.section_id.as_deref(), Some("today"));

        assert!(store
            .set_ordering(&UserId::new("someone-else"), id, 1, None)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_list_excludes_deleted() {
        let store = InMemoryRecordStore::new();
        store.insert_if_absent(&key("J-1"), &new_task("P1")).unwrap();
        store.insert_if_absent(&key("J-2"), &new_task("P1")).unwrap();
        store
            .find_and_update(
                &key("J-2"),
                &[],
                &RecordUpdate {
                    deleted: Some(true),
                    ..Default::default()
                },
            )
            .unwrap();

        let query = RecordQuery::for_user(UserId::new("u1"));
        assert_eq!(store.list_records(&query).unwrap().len(), 1);
        assert_eq!(store.list_records(&query.include_deleted()).unwrap().len(), 2);
    }

    #[test]
    fn test_job_lock_write_once() {
        let store = InMemoryRecordStore::new();
        assert!(store.insert_job_lock(&JobLock::new("digest", "2024-01-01", "a")).unwrap());
        assert!(!store.insert_job_lock(&JobLock::new("digest", "2024-01-01", "b")).unwrap());
        let lock = store.get_job_lock("digest", "2024-01-01").unwrap().unwrap();
        assert_eq!(lock.holder, "a");
    }
}
