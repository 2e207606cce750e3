//! Bucket-scoped job lock manager

use chrono::{DateTime, Utc};
use log::{debug, info};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::models::{Granularity, JobLock};
use crate::reconcile::store_error;
use crate::storage::RecordStore;

/// Claims job buckets on behalf of one runner
#[derive(Clone)]
pub struct JobLockManager {
    store: Arc<dyn RecordStore>,
    holder: String,
}

impl JobLockManager {
    /// Manager with a fresh random holder id
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self::with_holder(store, format!("runner-{}", Uuid::new_v4()))
    }

    pub fn with_holder(store: Arc<dyn RecordStore>, holder: impl Into<String>) -> Self {
        Self {
            store,
            holder: holder.into(),
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Claim `job_name` for an explicit bucket
    ///
    /// A single insert-if-absent round trip. Losing the race returns
    /// [`SyncError::RaceLoss`] immediately; there is no wait or retry.
    pub fn acquire(&self, job_name: &str, bucket: &str) -> SyncResult<JobLock> {
        let lock = JobLock::new(job_name, bucket, self.holder.as_str());
        if self.store.insert_job_lock(&lock).map_err(store_error)? {
            info!("[JOBS] {} claimed {}", self.holder, lock.lock_id());
            Ok(lock)
        } else {
            debug!("[JOBS] {} already claimed, skipping", lock.lock_id());
            Err(SyncError::RaceLoss {
                job_name: job_name.to_string(),
                bucket: bucket.to_string(),
            })
        }
    }

    /// Claim `job_name` for the current bucket
    pub fn acquire_once(&self, job_name: &str, granularity: Granularity) -> SyncResult<JobLock> {
        self.acquire_once_at(job_name, granularity, Utc::now())
    }

    /// Claim `job_name` for the bucket containing `now`
    pub fn acquire_once_at(
        &self,
        job_name: &str,
        granularity: Granularity,
        now: DateTime<Utc>,
    ) -> SyncResult<JobLock> {
        self.acquire(job_name, &granularity.bucket(now))
    }

    /// Run `f` if this runner wins the current bucket
    ///
    /// Returns `Ok(None)` when another runner already claimed it.
    pub fn run_once<T, F>(&self, job_name: &str, granularity: Granularity, f: F) -> SyncResult<Option<T>>
    where
        F: FnOnce(&JobLock) -> SyncResult<T>,
    {
        self.run_once_at(job_name, granularity, Utc::now(), f)
    }

    /// Run `f` if this runner wins the bucket containing `now`
    pub fn run_once_at<T, F>(
        &self,
        job_name: &str,
        granularity: Granularity,
        now: DateTime<Utc>,
        f: F,
    ) -> SyncResult<Option<T>>
    where
        F: FnOnce(&JobLock) -> SyncResult<T>,
    {
        match self.acquire_once_at(job_name, granularity, now) {
            Ok(lock) => f(&lock).map(Some),
            Err(SyncError::RaceLoss { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Who claimed a bucket, if anyone
    pub fn holder_of(&self, job_name: &str, bucket: &str) -> SyncResult<Option<String>> {
        Ok(self
            .store
            .get_job_lock(job_name, bucket)
            .map_err(store_error)?
            .map(|lock| lock.holder))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryRecordStore;
    use chrono::TimeZone;

    #[test]
    fn test_second_claim_loses() {
        let store: Arc<dyn RecordStore> = Arc::new(InMemoryRecordStore::new());
        let a = JobLockManager::with_holder(store.clone(), "a");
        let b = JobLockManager::with_holder(store, "b");

        let lock = a.acquire("digest", "2024-01-01").unwrap();
        assert_eq!(lock.lock_id(), "digest@2024-01-01");

        let err = b.acquire("digest", "2024-01-01").unwrap_err();
        assert!(matches!(err, SyncError::RaceLoss { .. }));
        assert!(err.suppresses_escalation());
        assert_eq!(a.holder_of("digest", "2024-01-01").unwrap().as_deref(), Some("a"));
    }

    #[test]
    fn test_next_bucket_is_free() {
        let manager = JobLockManager::new(Arc::new(InMemoryRecordStore::new()));
        let monday = Utc.with_ymd_and_hms(2024, 1, 1, 23, 59, 0).unwrap();
        let tuesday = Utc.with_ymd_and_hms(2024, 1, 2, 0, 1, 0).unwrap();

        manager.acquire_once_at("digest", Granularity::Day, monday).unwrap();
        assert!(manager.acquire_once_at("digest", Granularity::Day, monday).is_err());
        assert!(manager.acquire_once_at("digest", Granularity::Day, tuesday).is_ok());
        // Different job, same bucket
        assert!(manager.acquire_once_at("cleanup", Granularity::Day, monday).is_ok());
    }

    #[test]
    fn test_run_once() {
        let store: Arc<dyn RecordStore> = Arc::new(InMemoryRecordStore::new());
        let a = JobLockManager::with_holder(store.clone(), "a");
        let b = JobLockManager::with_holder(store, "b");

        let first = a.run_once("refresh", Granularity::Hour, |lock| Ok(lock.holder.clone()));
        assert_eq!(first.unwrap().as_deref(), Some("a"));

        let mut ran = false;
        let second = b.run_once("refresh", Granularity::Hour, |_| {
            ran = true;
            Ok(())
        });
        assert!(second.unwrap().is_none());
        assert!(!ran);
    }

    #[test]
    fn test_run_once_at_uses_given_bucket() {
        let manager = JobLockManager::with_holder(Arc::new(InMemoryRecordStore::new()), "a");
        let late = Utc.with_ymd_and_hms(2024, 1, 1, 23, 59, 59).unwrap();
        let bucket = Granularity::Day.bucket(late);

        let claimed = manager
            .run_once_at("digest", Granularity::Day, late, |lock| Ok(lock.bucket.clone()))
            .unwrap();
        assert_eq!(claimed.as_deref(), Some("2024-01-01"));
        assert!(manager
            .run_once_at("digest", Granularity::Day, late, |_| Ok(()))
            .unwrap()
            .is_none());
        assert_eq!(manager.holder_of("digest", &bucket).unwrap().as_deref(), Some("a"));
    }
}
