//! Process-scoped engine context
//!
//! Built once at startup and passed down explicitly. Owns the store,
//! credential store, provider registry and the root cancel token;
//! [`EngineContext::shutdown`] cancels everything still in flight.

use anyhow::{Context, Result};
use log::info;
use std::sync::Arc;

use crate::actions::ActionHandler;
use crate::config::EngineConfig;
use crate::error::SyncResult;
use crate::jobs::JobLockManager;
use crate::models::{CanonicalRecord, Granularity, JobLock, RecordKey, SourceId, UserId};
use crate::providers::{
    CredentialStore, FileCredentialStore, GithubPrProvider, GmailProvider, GoogleCalendarProvider,
    HttpClient, JiraProvider, ProviderRegistry,
};
use crate::reconcile::{NewRecord, RecordFilter, RecordUpdate, Reconciler};
use crate::storage::{RecordStore, SqliteRecordStore};
use crate::sync::{CancelToken, FanOut, SyncReport, ThreadSyncOptions};

pub struct EngineContext {
    config: EngineConfig,
    reconciler: Reconciler,
    credentials: Arc<dyn CredentialStore>,
    registry: Arc<ProviderRegistry>,
    jobs: JobLockManager,
    actions: ActionHandler,
    thread_options: ThreadSyncOptions,
    cancel: CancelToken,
}

impl EngineContext {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn RecordStore>,
        credentials: Arc<dyn CredentialStore>,
        registry: ProviderRegistry,
    ) -> Self {
        let cancel = CancelToken::new();
        let reconciler = Reconciler::new(store.clone());
        let registry = Arc::new(registry);
        let actions = ActionHandler::new(
            reconciler.clone(),
            registry.clone(),
            credentials.clone(),
            cancel.clone(),
        );
        Self {
            thread_options: config.thread_sync_options(),
            jobs: JobLockManager::new(store),
            config,
            reconciler,
            credentials,
            registry,
            actions,
            cancel,
        }
    }

    /// Open the SQLite store and credentials named by `config` and register
    /// every built-in provider
    pub fn from_config(config: EngineConfig) -> Result<Self> {
        let db_path = config.resolved_db_path()?;
        let store = SqliteRecordStore::new(&db_path)
            .with_context(|| format!("Failed to open record store at {}", db_path.display()))?;
        let credentials = FileCredentialStore::load()?;
        let registry = default_registry(&config);
        info!(
            "[SYNC] Engine ready: store {}, {} providers",
            db_path.display(),
            registry.sources().count()
        );
        Ok(Self::new(config, Arc::new(store), Arc::new(credentials), registry))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        self.reconciler.store()
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn credentials(&self) -> &Arc<dyn CredentialStore> {
        &self.credentials
    }

    pub fn jobs(&self) -> &JobLockManager {
        &self.jobs
    }

    pub fn actions(&self) -> &ActionHandler {
        &self.actions
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Upsert one record from externally fetched data
    pub fn reconcile(
        &self,
        user_id: &UserId,
        external_id: &str,
        source_id: &SourceId,
        insert: Option<&NewRecord>,
        update: &RecordUpdate,
        filters: &[RecordFilter],
    ) -> SyncResult<CanonicalRecord> {
        let key = RecordKey::new(user_id.clone(), external_id, source_id.clone());
        Ok(self.reconciler.reconcile(&key, insert, update, filters)?.record)
    }

    /// Fetch from every linked account of `user_id`
    ///
    /// Runs under a child of the root token, so [`Self::shutdown`] cancels it.
    pub fn sync_all(&self, user_id: &UserId) -> SyncResult<SyncReport> {
        let cancel = self.cancel.child();
        FanOut::new(
            &self.reconciler,
            &self.registry,
            self.credentials.as_ref(),
            &self.thread_options,
        )
        .sync_all(user_id, &cancel)
    }

    /// Claim a job for the current bucket
    pub fn acquire_once(&self, job_name: &str, granularity: Granularity) -> SyncResult<JobLock> {
        self.jobs.acquire_once(job_name, granularity)
    }

    /// Cancel all in-flight work started through this context
    pub fn shutdown(&self) {
        info!("[SYNC] Shutting down engine");
        self.cancel.cancel();
    }
}

/// Registry with every built-in provider, sharing one HTTP client
pub fn default_registry(config: &EngineConfig) -> ProviderRegistry {
    let http = HttpClient::new(config.external_timeout());
    ProviderRegistry::new()
        .with(Arc::new(GmailProvider::new(http.clone(), &config.gmail_base_url)))
        .with(Arc::new(GoogleCalendarProvider::new(
            http.clone(),
            &config.calendar_base_url,
            config.event_window(),
        )))
        .with(Arc::new(JiraProvider::new(http.clone(), &config.jira_base_url)))
        .with(Arc::new(GithubPrProvider::new(http, &config.github_base_url)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::models::{AccountId, Payload, RecordKind, TaskDetails};
    use crate::providers::{Capability, StaticCredentialStore};
    use crate::storage::InMemoryRecordStore;

    fn context() -> EngineContext {
        EngineContext::new(
            EngineConfig::default(),
            Arc::new(InMemoryRecordStore::new()),
            Arc::new(StaticCredentialStore::default()),
            ProviderRegistry::new(),
        )
    }

    #[test]
    fn test_default_registry_capabilities() {
        let registry = default_registry(&EngineConfig::default());
        assert_eq!(registry.sources().count(), 4);
        assert!(registry.capabilities(&SourceId::Gmail).contains(Capability::FetchEmails));
        assert!(registry.capabilities(&SourceId::GoogleCalendar).contains(Capability::FetchEvents));
        assert!(registry.capabilities(&SourceId::Jira).contains(Capability::MarkDone));
        assert!(!registry.capabilities(&SourceId::GithubPr).contains(Capability::MarkDone));
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let ctx = context();
        let user = UserId::new("u1");
        let payload = Payload::Task(TaskDetails::default());
        let new = NewRecord::new(AccountId::new("a1"), "Task", payload.clone());
        let update = RecordUpdate {
            title: Some("Task".to_string()),
            payload: Some(payload),
            ..Default::default()
        };
        let filters = [RecordFilter::Kind(RecordKind::Task)];

        let first = ctx
            .reconcile(&user, "T-1", &SourceId::Jira, Some(&new), &update, &filters)
            .unwrap();
        let second = ctx
            .reconcile(&user, "T-1", &SourceId::Jira, Some(&new), &update, &filters)
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.ordering_key, second.ordering_key);
    }

    #[test]
    fn test_shutdown_cancels_sync() {
        let ctx = context();
        ctx.shutdown();
        assert!(ctx.cancel_token().is_cancelled());
        // No linked accounts: nothing to run, but the report is still returned
        let report = ctx.sync_all(&UserId::new("u1")).unwrap();
        assert!(report.records.is_empty());
    }

    #[test]
    fn test_jobs_race_through_context() {
        let ctx = context();
        assert!(ctx.acquire_once("digest", Granularity::Day).is_ok());
        assert!(matches!(
            ctx.acquire_once("digest", Granularity::Day),
            Err(SyncError::RaceLoss { .. })
        ));
    }
}
