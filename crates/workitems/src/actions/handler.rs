//! Action handler for record mutations

use log::info;
use std::sync::Arc;

use crate::error::{SyncError, SyncResult};
use crate::models::{
    AccountId, CanonicalRecord, EventDetails, Payload, RecordId, RecordKey, SourceId, TaskDetails,
    UserId,
};
use crate::providers::{
    CredentialStore, EventChanges, EventDraft, ProviderContext, ProviderRegistry, TaskChanges,
    TaskDraft, DEFAULT_SECTION,
};
use crate::reconcile::{store_error, NewRecord, RecordFilter, RecordUpdate, Reconciler};
use crate::sync::CancelToken;

/// Handler for actions on canonical records
///
/// Actions are performed in two steps:
/// 1. Call the provider to update its state
/// 2. Update the canonical store to reflect the change
///
/// The provider stays the source of truth; a provider failure leaves the
/// store untouched.
#[derive(Clone)]
pub struct ActionHandler {
    reconciler: Reconciler,
    registry: Arc<ProviderRegistry>,
    credentials: Arc<dyn CredentialStore>,
    cancel: CancelToken,
}

impl ActionHandler {
    pub fn new(
        reconciler: Reconciler,
        registry: Arc<ProviderRegistry>,
        credentials: Arc<dyn CredentialStore>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            reconciler,
            registry,
            credentials,
            cancel,
        }
    }

    /// Complete a record at its provider, then locally
    pub fn mark_done(&self, user_id: &UserId, id: RecordId) -> SyncResult<CanonicalRecord> {
        let record = self.record(user_id, id)?;
        let ctx = self.context(user_id, &record.source_id, &record.account_id)?;
        self.registry.mark_done(&ctx, &record)?;

        info!("[SYNC] Marked {} done", record.key());
        self.reconciler.mark_complete(user_id, id)
    }

    /// Reply to the latest email of a thread or message record
    pub fn reply(&self, user_id: &UserId, id: RecordId, body: &str) -> SyncResult<()> {
        let record = self.record(user_id, id)?;
        let ctx = self.context(user_id, &record.source_id, &record.account_id)?;
        self.registry.reply(&ctx, &record, body)?;
        info!("[SYNC] Replied to {}", record.key());
        Ok(())
    }

    /// Create a task at a provider and store it
    pub fn create_task(
        &self,
        user_id: &UserId,
        source_id: &SourceId,
        account_id: &AccountId,
        task: &TaskDraft,
    ) -> SyncResult<CanonicalRecord> {
        let ctx = self.context(user_id, source_id, account_id)?;
        let external_id = self.registry.create_task(source_id, &ctx, task)?;

        let payload = Payload::Task(TaskDetails {
            priority_id: task.priority_id.clone(),
            due_date: task.due_date,
        });
        let new = NewRecord::new(account_id.clone(), task.title.clone(), payload)
            .with_body(task.body.clone())
            .with_section(DEFAULT_SECTION);
        let key = RecordKey::new(user_id.clone(), external_id, source_id.clone());
        Ok(self.reconciler.get_or_create(&key, &new)?.record)
    }

    /// Create an event at a provider and store it
    pub fn create_event(
        &self,
        user_id: &UserId,
        source_id: &SourceId,
        account_id: &AccountId,
        event: &EventDraft,
    ) -> SyncResult<CanonicalRecord> {
        let ctx = self.context(user_id, source_id, account_id)?;
        let external_id = self.registry.create_event(source_id, &ctx, event)?;

        let payload = Payload::Event(EventDetails {
            start: event.start,
            end: event.end,
            conference_url: None,
        });
        let new = NewRecord::new(account_id.clone(), event.title.clone(), payload)
            .with_body(event.body.clone())
            .with_section(DEFAULT_SECTION);
        let key = RecordKey::new(user_id.clone(), external_id, source_id.clone());
        Ok(self.reconciler.get_or_create(&key, &new)?.record)
    }

    /// Push task changes to the provider, then apply them locally
    ///
    /// A priority change resets the record's ordering like a fetched one.
    pub fn modify_task(&self, user_id: &UserId, id: RecordId, changes: &TaskChanges) -> SyncResult<CanonicalRecord> {
        let record = self.record(user_id, id)?;
        let Some(current) = record.payload.as_task() else {
            return Err(SyncError::DataIntegrity(format!("{} is not a task", record.key())));
        };
        let ctx = self.context(user_id, &record.source_id, &record.account_id)?;
        self.registry
            .modify_task(&record.source_id, &ctx, &record.external_id, changes)?;

        let details = TaskDetails {
            priority_id: changes.priority_id.clone().or_else(|| current.priority_id.clone()),
            due_date: changes.due_date.or(current.due_date),
        };
        let update = RecordUpdate {
            title: changes.title.clone(),
            body: changes.body.clone(),
            payload: Some(Payload::Task(details)),
            ..Default::default()
        };
        self.apply_local(&record, &update)
    }

    /// Push event changes to the provider, then apply them locally
    pub fn modify_event(&self, user_id: &UserId, id: RecordId, changes: &EventChanges) -> SyncResult<CanonicalRecord> {
        let record = self.record(user_id, id)?;
        let Some(current) = record.payload.as_event() else {
            return Err(SyncError::DataIntegrity(format!("{} is not an event", record.key())));
        };
        let ctx = self.context(user_id, &record.source_id, &record.account_id)?;
        self.registry
            .modify_event(&record.source_id, &ctx, &record.external_id, changes)?;

        let details = EventDetails {
            start: changes.start.unwrap_or(current.start),
            end: changes.end.unwrap_or(current.end),
            conference_url: current.conference_url.clone(),
        };
        let update = RecordUpdate {
            title: changes.title.clone(),
            payload: Some(Payload::Event(details)),
            ..Default::default()
        };
        self.apply_local(&record, &update)
    }

    fn apply_local(&self, record: &CanonicalRecord, update: &RecordUpdate) -> SyncResult<CanonicalRecord> {
        let filters = [RecordFilter::Kind(record.kind())];
        Ok(self
            .reconciler
            .reconcile(&record.key(), None, update, &filters)?
            .record)
    }

    fn record(&self, user_id: &UserId, id: RecordId) -> SyncResult<CanonicalRecord> {
        self.reconciler
            .store()
            .get_record(user_id, id)
            .map_err(store_error)?
            .ok_or_else(|| SyncError::NotFound(format!("record {} for user {}", id, user_id)))
    }

    /// Provider context for one of the user's linked accounts
    fn context(&self, user_id: &UserId, source_id: &SourceId, account_id: &AccountId) -> SyncResult<ProviderContext> {
        let token = self.credentials.access_token(user_id, source_id, account_id)?;
        let site = self
            .credentials
            .linked_accounts(user_id)?
            .into_iter()
            .find(|a| &a.source_id == source_id && &a.account_id == account_id)
            .and_then(|a| a.site);
        Ok(ProviderContext {
            user_id: user_id.clone(),
            account_id: account_id.clone(),
            token,
            site,
            cancel: self.cancel.child(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::providers::{AccessToken, Capability, CapabilitySet, LinkedAccount, Provider, StaticCredentialStore};
    use crate::storage::InMemoryRecordStore;
    use std::sync::Mutex;

    /// Records calls; creates tasks as "NEW-<n>"
    #[derive(Default)]
    struct Tickets {
        done: Mutex<Vec<String>>,
        modified: Mutex<Vec<TaskChanges>>,
        reject: bool,
    }

    impl Provider for Tickets {
        fn source_id(&self) -> SourceId {
            SourceId::Jira
        }

        fn capabilities(&self) -> CapabilitySet {
            CapabilitySet::of(&[Capability::CreateTask, Capability::ModifyTask, Capability::MarkDone])
        }

        fn create_task(&self, _ctx: &ProviderContext, _task: &TaskDraft) -> Result<String, ProviderError> {
            Ok("NEW-1".to_string())
        }

        fn modify_task(
            &self,
            _ctx: &ProviderContext,
            _external_id: &str,
            changes: &TaskChanges,
        ) -> Result<(), ProviderError> {
            self.modified.lock().unwrap().push(changes.clone());
            Ok(())
        }

        fn mark_done(&self, ctx: &ProviderContext, record: &CanonicalRecord) -> Result<(), ProviderError> {
            if self.reject {
                return Err(ProviderError::Rejected {
                    status: 409,
                    message: "no transition".to_string(),
                });
            }
            assert_eq!(ctx.site.as_deref(), Some("cloud-1"));
            self.done.lock().unwrap().push(record.external_id.clone());
            Ok(())
        }
    }

    fn handler(provider: Arc<Tickets>) -> ActionHandler {
        let store = Arc::new(InMemoryRecordStore::new());
        let credentials = StaticCredentialStore::new(vec![LinkedAccount {
            user_id: UserId::new("u1"),
            source_id: SourceId::Jira,
            account_id: AccountId::new("site-1"),
            access_token: AccessToken::new("t"),
            site: Some("cloud-1".to_string()),
        }]);
        ActionHandler::new(
            Reconciler::new(store),
            Arc::new(ProviderRegistry::new().with(provider)),
            Arc::new(credentials),
            CancelToken::new(),
        )
    }

    fn draft() -> TaskDraft {
        TaskDraft {
            title: "Write report".to_string(),
            priority_id: Some("3".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_create_then_mark_done() {
        let provider = Arc::new(Tickets::default());
        let handler = handler(provider.clone());
        let user = UserId::new("u1");

        let record = handler
            .create_task(&user, &SourceId::Jira, &AccountId::new("site-1"), &draft())
            .unwrap();
        assert_eq!(record.external_id, "NEW-1");
        assert!(!record.completed);

        let done = handler.mark_done(&user, record.id).unwrap();
        assert!(done.completed);
        assert_eq!(provider.done.lock().unwrap().as_slice(), ["NEW-1".to_string()]);
    }

    #[test]
    fn test_provider_failure_leaves_store_untouched() {
        let provider = Arc::new(Tickets {
            reject: true,
            ..Default::default()
        });
        let handler = handler(provider);
        let user = UserId::new("u1");
        let record = handler
            .create_task(&user, &SourceId::Jira, &AccountId::new("site-1"), &draft())
            .unwrap();

        assert!(handler.mark_done(&user, record.id).is_err());
        let stored = handler.record(&user, record.id).unwrap();
        assert!(!stored.completed);
    }

    #[test]
    fn test_modify_priority_resets_ordering() {
        let provider = Arc::new(Tickets::default());
        let handler = handler(provider.clone());
        let user = UserId::new("u1");
        let record = handler
            .create_task(&user, &SourceId::Jira, &AccountId::new("site-1"), &draft())
            .unwrap();
        handler
            .reconciler
            .set_ordering(&user, record.id, 4, None)
            .unwrap();

        let changes = TaskChanges {
            priority_id: Some("1".to_string()),
            ..Default::default()
        };
        let updated = handler.modify_task(&user, record.id, &changes).unwrap();
        assert_eq!(updated.ordering_key, 0);
        assert_eq!(updated.payload.as_task().unwrap().priority_id.as_deref(), Some("1"));
        assert_eq!(provider.modified.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_unsupported_action() {
        let handler = handler(Arc::new(Tickets::default()));
        let user = UserId::new("u1");
        let record = handler
            .create_task(&user, &SourceId::Jira, &AccountId::new("site-1"), &draft())
            .unwrap();
        let err = handler.reply(&user, record.id, "hi").unwrap_err();
        assert!(matches!(
            err,
            SyncError::Unsupported {
                capability: Capability::Reply,
                ..
            }
        ));
        assert!(handler.mark_done(&user, RecordId(999)).is_err());
    }
}
