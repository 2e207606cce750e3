//! Provider registry with capability gating

use std::collections::BTreeMap;
use std::sync::Arc;

use super::{
    Capability, CapabilitySet, EventChanges, EventDraft, FetchedItem, Provider, ProviderContext,
    TaskChanges, TaskDraft, ThreadSource,
};
use crate::error::{ProviderError, SyncError, SyncResult};
use crate::models::{CanonicalRecord, SourceId};

struct Entry {
    provider: Arc<dyn Provider>,
    capabilities: CapabilitySet,
}

/// Providers by source id
///
/// Capabilities are read once at registration. Dispatching an undeclared
/// capability fails with [`SyncError::Unsupported`] without calling the
/// provider.
#[derive(Default)]
pub struct ProviderRegistry {
    entries: BTreeMap<SourceId, Entry>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider, replacing any previous one for its source
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        let capabilities = provider.capabilities();
        self.entries.insert(
            provider.source_id(),
            Entry {
                provider,
                capabilities,
            },
        );
    }

    pub fn with(mut self, provider: Arc<dyn Provider>) -> Self {
        self.register(provider);
        self
    }

    pub fn get(&self, source_id: &SourceId) -> Option<&Arc<dyn Provider>> {
        self.entries.get(source_id).map(|e| &e.provider)
    }

    pub fn capabilities(&self, source_id: &SourceId) -> CapabilitySet {
        self.entries
            .get(source_id)
            .map(|e| e.capabilities.clone())
            .unwrap_or_default()
    }

    pub fn sources(&self) -> impl Iterator<Item = &SourceId> {
        self.entries.keys()
    }

    /// The provider for `source_id` if it declared `capability`
    pub fn require(&self, source_id: &SourceId, capability: Capability) -> SyncResult<&Arc<dyn Provider>> {
        let entry = self
            .entries
            .get(source_id)
            .ok_or_else(|| SyncError::NotFound(format!("no provider registered for {}", source_id)))?;
        if !entry.capabilities.contains(capability) {
            return Err(SyncError::Unsupported {
                source_id: source_id.clone(),
                capability,
            });
        }
        Ok(&entry.provider)
    }

    /// Run an item fetch (tasks, events or pull requests)
    pub fn fetch(
        &self,
        source_id: &SourceId,
        capability: Capability,
        ctx: &ProviderContext,
    ) -> SyncResult<Vec<FetchedItem>> {
        let provider = self.require(source_id, capability)?;
        let result = match capability {
            Capability::FetchTasks => provider.fetch_tasks(ctx),
            Capability::FetchEvents => provider.fetch_events(ctx),
            Capability::FetchPullRequests => provider.fetch_pull_requests(ctx),
            other => {
                return Err(SyncError::Unsupported {
                    source_id: source_id.clone(),
                    capability: other,
                });
            }
        };
        result.map_err(|e| self.provider_error(source_id, e))
    }

    /// The thread source behind a provider that declared `FetchEmails`
    pub fn thread_source(&self, source_id: &SourceId) -> SyncResult<&dyn ThreadSource> {
        let provider = self.require(source_id, Capability::FetchEmails)?;
        provider.thread_source().ok_or_else(|| SyncError::Unsupported {
            source_id: source_id.clone(),
            capability: Capability::FetchEmails,
        })
    }

    pub fn create_task(&self, source_id: &SourceId, ctx: &ProviderContext, task: &TaskDraft) -> SyncResult<String> {
        self.require(source_id, Capability::CreateTask)?
            .create_task(ctx, task)
            .map_err(|e| self.provider_error(source_id, e))
    }

    pub fn create_event(&self, source_id: &SourceId, ctx: &ProviderContext, event: &EventDraft) -> SyncResult<String> {
        self.require(source_id, Capability::CreateEvent)?
            .create_event(ctx, event)
            .map_err(|e| self.provider_error(source_id, e))
    }

    pub fn modify_task(
        &self,
        source_id: &SourceId,
        ctx: &ProviderContext,
        external_id: &str,
        changes: &TaskChanges,
    ) -> SyncResult<()> {
        self.require(source_id, Capability::ModifyTask)?
            .modify_task(ctx, external_id, changes)
            .map_err(|e| self.provider_error(source_id, e))
    }

    pub fn modify_event(
        &self,
        source_id: &SourceId,
        ctx: &ProviderContext,
        external_id: &str,
        changes: &EventChanges,
    ) -> SyncResult<()> {
        self.require(source_id, Capability::ModifyEvent)?
            .modify_event(ctx, external_id, changes)
            .map_err(|e| self.provider_error(source_id, e))
    }

    pub fn reply(&self, ctx: &ProviderContext, record: &CanonicalRecord, body: &str) -> SyncResult<()> {
        self.require(&record.source_id, Capability::Reply)?
            .reply(ctx, record, body)
            .map_err(|e| self.provider_error(&record.source_id, e))
    }

    pub fn mark_done(&self, ctx: &ProviderContext, record: &CanonicalRecord) -> SyncResult<()> {
        self.require(&record.source_id, Capability::MarkDone)?
            .mark_done(ctx, record)
            .map_err(|e| self.provider_error(&record.source_id, e))
    }

    /// A provider that declared a capability but still reported it as
    /// unsupported is reported under its source id
    fn provider_error(&self, source_id: &SourceId, err: ProviderError) -> SyncError {
        match err {
            ProviderError::Unsupported { capability } => SyncError::Unsupported {
                source_id: source_id.clone(),
                capability,
            },
            other => other.into(),
        }
    }
}
