//! Provider adapters
//!
//! Each external system implements [`Provider`]. Every capability has a
//! default implementation that fails with an "unsupported" error, so a
//! provider only overrides what it can do and the set of providers can be
//! driven uniformly through the [`ProviderRegistry`].

mod credentials;
mod gcal;
mod github;
pub mod gmail;
mod http;
mod jira;
mod registry;
mod threads;

pub use credentials::{
    AccessToken, CredentialStore, FileCredentialStore, LinkedAccount, StaticCredentialStore,
};
pub use gcal::GoogleCalendarProvider;
pub use github::GithubPrProvider;
pub use gmail::GmailProvider;
pub use http::HttpClient;
pub use jira::JiraProvider;
pub use registry::ProviderRegistry;
pub use threads::{ChangeKind, ChangePage, FetchedThread, MessageChange, ThreadListing, ThreadSource};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::error::ProviderError;
use crate::models::{AccountId, CanonicalRecord, RecordKind, SourceId, UserId};
use crate::reconcile::{NewRecord, RecordUpdate};
use crate::sync::CancelToken;

/// Something a provider may be able to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    FetchTasks,
    FetchEvents,
    FetchEmails,
    FetchPullRequests,
    CreateTask,
    CreateEvent,
    ModifyTask,
    ModifyEvent,
    Reply,
    MarkDone,
}

impl Capability {
    /// Capabilities that produce records during a sync
    pub const FETCHES: [Capability; 4] = [
        Capability::FetchTasks,
        Capability::FetchEvents,
        Capability::FetchEmails,
        Capability::FetchPullRequests,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::FetchTasks => "fetch_tasks",
            Capability::FetchEvents => "fetch_events",
            Capability::FetchEmails => "fetch_emails",
            Capability::FetchPullRequests => "fetch_pull_requests",
            Capability::CreateTask => "create_task",
            Capability::CreateEvent => "create_event",
            Capability::ModifyTask => "modify_task",
            Capability::ModifyEvent => "modify_event",
            Capability::Reply => "reply",
            Capability::MarkDone => "mark_done",
        }
    }

    pub fn is_fetch(&self) -> bool {
        Self::FETCHES.contains(self)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The capabilities a provider declares at registration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    pub fn of(capabilities: &[Capability]) -> Self {
        Self(capabilities.iter().copied().collect())
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }

    /// Declared fetch capabilities, in a stable order
    pub fn fetches(&self) -> impl Iterator<Item = Capability> + '_ {
        self.iter().filter(Capability::is_fetch)
    }
}

/// Everything a provider call needs about the caller
#[derive(Debug, Clone)]
pub struct ProviderContext {
    pub user_id: UserId,
    pub account_id: AccountId,
    pub token: AccessToken,
    /// Provider-specific site or tenant (e.g. a Jira cloud id)
    pub site: Option<String>,
    pub cancel: CancelToken,
}

/// One item returned by a fetch, already split into its field sets
#[derive(Debug, Clone)]
pub struct FetchedItem {
    pub external_id: String,
    /// Insert-only fields
    pub new: NewRecord,
    /// Always-set fields
    pub update: RecordUpdate,
    /// The provider reports the item as removed (e.g. a cancelled event)
    pub removed: bool,
}

impl FetchedItem {
    pub fn new(external_id: impl Into<String>, new: NewRecord, update: RecordUpdate) -> Self {
        Self {
            external_id: external_id.into(),
            new,
            update,
            removed: false,
        }
    }

    /// An item the provider says no longer exists
    pub fn removed(external_id: impl Into<String>, new: NewRecord) -> Self {
        Self {
            external_id: external_id.into(),
            new,
            update: RecordUpdate::default(),
            removed: true,
        }
    }

    pub fn kind(&self) -> RecordKind {
        self.new.payload.kind()
    }
}

/// A task to create at a provider
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskDraft {
    pub title: String,
    pub body: String,
    pub due_date: Option<DateTime<Utc>>,
    pub priority_id: Option<String>,
}

/// An event to create at a provider
#[derive(Debug, Clone, PartialEq)]
pub struct EventDraft {
    pub title: String,
    pub body: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Changes to push to a provider task; `None` leaves a field alone
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskChanges {
    pub title: Option<String>,
    pub body: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
    pub priority_id: Option<String>,
}

/// Changes to push to a provider event; `None` leaves a field alone
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventChanges {
    pub title: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

/// Section newly fetched tasks and events land in
pub const DEFAULT_SECTION: &str = "today";

fn unsupported<T>(capability: Capability) -> Result<T, ProviderError> {
    Err(ProviderError::Unsupported { capability })
}

/// An external system that work items come from
pub trait Provider: Send + Sync {
    /// Source id stamped on every record from this provider
    fn source_id(&self) -> SourceId;

    /// Capabilities this provider implements
    fn capabilities(&self) -> CapabilitySet;

    fn fetch_tasks(&self, _ctx: &ProviderContext) -> Result<Vec<FetchedItem>, ProviderError> {
        unsupported(Capability::FetchTasks)
    }

    fn fetch_events(&self, _ctx: &ProviderContext) -> Result<Vec<FetchedItem>, ProviderError> {
        unsupported(Capability::FetchEvents)
    }

    fn fetch_pull_requests(&self, _ctx: &ProviderContext) -> Result<Vec<FetchedItem>, ProviderError> {
        unsupported(Capability::FetchPullRequests)
    }

    /// Thread/message access used by the incremental sync controller
    fn thread_source(&self) -> Option<&dyn ThreadSource> {
        None
    }

    /// Returns the provider's id for the new task
    fn create_task(&self, _ctx: &ProviderContext, _task: &TaskDraft) -> Result<String, ProviderError> {
        unsupported(Capability::CreateTask)
    }

    /// Returns the provider's id for the new event
    fn create_event(&self, _ctx: &ProviderContext, _event: &EventDraft) -> Result<String, ProviderError> {
        unsupported(Capability::CreateEvent)
    }

    fn modify_task(
        &self,
        _ctx: &ProviderContext,
        _external_id: &str,
        _changes: &TaskChanges,
    ) -> Result<(), ProviderError> {
        unsupported(Capability::ModifyTask)
    }

    fn modify_event(
        &self,
        _ctx: &ProviderContext,
        _external_id: &str,
        _changes: &EventChanges,
    ) -> Result<(), ProviderError> {
        unsupported(Capability::ModifyEvent)
    }

    fn reply(
        &self,
        _ctx: &ProviderContext,
        _record: &CanonicalRecord,
        _body: &str,
    ) -> Result<(), ProviderError> {
        unsupported(Capability::Reply)
    }

    fn mark_done(&self, _ctx: &ProviderContext, _record: &CanonicalRecord) -> Result<(), ProviderError> {
        unsupported(Capability::MarkDone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Bare;

    impl Provider for Bare {
        fn source_id(&self) -> SourceId {
            SourceId::Custom("bare".to_string())
        }

        fn capabilities(&self) -> CapabilitySet {
            CapabilitySet::default()
        }
    }

    fn ctx() -> ProviderContext {
        ProviderContext {
            user_id: UserId::new("u1"),
            account_id: AccountId::new("a1"),
            token: AccessToken::new("t"),
            site: None,
            cancel: CancelToken::new(),
        }
    }

    #[test]
    fn test_defaults_are_unsupported() {
        let err = Bare.fetch_tasks(&ctx()).unwrap_err();
        assert!(matches!(
            err,
            ProviderError::Unsupported {
                capability: Capability::FetchTasks
            }
        ));
        assert_eq!(err.to_string(), "fetch_tasks has not been implemented yet");
        assert!(Bare.thread_source().is_none());
        assert!(Bare.create_task(&ctx(), &TaskDraft::default()).is_err());
    }

    #[test]
    fn test_capability_set_fetches() {
        let set = CapabilitySet::of(&[
            Capability::MarkDone,
            Capability::FetchEvents,
            Capability::FetchTasks,
        ]);
        let fetches: Vec<_> = set.fetches().collect();
        assert_eq!(fetches, vec![Capability::FetchTasks, Capability::FetchEvents]);
        assert!(set.contains(Capability::MarkDone));
        assert!(!set.contains(Capability::Reply));
    }
}
