//! Thread/message source used by the incremental sync controller

use crate::error::ProviderError;
use crate::models::Email;

use super::ProviderContext;

/// Most recent threads plus the cursor to resume from
#[derive(Debug, Clone, Default)]
pub struct ThreadListing {
    pub thread_ids: Vec<String>,
    /// Change-log position captured with the listing
    pub cursor: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Removed,
}

impl ChangeKind {
    /// Signed contribution to a thread's message count
    pub fn delta(&self) -> i64 {
        match self {
            ChangeKind::Added => 1,
            ChangeKind::Removed => -1,
        }
    }
}

/// One message-level entry of the provider's change log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageChange {
    pub thread_id: String,
    pub message_id: String,
    pub kind: ChangeKind,
}

/// A page of the change log
#[derive(Debug, Clone, Default)]
pub struct ChangePage {
    pub changes: Vec<MessageChange>,
    pub next_page_token: Option<String>,
    /// Change-log position after this page, if the provider reports one
    pub cursor: Option<String>,
}

/// A thread as fetched, with emails in provider form
///
/// `internal_id` on each email is provisional; the sync controller replaces
/// it with the id already stored for the same message id.
#[derive(Debug, Clone)]
pub struct FetchedThread {
    pub thread_id: String,
    pub emails: Vec<Email>,
}

/// Provider access for thread/message style sources
pub trait ThreadSource: Send + Sync {
    /// List up to `limit` of the most recent threads
    fn list_recent_threads(&self, ctx: &ProviderContext, limit: usize) -> Result<ThreadListing, ProviderError>;

    /// Read one page of changes since `cursor`
    ///
    /// Fails with [`ProviderError::CursorExpired`] if the cursor is older
    /// than the provider's change-log retention.
    fn list_changes(
        &self,
        ctx: &ProviderContext,
        cursor: &str,
        page_token: Option<&str>,
    ) -> Result<ChangePage, ProviderError>;

    /// Fetch one thread with all its messages
    fn get_thread(&self, ctx: &ProviderContext, thread_id: &str) -> Result<FetchedThread, ProviderError>;
}
