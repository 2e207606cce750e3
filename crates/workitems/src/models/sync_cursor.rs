//! Incremental sync cursor per (user, provider, account)

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{AccountId, SourceId, UserId};

/// Identifies the cursor slot
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CursorKey {
    pub user: UserId,
    pub source: SourceId,
    pub account: AccountId,
}

impl CursorKey {
    pub fn new(user: UserId, source: SourceId, account: AccountId) -> Self {
        Self {
            user,
            source,
            account,
        }
    }
}

/// Tracks where incremental sync left off
///
/// The cursor is opaque to the engine (for Gmail it is a history id). An
/// absent, empty or zero cursor forces a full refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub user: UserId,
    pub source: SourceId,
    pub account: AccountId,
    pub cursor: String,
    /// When the cursor was last advanced
    pub last_sync_at: DateTime<Utc>,
}

impl SyncCursor {
    pub fn new(key: CursorKey, cursor: impl Into<String>) -> Self {
        Self {
            user: key.user,
            source: key.source,
            account: key.account,
            cursor: cursor.into(),
            last_sync_at: Utc::now(),
        }
    }

    pub fn key(&self) -> CursorKey {
        CursorKey::new(self.user.clone(), self.source.clone(), self.account.clone())
    }

    /// Advance to a new cursor value
    pub fn updated(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = cursor.into();
        self.last_sync_at = Utc::now();
        self
    }

    /// Whether the cursor carries a usable position
    pub fn is_set(&self) -> bool {
        let c = self.cursor.trim();
        !c.is_empty() && c != "0"
    }

    /// Check if this cursor is recent enough to be trusted
    ///
    /// Provider change logs are retained for a limited window; a cursor
    /// older than that may silently miss changes.
    pub fn is_recent(&self, max_age: Duration) -> bool {
        Utc::now() - self.last_sync_at < max_age
    }

    /// Usable for a delta sync: set and not stale
    pub fn is_usable(&self, max_age: Duration) -> bool {
        self.is_set() && self.is_recent(max_age)
    }
}
