//! Canonical record: the unified, store-persisted work item

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::email::{Email, EmailThread};
use super::ids::{AccountId, RecordId, RecordKey, SourceId, UserId};

/// Which payload a record carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Task,
    Event,
    Thread,
    Message,
    PullRequest,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Task => "task",
            RecordKind::Event => "event",
            RecordKind::Thread => "thread",
            RecordKind::Message => "message",
            RecordKind::PullRequest => "pull_request",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "task" => Some(RecordKind::Task),
            "event" => Some(RecordKind::Event),
            "thread" => Some(RecordKind::Thread),
            "message" => Some(RecordKind::Message),
            "pull_request" => Some(RecordKind::PullRequest),
            _ => None,
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ticket-style task fields
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDetails {
    /// Provider priority identifier; a change resets manual ordering
    pub priority_id: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
}

/// Calendar event fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDetails {
    /// Start time; a change resets manual ordering
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub conference_url: Option<String>,
}

/// The user's relation to a pull request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewState {
    /// The user opened the pull request
    Authored,
    /// The user is a requested reviewer
    ReviewRequested,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestDetails {
    /// "owner/name"
    pub repository: String,
    pub number: u64,
    pub review_state: ReviewState,
    pub opened_at: DateTime<Utc>,
}

/// Type-specific part of a canonical record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Payload {
    Task(TaskDetails),
    Event(EventDetails),
    Thread(EmailThread),
    Message(Email),
    PullRequest(PullRequestDetails),
}

impl Payload {
    pub fn kind(&self) -> RecordKind {
        match self {
            Payload::Task(_) => RecordKind::Task,
            Payload::Event(_) => RecordKind::Event,
            Payload::Thread(_) => RecordKind::Thread,
            Payload::Message(_) => RecordKind::Message,
            Payload::PullRequest(_) => RecordKind::PullRequest,
        }
    }

    pub fn as_thread(&self) -> Option<&EmailThread> {
        match self {
            Payload::Thread(thread) => Some(thread),
            _ => None,
        }
    }

    pub fn as_event(&self) -> Option<&EventDetails> {
        match self {
            Payload::Event(event) => Some(event),
            _ => None,
        }
    }

    pub fn as_task(&self) -> Option<&TaskDetails> {
        match self {
            Payload::Task(task) => Some(task),
            _ => None,
        }
    }
}

/// A work item as persisted in the canonical store
///
/// `(user_id, external_id, source_id)` is unique across the store. Once
/// `has_been_reordered` is set, reconciliation only changes `ordering_key`
/// through the ordering-reset rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub id: RecordId,
    pub user_id: UserId,
    pub external_id: String,
    pub source_id: SourceId,
    pub account_id: AccountId,
    /// Manual sort position; 0 means unplaced
    pub ordering_key: i64,
    pub section_id: Option<String>,
    pub has_been_reordered: bool,
    pub completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at_external: Option<DateTime<Utc>>,
    pub title: String,
    pub body: String,
    pub deeplink: Option<String>,
    pub payload: Payload,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CanonicalRecord {
    pub fn kind(&self) -> RecordKind {
        self.payload.kind()
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(
            self.user_id.clone(),
            self.external_id.clone(),
            self.source_id.clone(),
        )
    }

    /// Whether the record is live (not soft-deleted)
    pub fn is_live(&self) -> bool {
        !self.deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_kind_round_trip() {
        for kind in [
            RecordKind::Task,
            RecordKind::Event,
            RecordKind::Thread,
            RecordKind::Message,
            RecordKind::PullRequest,
        ] {
            assert_eq!(RecordKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(RecordKind::parse("note"), None);
    }

    #[test]
    fn test_payload_serializes_tagged() {
        let payload = Payload::Task(TaskDetails {
            priority_id: Some("P1".to_string()),
            due_date: None,
        });
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "task");
        assert_eq!(json["data"]["priority_id"], "P1");

        let back: Payload = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind(), RecordKind::Task);
    }
}
