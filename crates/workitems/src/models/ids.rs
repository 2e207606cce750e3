//! Identifier newtypes shared by every model

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a user of the engine
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a linked account at a provider (e.g. an email address)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(pub String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AccountId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Store-assigned identifier of a canonical record
///
/// Assigned once on first insert and never changed afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(pub i64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The external system a record was fetched from
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SourceId {
    Gmail,
    GoogleCalendar,
    Jira,
    GithubPr,
    /// Any provider registered outside the built-in set
    Custom(String),
}

impl SourceId {
    pub fn as_str(&self) -> &str {
        match self {
            SourceId::Gmail => "gmail",
            SourceId::GoogleCalendar => "gcal",
            SourceId::Jira => "jira",
            SourceId::GithubPr => "github_pr",
            SourceId::Custom(name) => name,
        }
    }
}

impl From<&str> for SourceId {
    fn from(s: &str) -> Self {
        match s {
            "gmail" => SourceId::Gmail,
            "gcal" => SourceId::GoogleCalendar,
            "jira" => SourceId::Jira,
            "github_pr" => SourceId::GithubPr,
            other => SourceId::Custom(other.to_string()),
        }
    }
}

impl From<String> for SourceId {
    fn from(s: String) -> Self {
        SourceId::from(s.as_str())
    }
}

impl From<SourceId> for String {
    fn from(id: SourceId) -> Self {
        id.as_str().to_string()
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Uniqueness key of a canonical record: (user, external id, source)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub user_id: UserId,
    pub external_id: String,
    pub source_id: SourceId,
}

impl RecordKey {
    pub fn new(user_id: UserId, external_id: impl Into<String>, source_id: SourceId) -> Self {
        Self {
            user_id,
            external_id: external_id.into(),
            source_id,
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.user_id, self.source_id, self.external_id)
    }
}
