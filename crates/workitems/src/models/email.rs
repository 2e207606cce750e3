//! Email thread payload: a thread record aggregates its nested emails

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An email address with optional display name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAddress {
    /// Display name (e.g., "John Doe")
    pub name: Option<String>,
    /// Email address (e.g., "john@example.com")
    pub email: String,
}

impl EmailAddress {
    /// Create a new email address with just the email
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            name: None,
            email: email.into(),
        }
    }

    /// Create a new email address with a display name
    pub fn with_name(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            email: email.into(),
        }
    }

    /// Parse an email address from a string like "John Doe <john@example.com>"
    pub fn parse(s: &str) -> Self {
        let s = s.trim();

        if let Some(angle_start) = s.rfind('<')
            && let Some(angle_end) = s.rfind('>')
            && angle_start < angle_end
        {
            let name = s[..angle_start].trim().trim_matches('"').trim();
            let email = s[angle_start + 1..angle_end].trim();
            return Self {
                name: if name.is_empty() {
                    None
                } else {
                    Some(name.to_string())
                },
                email: email.to_string(),
            };
        }

        Self {
            name: None,
            email: s.to_string(),
        }
    }

    /// Parse a comma-separated header value into addresses
    pub fn parse_list(s: &str) -> Vec<Self> {
        s.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(Self::parse)
            .collect()
    }

    /// Format the address as a header value
    pub fn display(&self) -> String {
        match &self.name {
            Some(name) => format!("{} <{}>", name, self.email),
            None => self.email.clone(),
        }
    }

    /// Domain part of the address, lowercased
    pub fn domain(&self) -> Option<String> {
        self.email
            .rsplit_once('@')
            .map(|(_, domain)| domain.to_ascii_lowercase())
    }
}

/// Recipients of a single email
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipients {
    pub to: Vec<EmailAddress>,
    pub cc: Vec<EmailAddress>,
    pub bcc: Vec<EmailAddress>,
}

/// A single email nested inside a thread record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Email {
    /// Stable internal identity, assigned once and kept across re-fetches
    pub internal_id: Uuid,
    /// Provider message id
    pub message_id: String,
    /// Provider thread id
    pub thread_id: String,
    /// RFC 5322 Message-ID header, used to thread replies
    #[serde(default)]
    pub smtp_id: Option<String>,
    pub sender: EmailAddress,
    #[serde(default)]
    pub reply_to: Option<String>,
    pub subject: String,
    pub body: String,
    pub sent_at: DateTime<Utc>,
    pub is_unread: bool,
    pub is_archived: bool,
    #[serde(default)]
    pub recipients: Recipients,
}

/// A conversation of emails, stored as the payload of a thread record
///
/// `last_updated_at`, `is_archived` and `is_unread` are derived from the
/// nested emails by [`EmailThread::recompute`] and never set independently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailThread {
    /// Provider thread id
    pub thread_id: String,
    /// Emails ordered by `sent_at` ascending
    pub emails: Vec<Email>,
    pub last_updated_at: Option<DateTime<Utc>>,
    pub is_archived: bool,
    pub is_unread: bool,
}

impl EmailThread {
    /// Build a thread from its emails and derive the aggregate fields
    pub fn new(thread_id: impl Into<String>, emails: Vec<Email>) -> Self {
        let mut thread = Self {
            thread_id: thread_id.into(),
            emails,
            last_updated_at: None,
            is_archived: false,
            is_unread: false,
        };
        thread.recompute();
        thread
    }

    /// Re-derive sort order and aggregate state from the nested emails
    ///
    /// Archive and unread state mirror the most recently sent email.
    pub fn recompute(&mut self) {
        self.emails.sort_by(|a, b| a.sent_at.cmp(&b.sent_at));
        self.last_updated_at = self.emails.iter().map(|e| e.sent_at).max();
        match self.emails.last() {
            Some(latest) => {
                self.is_archived = latest.is_archived;
                self.is_unread = latest.is_unread;
            }
            None => {
                self.is_archived = false;
                self.is_unread = false;
            }
        }
    }

    /// Number of emails currently in the thread
    pub fn message_count(&self) -> usize {
        self.emails.len()
    }

    /// Subject of the first email, which names the thread
    pub fn subject(&self) -> String {
        self.emails
            .first()
            .map(|e| e.subject.clone())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "(no subject)".to_string())
    }

    /// Find the internal id previously assigned to a provider message id
    pub fn internal_id_for(&self, message_id: &str) -> Option<Uuid> {
        self.emails
            .iter()
            .find(|e| e.message_id == message_id)
            .map(|e| e.internal_id)
    }
}
