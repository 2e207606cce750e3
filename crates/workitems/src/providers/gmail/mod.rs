//! Gmail adapter
//!
//! Exposes the mailbox as a [`ThreadSource`] for the incremental sync
//! controller, plus reply and mark-done (archive) actions.

mod normalize;

pub use normalize::normalize_message;

use base64::prelude::*;
use log::debug;
use serde_json::json;

use super::{Capability, CapabilitySet, HttpClient, Provider, ProviderContext};
use super::{ChangeKind, ChangePage, FetchedThread, MessageChange, ThreadListing, ThreadSource};
use crate::error::ProviderError;
use crate::models::{CanonicalRecord, Email, Payload, SourceId};

/// Gmail API response types
pub mod api {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Profile {
        pub email_address: Option<String>,
        pub history_id: String,
    }

    /// Response from listing threads
    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ListThreadsResponse {
        pub threads: Option<Vec<ThreadRef>>,
        pub next_page_token: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct ThreadRef {
        pub id: String,
    }

    /// Full thread with its messages
    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct GmailThread {
        pub id: String,
        pub messages: Option<Vec<GmailMessage>>,
    }

    /// Full message from Gmail API
    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct GmailMessage {
        pub id: String,
        pub thread_id: String,
        pub label_ids: Option<Vec<String>>,
        #[serde(default)]
        pub snippet: String,
        #[serde(default)]
        pub internal_date: String,
        pub payload: Option<MessagePayload>,
    }

    /// Message payload containing headers and body
    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MessagePayload {
        pub headers: Option<Vec<Header>>,
        pub body: Option<MessageBody>,
        pub parts: Option<Vec<MessagePart>>,
        pub mime_type: Option<String>,
    }

    #[derive(Debug, Deserialize, Serialize)]
    pub struct Header {
        pub name: String,
        pub value: String,
    }

    /// Message body (may be base64 encoded)
    #[derive(Debug, Deserialize)]
    pub struct MessageBody {
        pub data: Option<String>,
    }

    /// Message part (for multipart messages)
    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MessagePart {
        pub mime_type: Option<String>,
        pub body: Option<MessageBody>,
        pub parts: Option<Vec<MessagePart>>,
    }

    /// Response from the history (change log) endpoint
    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct HistoryResponse {
        pub history: Option<Vec<HistoryRecord>>,
        pub next_page_token: Option<String>,
        pub history_id: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct HistoryRecord {
        pub messages_added: Option<Vec<HistoryMessage>>,
        pub messages_deleted: Option<Vec<HistoryMessage>>,
    }

    #[derive(Debug, Deserialize)]
    pub struct HistoryMessage {
        pub message: MessageRef,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MessageRef {
        pub id: String,
        pub thread_id: String,
    }
}

use api::{GmailThread, HistoryResponse, ListThreadsResponse, Profile};

/// Gmail pages thread listings at this size
const MAX_PAGE_SIZE: usize = 500;

pub struct GmailProvider {
    http: HttpClient,
    base_url: String,
}

impl GmailProvider {
    pub fn new(http: HttpClient, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/users/me/{}", self.base_url, path)
    }

    fn check_cancel(ctx: &ProviderContext) -> Result<(), ProviderError> {
        if ctx.cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        Ok(())
    }
}

impl Provider for GmailProvider {
    fn source_id(&self) -> SourceId {
        SourceId::Gmail
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::of(&[Capability::FetchEmails, Capability::Reply, Capability::MarkDone])
    }

    fn thread_source(&self) -> Option<&dyn ThreadSource> {
        Some(self)
    }

    fn reply(&self, ctx: &ProviderContext, record: &CanonicalRecord, body: &str) -> Result<(), ProviderError> {
        let latest = latest_email(record)?;
        let raw = build_reply(latest, body);
        let payload = json!({
            "raw": BASE64_URL_SAFE_NO_PAD.encode(raw.as_bytes()),
            "threadId": latest.thread_id,
        });
        self.http
            .post_json_no_content(&self.url("messages/send"), &ctx.token, &payload)
    }

    /// Archives the thread
    fn mark_done(&self, ctx: &ProviderContext, record: &CanonicalRecord) -> Result<(), ProviderError> {
        let thread_id = match &record.payload {
            Payload::Thread(thread) => thread.thread_id.clone(),
            Payload::Message(email) => email.thread_id.clone(),
            _ => record.external_id.clone(),
        };
        let url = self.url(&format!("threads/{}/modify", urlencoding::encode(&thread_id)));
        self.http.post_json_no_content(
            &url,
            &ctx.token,
            &json!({ "removeLabelIds": ["INBOX"] }),
        )
    }
}

impl ThreadSource for GmailProvider {
    fn list_recent_threads(&self, ctx: &ProviderContext, limit: usize) -> Result<ThreadListing, ProviderError> {
        // Capture the cursor before listing so nothing arriving mid-listing is lost
        let profile: Profile = self.http.get_json(&self.url("profile"), &ctx.token)?;

        let mut thread_ids = Vec::new();
        let mut page_token: Option<String> = None;
        while thread_ids.len() < limit {
            Self::check_cancel(ctx)?;
            let page_size = (limit - thread_ids.len()).min(MAX_PAGE_SIZE);
            let mut url = self.url(&format!("threads?maxResults={}&labelIds=INBOX", page_size));
            if let Some(token) = &page_token {
                url.push_str(&format!("&pageToken={}", urlencoding::encode(token)));
            }
            let page: ListThreadsResponse = self.http.get_json(&url, &ctx.token)?;
            thread_ids.extend(page.threads.unwrap_or_default().into_iter().map(|t| t.id));
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        thread_ids.truncate(limit);

        debug!(
            "[SYNC] Listed {} Gmail threads at history {}",
            thread_ids.len(),
            profile.history_id
        );
        Ok(ThreadListing {
            thread_ids,
            cursor: profile.history_id,
        })
    }

    fn list_changes(
        &self,
        ctx: &ProviderContext,
        cursor: &str,
        page_token: Option<&str>,
    ) -> Result<ChangePage, ProviderError> {
        Self::check_cancel(ctx)?;
        let mut url = self.url(&format!(
            "history?startHistoryId={}&historyTypes=messageAdded&historyTypes=messageDeleted",
            urlencoding::encode(cursor)
        ));
        if let Some(token) = page_token {
            url.push_str(&format!("&pageToken={}", urlencoding::encode(token)));
        }

        let response: HistoryResponse = match self.http.get_json(&url, &ctx.token) {
            Ok(response) => response,
            // History id too old for Gmail's retention
            Err(ProviderError::NotFound(_)) => return Err(ProviderError::CursorExpired),
            Err(e) => return Err(e),
        };

        let mut changes = Vec::new();
        for record in response.history.unwrap_or_default() {
            let added = record.messages_added.unwrap_or_default();
            let deleted = record.messages_deleted.unwrap_or_default();
            changes.extend(added.into_iter().map(|m| MessageChange {
                thread_id: m.message.thread_id,
                message_id: m.message.id,
                kind: ChangeKind::Added,
            }));
            changes.extend(deleted.into_iter().map(|m| MessageChange {
                thread_id: m.message.thread_id,
                message_id: m.message.id,
                kind: ChangeKind::Removed,
            }));
        }

        Ok(ChangePage {
            changes,
            next_page_token: response.next_page_token,
            cursor: response.history_id,
        })
    }

    fn get_thread(&self, ctx: &ProviderContext, thread_id: &str) -> Result<FetchedThread, ProviderError> {
        Self::check_cancel(ctx)?;
        let url = self.url(&format!("threads/{}?format=full", urlencoding::encode(thread_id)));
        let thread: GmailThread = self.http.get_json(&url, &ctx.token)?;

        let emails = thread
            .messages
            .unwrap_or_default()
            .into_iter()
            .map(normalize_message)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(FetchedThread {
            thread_id: thread.id,
            emails,
        })
    }
}

fn latest_email(record: &CanonicalRecord) -> Result<&Email, ProviderError> {
    let email = match &record.payload {
        Payload::Thread(thread) => thread.emails.last(),
        Payload::Message(email) => Some(email),
        _ => None,
    };
    email.ok_or_else(|| ProviderError::NotFound(format!("no email to reply to in {}", record.key())))
}

/// Build an RFC 2822 reply to `to`
fn build_reply(to: &Email, body: &str) -> String {
    let recipient = to
        .reply_to
        .clone()
        .unwrap_or_else(|| to.sender.display());
    let subject = if to.subject.to_ascii_lowercase().starts_with("re:") {
        to.subject.clone()
    } else {
        format!("Re: {}", to.subject)
    };

    let mut raw = format!("To: {}\r\nSubject: {}\r\n", recipient, subject);
    if let Some(smtp_id) = &to.smtp_id {
        raw.push_str(&format!("In-Reply-To: {}\r\nReferences: {}\r\n", smtp_id, smtp_id));
    }
    raw.push_str("Content-Type: text/plain; charset=\"UTF-8\"\r\n\r\n");
    raw.push_str(body);
    raw
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EmailAddress;
    use chrono::Utc;
    use uuid::Uuid;

    fn email(subject: &str, reply_to: Option<&str>) -> Email {
        Email {
            internal_id: Uuid::new_v4(),
            message_id: "m1".to_string(),
            thread_id: "t1".to_string(),
            smtp_id: Some("<abc@mail.example.com>".to_string()),
            sender: EmailAddress::with_name("Alice", "alice@example.com"),
            reply_to: reply_to.map(str::to_string),
            subject: subject.to_string(),
            body: String::new(),
            sent_at: Utc::now(),
            is_unread: true,
            is_archived: false,
            recipients: Default::default(),
        }
    }

    #[test]
    fn test_build_reply_threads_headers() {
        let raw = build_reply(&email("Lunch", None), "Sounds good");
        assert!(raw.starts_with("To: Alice <alice@example.com>\r\n"));
        assert!(raw.contains("Subject: Re: Lunch\r\n"));
        assert!(raw.contains("In-Reply-To: <abc@mail.example.com>\r\n"));
        assert!(raw.ends_with("\r\n\r\nSounds good"));
    }

    #[test]
    fn test_build_reply_prefers_reply_to() {
        let raw = build_reply(&email("Re: Lunch", Some("team@example.com")), "ok");
        assert!(raw.starts_with("To: team@example.com\r\n"));
        assert!(raw.contains("Subject: Re: Lunch\r\n"));
        assert!(!raw.contains("Re: Re:"));
    }

    #[test]
    fn test_history_response_parses() {
        let json = r#"{
            "history": [
                {"id": "10", "messagesAdded": [{"message": {"id": "m1", "threadId": "t1"}}]},
                {"id": "11", "messagesDeleted": [{"message": {"id": "m0", "threadId": "t0"}}]}
            ],
            "historyId": "12"
        }"#;
        let response: HistoryResponse = serde_json::from_str(json).unwrap();
        let history = response.history.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].messages_added.is_some());
        assert!(history[1].messages_deleted.is_some());
        assert_eq!(response.history_id.as_deref(), Some("12"));
    }

    #[test]
    fn test_capabilities() {
        let provider = GmailProvider::new(
            HttpClient::new(std::time::Duration::from_secs(1)),
            "https://gmail.example/",
        );
        let caps = provider.capabilities();
        assert!(caps.contains(Capability::FetchEmails));
        assert!(caps.contains(Capability::MarkDone));
        assert!(!caps.contains(Capability::FetchTasks));
        assert!(provider.thread_source().is_some());
        assert_eq!(provider.url("profile"), "https://gmail.example/users/me/profile");
    }
}
