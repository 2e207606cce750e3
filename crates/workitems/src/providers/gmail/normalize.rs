//! Gmail API response normalization
//!
//! Converts Gmail messages to [`Email`] payloads.

use base64::prelude::*;
use chrono::{TimeZone, Utc};
use uuid::Uuid;

use super::api::{GmailMessage, MessagePart, MessagePayload};
use crate::error::ProviderError;
use crate::models::{Email, EmailAddress, Recipients};

/// Normalize a Gmail message to an [`Email`]
///
/// The internal id is provisional until the sync controller matches it
/// against the stored thread.
pub fn normalize_message(gmail_msg: GmailMessage) -> Result<Email, ProviderError> {
    let payload = gmail_msg
        .payload
        .as_ref()
        .ok_or_else(|| ProviderError::Decode(format!("message {} has no payload", gmail_msg.id)))?;

    let sender = extract_header(payload, "From")
        .map(|s| EmailAddress::parse(&s))
        .unwrap_or_else(|| EmailAddress::new("unknown@unknown.com"));

    let recipients = Recipients {
        to: address_header(payload, "To"),
        cc: address_header(payload, "Cc"),
        bcc: address_header(payload, "Bcc"),
    };

    // Milliseconds since epoch
    let internal_date: i64 = gmail_msg.internal_date.parse().unwrap_or(0);
    let sent_at = Utc
        .timestamp_millis_opt(internal_date)
        .single()
        .unwrap_or_else(Utc::now);

    let body = extract_body(payload, "text/plain")
        .or_else(|| extract_body(payload, "text/html"))
        .unwrap_or_else(|| decode_html_entities(&gmail_msg.snippet));

    let labels = gmail_msg.label_ids.unwrap_or_default();
    let has_label = |label: &str| labels.iter().any(|l| l == label);

    Ok(Email {
        internal_id: Uuid::new_v4(),
        smtp_id: extract_header(payload, "Message-ID"),
        reply_to: extract_header(payload, "Reply-To"),
        subject: extract_header(payload, "Subject").unwrap_or_default(),
        is_unread: has_label("UNREAD"),
        is_archived: !has_label("INBOX"),
        message_id: gmail_msg.id,
        thread_id: gmail_msg.thread_id,
        sender,
        body,
        sent_at,
        recipients,
    })
}

/// Extract a header value by name
fn extract_header(payload: &MessagePayload, name: &str) -> Option<String> {
    payload
        .headers
        .as_ref()?
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.clone())
}

fn address_header(payload: &MessagePayload, name: &str) -> Vec<EmailAddress> {
    extract_header(payload, name)
        .map(|s| EmailAddress::parse_list(&s))
        .unwrap_or_default()
}

/// First body of the given mime type, searching nested parts
fn extract_body(payload: &MessagePayload, mime: &str) -> Option<String> {
    if let Some(body) = &payload.body
        && let Some(data) = &body.data
        && payload.mime_type.as_ref().is_some_and(|m| m.starts_with(mime))
    {
        return decode_base64_body(data);
    }

    payload
        .parts
        .as_ref()
        .and_then(|parts| find_in_parts(parts, mime))
}

fn find_in_parts(parts: &[MessagePart], mime: &str) -> Option<String> {
    for part in parts {
        if part.mime_type.as_ref().is_some_and(|m| m.starts_with(mime))
            && let Some(body) = &part.body
            && let Some(data) = &body.data
            && let Some(text) = decode_base64_body(data)
        {
            return Some(text);
        }

        if let Some(nested) = &part.parts
            && let Some(text) = find_in_parts(nested, mime)
        {
            return Some(text);
        }
    }

    None
}

/// Decode base64-encoded body data
///
/// Gmail uses URL-safe base64 but padding varies, so several decoders are tried.
fn decode_base64_body(data: &str) -> Option<String> {
    let decoders: [&base64::engine::GeneralPurpose; 4] = [
        &BASE64_URL_SAFE_NO_PAD,
        &BASE64_URL_SAFE,
        &BASE64_STANDARD,
        &BASE64_STANDARD_NO_PAD,
    ];

    decoders
        .iter()
        .filter_map(|decoder| decoder.decode(data).ok())
        .find_map(|bytes| String::from_utf8(bytes).ok())
}

/// Decode HTML entities in snippet text
fn decode_html_entities(s: &str) -> String {
    s.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::gmail::api::{Header, MessageBody};

    fn headers(pairs: &[(&str, &str)]) -> Option<Vec<Header>> {
        Some(
            pairs
                .iter()
                .map(|(n, v)| Header {
                    name: n.to_string(),
                    value: v.to_string(),
                })
                .collect(),
        )
    }

    fn message(labels: &[&str], payload: MessagePayload) -> GmailMessage {
        GmailMessage {
            id: "m1".to_string(),
            thread_id: "t1".to_string(),
            label_ids: Some(labels.iter().map(|l| l.to_string()).collect()),
            snippet: "Hi &amp; bye".to_string(),
            internal_date: "1700000000000".to_string(),
            payload: Some(payload),
        }
    }

    #[test]
    fn test_normalize_multipart() {
        let payload = MessagePayload {
            headers: headers(&[
                ("From", "Alice <alice@example.com>"),
                ("To", "bob@example.com, Carol <carol@example.com>"),
                ("Subject", "Plans"),
                ("Message-ID", "<id-1@example.com>"),
            ]),
            body: None,
            mime_type: Some("multipart/alternative".to_string()),
            parts: Some(vec![
                MessagePart {
                    mime_type: Some("text/html".to_string()),
                    body: Some(MessageBody {
                        data: Some("PGI-aGk8L2I-".to_string()),
                    }),
                    parts: None,
                },
                MessagePart {
                    mime_type: Some("text/plain".to_string()),
                    // "Hello, World!"
                    body: Some(MessageBody {
                        data: Some("SGVsbG8sIFdvcmxkIQ".to_string()),
                    }),
                    parts: None,
                },
            ]),
        };

        let email = normalize_message(message(&["INBOX", "UNREAD"], payload)).unwrap();
        assert_eq!(email.sender.email, "alice@example.com");
        assert_eq!(email.recipients.to.len(), 2);
        assert_eq!(email.subject, "Plans");
        assert_eq!(email.body, "Hello, World!");
        assert_eq!(email.smtp_id.as_deref(), Some("<id-1@example.com>"));
        assert_eq!(email.sent_at.timestamp_millis(), 1_700_000_000_000);
        assert!(email.is_unread);
        assert!(!email.is_archived);
    }

    #[test]
    fn test_normalize_falls_back_to_snippet() {
        let payload = MessagePayload {
            headers: headers(&[("FROM", "x@example.com")]),
            body: None,
            parts: None,
            mime_type: Some("text/plain".to_string()),
        };
        let email = normalize_message(message(&[], payload)).unwrap();
        assert_eq!(email.sender.email, "x@example.com");
        assert_eq!(email.body, "Hi & bye");
        assert!(email.is_archived);
        assert!(!email.is_unread);
    }

    #[test]
    fn test_missing_payload_is_decode_error() {
        let mut msg = message(&[], MessagePayload {
            headers: None,
            body: None,
            parts: None,
            mime_type: None,
        });
        msg.payload = None;
        assert!(matches!(normalize_message(msg), Err(ProviderError::Decode(_))));
    }

    #[test]
    fn test_decode_base64_body() {
        assert_eq!(
            decode_base64_body("SGVsbG8sIFdvcmxkIQ"),
            Some("Hello, World!".to_string())
        );
        assert_eq!(decode_base64_body("!!!"), None);
    }
}
