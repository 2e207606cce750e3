//! Field sets passed to the reconciliation primitives

use chrono::{DateTime, Utc};

use super::ordering;
use crate::models::{
    AccountId, CanonicalRecord, Payload, RecordId, RecordKey, RecordKind,
};
use crate::storage::IntegrityError;

/// Insert-only fields, written once when a record is first seen
#[derive(Debug, Clone, PartialEq)]
pub struct NewRecord {
    pub account_id: AccountId,
    pub title: String,
    pub body: String,
    pub deeplink: Option<String>,
    pub section_id: Option<String>,
    pub created_at_external: Option<DateTime<Utc>>,
    pub ordering_key: i64,
    pub completed: bool,
    pub payload: Payload,
}

impl NewRecord {
    pub fn new(account_id: AccountId, title: impl Into<String>, payload: Payload) -> Self {
        Self {
            account_id,
            title: title.into(),
            body: String::new(),
            deeplink: None,
            section_id: None,
            created_at_external: None,
            ordering_key: 0,
            completed: false,
            payload,
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_deeplink(mut self, deeplink: impl Into<String>) -> Self {
        self.deeplink = Some(deeplink.into());
        self
    }

    pub fn with_section(mut self, section_id: impl Into<String>) -> Self {
        self.section_id = Some(section_id.into());
        self
    }

    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at_external = Some(at);
        self
    }

    /// Materialize the record under a freshly assigned id
    pub fn into_record(self, id: RecordId, key: &RecordKey, now: DateTime<Utc>) -> CanonicalRecord {
        CanonicalRecord {
            id,
            user_id: key.user_id.clone(),
            external_id: key.external_id.clone(),
            source_id: key.source_id.clone(),
            account_id: self.account_id,
            ordering_key: self.ordering_key,
            section_id: self.section_id,
            has_been_reordered: false,
            completed: self.completed,
            completed_at: self.completed.then_some(now),
            deleted: false,
            deleted_at: None,
            created_at_external: self.created_at_external,
            title: self.title,
            body: self.body,
            deeplink: self.deeplink,
            payload: self.payload,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Always-set fields, written on every fetch; `None` leaves a field alone
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordUpdate {
    pub title: Option<String>,
    pub body: Option<String>,
    pub deeplink: Option<String>,
    pub created_at_external: Option<DateTime<Utc>>,
    pub completed: Option<bool>,
    pub deleted: Option<bool>,
    pub payload: Option<Payload>,
}

impl RecordUpdate {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Apply to `record`, returning whether the ordering key was reset
    ///
    /// The reset decision compares the stored payload (pre-image) with the
    /// fresh one, so it must run against the record as read inside the same
    /// atomic write.
    pub fn apply(&self, record: &mut CanonicalRecord, now: DateTime<Utc>) -> Result<bool, IntegrityError> {
        let mut reset = false;

        if let Some(payload) = &self.payload {
            if payload.kind() != record.kind() {
                return Err(IntegrityError(format!(
                    "record {} holds a {} payload, update carries {}",
                    record.key(),
                    record.kind(),
                    payload.kind()
                )));
            }
            reset = ordering::requires_reset(&record.payload, payload);
            record.payload = payload.clone();
        }
        if let Some(title) = &self.title {
            record.title = title.clone();
        }
        if let Some(body) = &self.body {
            record.body = body.clone();
        }
        if let Some(deeplink) = &self.deeplink {
            record.deeplink = Some(deeplink.clone());
        }
        if let Some(at) = self.created_at_external {
            record.created_at_external = Some(at);
        }
        if let Some(completed) = self.completed
            && completed != record.completed
        {
            record.completed = completed;
            record.completed_at = completed.then_some(now);
        }
        if let Some(deleted) = self.deleted
            && deleted != record.deleted
        {
            record.deleted = deleted;
            record.deleted_at = deleted.then_some(now);
        }

        if reset {
            record.ordering_key = 0;
        }
        record.updated_at = now;
        Ok(reset)
    }
}

/// Extra conjuncts on the (user, external id, source) match
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordFilter {
    Kind(RecordKind),
    Account(AccountId),
    Completed(bool),
    NotDeleted,
}

impl RecordFilter {
    pub fn matches(&self, record: &CanonicalRecord) -> bool {
        match self {
            RecordFilter::Kind(kind) => record.kind() == *kind,
            RecordFilter::Account(account) => &record.account_id == account,
            RecordFilter::Completed(completed) => record.completed == *completed,
            RecordFilter::NotDeleted => !record.deleted,
        }
    }

    pub fn matches_all(filters: &[RecordFilter], record: &CanonicalRecord) -> bool {
        filters.iter().all(|f| f.matches(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventDetails, SourceId, TaskDetails, UserId};
    use chrono::Duration;

    fn event_record(start: DateTime<Utc>) -> CanonicalRecord {
        let key = RecordKey::new(UserId::new("u1"), "evt-1", SourceId::GoogleCalendar);
        let mut record = NewRecord::new(
            AccountId::new("me@example.com"),
            "Standup",
            Payload::Event(EventDetails {
                start,
                end: start + Duration::minutes(15),
                conference_url: None,
            }),
        )
        .into_record(RecordId(1), &key, Utc::now());
        record.ordering_key = 5;
        record.has_been_reordered = true;
        record
    }

    #[test]
    fn test_apply_sets_only_given_fields() {
        let start = Utc::now();
        let mut record = event_record(start);
        let update = RecordUpdate {
            title: Some("Standup (moved room)".to_string()),
            ..Default::default()
        };

        let reset = update.apply(&mut record, Utc::now()).unwrap();
        assert!(!reset);
        assert_eq!(record.title, "Standup (moved room)");
        assert_eq!(record.ordering_key, 5);
        assert!(record.has_been_reordered);
    }

    #[test]
    fn test_apply_resets_ordering_on_reschedule() {
        let start = Utc::now();
        let mut record = event_record(start);
        let update = RecordUpdate {
            payload: Some(Payload::Event(EventDetails {
                start: start + Duration::hours(1),
                end: start + Duration::hours(2),
                conference_url: None,
            })),
            ..Default::default()
        };

        assert!(update.apply(&mut record, Utc::now()).unwrap());
        assert_eq!(record.ordering_key, 0);
    }

    #[test]
    fn test_apply_rejects_kind_change() {
        let mut record = event_record(Utc::now());
        let update = RecordUpdate {
            payload: Some(Payload::Task(TaskDetails::default())),
            ..Default::default()
        };
        assert!(update.apply(&mut record, Utc::now()).is_err());
    }

    #[test]
    fn test_completed_timestamps() {
        let mut record = event_record(Utc::now());
        let now = Utc::now();
        RecordUpdate {
            completed: Some(true),
            ..Default::default()
        }
        .apply(&mut record, now)
        .unwrap();
        assert!(record.completed);
        assert_eq!(record.completed_at, Some(now));

        RecordUpdate {
            completed: Some(false),
            ..Default::default()
        }
        .apply(&mut record, now)
        .unwrap();
        assert!(!record.completed);
        assert!(record.completed_at.is_none());
    }

    #[test]
    fn test_filters() {
        let record = event_record(Utc::now());
        assert!(RecordFilter::Kind(RecordKind::Event).matches(&record));
        assert!(!RecordFilter::Kind(RecordKind::Task).matches(&record));
        assert!(RecordFilter::NotDeleted.matches(&record));
        assert!(RecordFilter::matches_all(
            &[
                RecordFilter::Account(AccountId::new("me@example.com")),
                RecordFilter::Completed(false),
            ],
            &record
        ));
    }
}
