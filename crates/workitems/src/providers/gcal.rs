//! Google Calendar adapter

use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};
use serde::Serialize;

use super::{
    Capability, CapabilitySet, EventChanges, EventDraft, FetchedItem, HttpClient, Provider,
    ProviderContext, DEFAULT_SECTION,
};
use crate::error::ProviderError;
use crate::models::{AccountId, EventDetails, Payload, SourceId};
use crate::reconcile::{NewRecord, RecordUpdate};

mod api {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct EventList {
        #[serde(default)]
        pub items: Vec<CalendarEvent>,
        pub next_page_token: Option<String>,
    }

    #[derive(Debug, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct CalendarEvent {
        pub id: String,
        pub status: Option<String>,
        #[serde(default)]
        pub summary: String,
        #[serde(default)]
        pub description: String,
        pub html_link: Option<String>,
        pub start: Option<EventTime>,
        pub end: Option<EventTime>,
        #[serde(default)]
        pub attendees: Vec<Attendee>,
        pub conference_data: Option<ConferenceData>,
    }

    /// Timed events carry `dateTime`; all-day events only `date`
    #[derive(Debug, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct EventTime {
        #[serde(skip_serializing_if = "Option::is_none")]
        pub date_time: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub date: Option<String>,
    }

    #[derive(Debug, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Attendee {
        #[serde(rename = "self", default)]
        pub is_self: bool,
        pub response_status: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ConferenceData {
        #[serde(default)]
        pub entry_points: Vec<EntryPoint>,
    }

    #[derive(Debug, Deserialize)]
    pub struct EntryPoint {
        pub uri: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Created {
        pub id: String,
    }
}

use api::{CalendarEvent, Created, EventList, EventTime};

#[derive(Debug, Serialize)]
struct EventBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    start: Option<EventTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    end: Option<EventTime>,
}

fn event_time(at: DateTime<Utc>) -> EventTime {
    EventTime {
        date_time: Some(at.to_rfc3339()),
        date: None,
    }
}

/// Events on the user's primary calendar inside a rolling window
pub struct GoogleCalendarProvider {
    http: HttpClient,
    base_url: String,
    window: Duration,
}

impl GoogleCalendarProvider {
    pub fn new(http: HttpClient, base_url: impl Into<String>, window: Duration) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            window,
        }
    }

    fn events_url(&self) -> String {
        format!("{}/calendars/primary/events", self.base_url)
    }

    fn list_window(
        &self,
        ctx: &ProviderContext,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CalendarEvent>, ProviderError> {
        let mut events = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            if ctx.cancel.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }
            let mut url = format!(
                "{}?timeMin={}&timeMax={}&singleEvents=true&orderBy=startTime&showDeleted=true",
                self.events_url(),
                urlencoding::encode(&start.to_rfc3339()),
                urlencoding::encode(&end.to_rfc3339()),
            );
            if let Some(token) = &page_token {
                url.push_str(&format!("&pageToken={}", urlencoding::encode(token)));
            }
            let page: EventList = self.http.get_json(&url, &ctx.token)?;
            events.extend(page.items);
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(events)
    }
}

impl Provider for GoogleCalendarProvider {
    fn source_id(&self) -> SourceId {
        SourceId::GoogleCalendar
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::of(&[
            Capability::FetchEvents,
            Capability::CreateEvent,
            Capability::ModifyEvent,
        ])
    }

    fn fetch_events(&self, ctx: &ProviderContext) -> Result<Vec<FetchedItem>, ProviderError> {
        let start = Utc::now();
        let events = self.list_window(ctx, start, start + self.window)?;
        debug!(
            "[SYNC] Calendar returned {} events for {}",
            events.len(),
            ctx.account_id
        );
        Ok(events
            .into_iter()
            .filter_map(|event| to_item(event, &ctx.account_id, start))
            .collect())
    }

    fn create_event(&self, ctx: &ProviderContext, event: &EventDraft) -> Result<String, ProviderError> {
        let body = EventBody {
            summary: Some(&event.title),
            description: Some(&event.body),
            start: Some(event_time(event.start)),
            end: Some(event_time(event.end)),
        };
        let created: Created = self.http.post_json(&self.events_url(), &ctx.token, &body)?;
        Ok(created.id)
    }

    fn modify_event(
        &self,
        ctx: &ProviderContext,
        external_id: &str,
        changes: &EventChanges,
    ) -> Result<(), ProviderError> {
        let body = EventBody {
            summary: changes.title.as_deref(),
            description: None,
            start: changes.start.map(event_time),
            end: changes.end.map(event_time),
        };
        let url = format!("{}/{}", self.events_url(), urlencoding::encode(external_id));
        self.http.patch_json(&url, &ctx.token, &body)
    }
}

fn parse_time(time: Option<&EventTime>) -> Option<DateTime<Utc>> {
    let raw = time?.date_time.as_deref()?;
    match DateTime::parse_from_rfc3339(raw) {
        Ok(at) => Some(at.with_timezone(&Utc)),
        Err(e) => {
            warn!("[SYNC] Skipping calendar time {:?}: {}", raw, e);
            None
        }
    }
}

/// Convert one calendar event, or `None` if it should not become a record
fn to_item(event: CalendarEvent, account_id: &AccountId, now: DateTime<Utc>) -> Option<FetchedItem> {
    if event.status.as_deref() == Some("cancelled") {
        let placeholder = EventDetails {
            start: now,
            end: now,
            conference_url: None,
        };
        let new = NewRecord::new(account_id.clone(), event.summary, Payload::Event(placeholder));
        return Some(FetchedItem::removed(event.id, new));
    }

    // All-day events have no start time
    let start = parse_time(event.start.as_ref())?;
    let end = parse_time(event.end.as_ref()).unwrap_or(start);

    if event.summary.to_lowercase().contains("via clockwise") {
        return None;
    }
    let declined = event
        .attendees
        .iter()
        .any(|a| a.is_self && a.response_status.as_deref() == Some("declined"));
    if declined {
        return None;
    }

    let details = EventDetails {
        start,
        end,
        conference_url: conference_url(&event, account_id),
    };
    let deeplink = event
        .html_link
        .as_ref()
        .map(|link| format!("{}&authuser={}", link, account_id));

    let mut new = NewRecord::new(account_id.clone(), event.summary.clone(), Payload::Event(details.clone()))
        .with_body(event.description.clone())
        .with_section(DEFAULT_SECTION);
    if let Some(link) = &deeplink {
        new = new.with_deeplink(link.clone());
    }
    let update = RecordUpdate {
        title: Some(event.summary),
        body: Some(event.description),
        deeplink,
        // A restored event comes back after its cancellation was soft-deleted
        deleted: Some(false),
        payload: Some(Payload::Event(details)),
        ..Default::default()
    };
    Some(FetchedItem::new(event.id, new, update))
}

fn conference_url(event: &CalendarEvent, account_id: &AccountId) -> Option<String> {
    let url = event
        .conference_data
        .as_ref()?
        .entry_points
        .iter()
        .find_map(|e| e.uri.clone())?;
    if url.contains("meet.google.com") {
        Some(format!("{}?authuser={}", url, account_id))
    } else {
        Some(url)
    }
}
