//! Ordering-reset rule
//!
//! A record's manual ordering key is forced back to 0 (unplaced), even after
//! the user reordered it, when:
//! - a calendar event's start time changes (plain equality, no tolerance)
//! - a ticket's priority identifier changes
//!
//! No other field change touches the ordering key.

use crate::models::Payload;

/// Whether replacing `stored` with `fresh` must reset the ordering key
pub fn requires_reset(stored: &Payload, fresh: &Payload) -> bool {
    match (stored, fresh) {
        (Payload::Event(stored), Payload::Event(fresh)) => stored.start != fresh.start,
        (Payload::Task(stored), Payload::Task(fresh)) => stored.priority_id != fresh.priority_id,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventDetails, TaskDetails};
    use chrono::{Duration, TimeZone, Utc};

    fn event(start_secs: i64, end_secs: i64) -> Payload {
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        Payload::Event(EventDetails {
            start: base + Duration::seconds(start_secs),
            end: base + Duration::seconds(end_secs),
            conference_url: None,
        })
    }

    fn task(priority: Option<&str>) -> Payload {
        Payload::Task(TaskDetails {
            priority_id: priority.map(str::to_string),
            due_date: None,
        })
    }

    #[test]
    fn test_reschedule_resets() {
        assert!(requires_reset(&event(0, 60), &event(3600, 3660)));
    }

    #[test]
    fn test_one_second_shift_resets() {
        assert!(requires_reset(&event(0, 60), &event(1, 60)));
    }

    #[test]
    fn test_end_change_only_does_not_reset() {
        assert!(!requires_reset(&event(0, 60), &event(0, 120)));
    }

    #[test]
    fn test_priority_change_resets() {
        assert!(requires_reset(&task(Some("P1")), &task(Some("P2"))));
        assert!(requires_reset(&task(None), &task(Some("P2"))));
        assert!(!requires_reset(&task(Some("P1")), &task(Some("P1"))));
    }

    #[test]
    fn test_other_kinds_never_reset() {
        assert!(!requires_reset(&task(Some("P1")), &event(0, 60)));
    }
}
