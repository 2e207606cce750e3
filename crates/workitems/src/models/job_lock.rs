//! Write-once, time-bucketed job lock

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How finely a job's at-most-once window is cut
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Day,
    Hour,
}

impl Granularity {
    /// Deterministic bucket for `now` (UTC): `YYYY-MM-DD` or `YYYY-MM-DDTHH`
    pub fn bucket(&self, now: DateTime<Utc>) -> String {
        match self {
            Granularity::Day => now.format("%Y-%m-%d").to_string(),
            Granularity::Hour => now.format("%Y-%m-%dT%H").to_string(),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "day" => Some(Granularity::Day),
            "hour" => Some(Granularity::Hour),
            _ => None,
        }
    }
}

/// Claim on a (job, bucket); never released
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobLock {
    pub job_name: String,
    pub bucket: String,
    /// Identifier of the claiming runner
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
}

impl JobLock {
    pub fn new(job_name: impl Into<String>, bucket: impl Into<String>, holder: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
            bucket: bucket.into(),
            holder: holder.into(),
            acquired_at: Utc::now(),
        }
    }

    /// Lock id as handed back to the scheduler
    pub fn lock_id(&self) -> String {
        format!("{}@{}", self.job_name, self.bucket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_buckets() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 7, 45, 12).unwrap();
        assert_eq!(Granularity::Day.bucket(now), "2024-01-01");
        assert_eq!(Granularity::Hour.bucket(now), "2024-01-01T07");
    }

    #[test]
    fn test_same_hour_same_bucket() {
        let a = Utc.with_ymd_and_hms(2024, 3, 9, 23, 0, 0).unwrap();
        let b = Utc.with_ymd_and_hms(2024, 3, 9, 23, 59, 59).unwrap();
        let c = Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap();
        assert_eq!(Granularity::Hour.bucket(a), Granularity::Hour.bucket(b));
        assert_ne!(Granularity::Day.bucket(b), Granularity::Day.bucket(c));
    }

    #[test]
    fn test_lock_id() {
        let lock = JobLock::new("daily_digest", "2024-01-01", "worker-1");
        assert_eq!(lock.lock_id(), "daily_digest@2024-01-01");
    }
}
