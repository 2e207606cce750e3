//! Bounded exponential backoff for per-item external fetches

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::CancelToken;
use crate::error::ProviderError;

/// Retry policy applied uniformly to every per-item external fetch
///
/// Delay doubles from `base_delay_ms` up to `max_delay_ms`, plus jitter.
/// Only errors that report [`ProviderError::is_retryable`] are retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 2_000,
        }
    }
}

impl RetryPolicy {
    /// A policy that tries once
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Delay before attempt `attempt + 1` (attempt is 1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = 2u64.saturating_pow(attempt.saturating_sub(1));
        let base = self
            .base_delay_ms
            .saturating_mul(exponent)
            .min(self.max_delay_ms);
        Duration::from_millis(base.saturating_add(rand_jitter(self.base_delay_ms)))
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, the
    /// attempts are exhausted or `cancel` fires
    pub fn run<T, F>(&self, label: &str, cancel: &CancelToken, mut op: F) -> Result<T, ProviderError>
    where
        F: FnMut(u32) -> Result<T, ProviderError>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            if cancel.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }

            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self.delay_for(attempt);
                    debug!(
                        "[SYNC] {} attempt {}/{} failed: {}; retrying in {:?}",
                        label, attempt, max_attempts, e, delay
                    );
                    if !cancel.sleep(delay) {
                        return Err(ProviderError::Cancelled);
                    }
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_retryable() {
                        warn!(
                            "[SYNC] {} giving up after {} attempts: {}",
                            label, attempt, e
                        );
                    }
                    return Err(e);
                }
            }
        }
    }
}

/// Random jitter in `0..=base/2` ms; zero when the base delay is zero
fn rand_jitter(base_delay_ms: u64) -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let span = base_delay_ms / 2;
    if span == 0 {
        return 0;
    }
    let hasher = RandomState::new().build_hasher();
    hasher.finish() % (span + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    #[test]
    fn test_succeeds_after_transient_failures() {
        let calls = Cell::new(0);
        let result = fast_policy(3).run("fetch", &CancelToken::new(), |_| {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(ProviderError::Transient("503".into()))
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let calls = Cell::new(0);
        let result: Result<(), _> = fast_policy(4).run("fetch", &CancelToken::new(), |_| {
            calls.set(calls.get() + 1);
            Err(ProviderError::Transient("503".into()))
        });
        assert!(matches!(result, Err(ProviderError::Transient(_))));
        assert_eq!(calls.get(), 4);
    }

    #[test]
    fn test_non_retryable_fails_immediately() {
        let calls = Cell::new(0);
        let result: Result<(), _> = fast_policy(5).run("fetch", &CancelToken::new(), |_| {
            calls.set(calls.get() + 1);
            Err(ProviderError::BadCredential("invalid_grant".into()))
        });
        assert!(result.unwrap_err().is_bad_credential());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_cancelled_before_start() {
        let token = CancelToken::new();
        token.cancel();
        let result: Result<(), _> = fast_policy(3).run("fetch", &token, |_| Ok(()));
        assert!(matches!(result, Err(ProviderError::Cancelled)));
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay_ms: 1,
            max_delay_ms: 8,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(1));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2));
        assert_eq!(policy.delay_for(3), Duration::from_millis(4));
        assert_eq!(policy.delay_for(6), Duration::from_millis(8));
    }
}
