#![forbid(unsafe_code)]

//! Failure classification and the bounded retry wrapper used for every
//! playlist mutation.

use crate::config::ApiSettings;
use crate::error::ApiError;
use log::{error, warn};
use std::thread;
use std::time::Duration;

const TRANSIENT_REASONS: [&str; 3] = ["serviceunavailable", "backenderror", "internalerror"];
const PERMANENT_REASONS: [&str; 4] = [
    "videonotfound",
    "forbidden",
    "playlistoperationunsupported",
    "duplicate",
];
const QUOTA_REASONS: [&str; 1] = ["quotaexceeded"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Infrastructure hiccup, worth retrying in the same run.
    Transient,
    /// Will never succeed; logged and dropped.
    Permanent,
    /// Daily quota consumed; retry on the next run.
    Quota,
    /// Anything else. Fatal for the item, reported in the exit status.
    Unknown,
}

/// Maps an API reason to its class. The API mixes `camelCase` and
/// `SCREAMING_SNAKE_CASE`, so matching ignores case and underscores.
pub fn classify(reason: &str) -> ErrorClass {
    let normalized = reason.to_ascii_lowercase().replace('_', "");
    let normalized = normalized.as_str();
    if TRANSIENT_REASONS.contains(&normalized) {
        ErrorClass::Transient
    } else if PERMANENT_REASONS.contains(&normalized) {
        ErrorClass::Permanent
    } else if QUOTA_REASONS.contains(&normalized) {
        ErrorClass::Quota
    } else {
        ErrorClass::Unknown
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_backoff: Duration::from_secs(32),
        }
    }
}

impl RetryPolicy {
    pub fn from_settings(api: &ApiSettings) -> Self {
        Self {
            max_retries: api.max_retries,
            base_delay: Duration::from_secs(api.base_delay_seconds),
            max_backoff: Duration::from_secs(api.max_backoff_seconds),
        }
    }

    /// `base_delay * 2^attempt`, capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

impl<S: Sleeper + ?Sized> Sleeper for &S {
    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Final disposition of one mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    /// Permanent failure, never retried and never ledgered.
    Permanent(ApiError),
    /// Quota exhaustion or retries used up; belongs in the ledger.
    Deferred(ApiError),
    /// Unclassified failure.
    Unknown(ApiError),
}

impl Outcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Outcome::Applied)
    }
}

#[derive(Debug, Clone)]
pub struct RetryExecutor<S = ThreadSleeper> {
    policy: RetryPolicy,
    sleeper: S,
}

impl RetryExecutor<ThreadSleeper> {
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_sleeper(policy, ThreadSleeper)
    }
}

impl<S: Sleeper> RetryExecutor<S> {
    pub fn with_sleeper(policy: RetryPolicy, sleeper: S) -> Self {
        Self { policy, sleeper }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `mutation` up to `max_retries` times. Only transient failures are
    /// retried; every attempt that fails transiently is followed by its
    /// backoff sleep.
    pub fn execute<F>(&self, label: &str, mut mutation: F) -> Outcome
    where
        F: FnMut() -> Result<(), ApiError>,
    {
        let mut last_error = None;
        for attempt in 0..self.policy.max_retries {
            let err = match mutation() {
                Ok(()) => return Outcome::Applied,
                Err(err) => err,
            };
            match classify(&err.reason) {
                ErrorClass::Transient => {
                    let delay = self.policy.backoff(attempt);
                    warn!(
                        "Transient error ({}) for {label}, retrying in {:.1}s (attempt {}/{})",
                        err.reason,
                        delay.as_secs_f64(),
                        attempt + 1,
                        self.policy.max_retries
                    );
                    self.sleeper.sleep(delay);
                    last_error = Some(err);
                }
                ErrorClass::Permanent => {
                    warn!(
                        "Permanent error ({}) for {label}, skipping: {}",
                        err.reason, err.message
                    );
                    return Outcome::Permanent(err);
                }
                ErrorClass::Quota => {
                    warn!("Quota exceeded for {label}, deferring to next run: {}", err.message);
                    return Outcome::Deferred(err);
                }
                ErrorClass::Unknown => {
                    error!("Unknown error ({}) for {label}: {}", err.reason, err.message);
                    return Outcome::Unknown(err);
                }
            }
        }
        let err =
            last_error.unwrap_or_else(|| ApiError::new("retriesExhausted", "no attempt made"));
        warn!(
            "Retries exhausted for {label} after {} attempt(s), deferring: {}",
            self.policy.max_retries, err
        );
        Outcome::Deferred(err)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::Sleeper;
    use std::cell::RefCell;
    use std::time::Duration;

    /// Records requested sleeps instead of blocking.
    #[derive(Debug, Default)]
    pub struct RecordingSleeper {
        pub sleeps: RefCell<Vec<Duration>>,
    }

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, duration: Duration) {
            self.sleeps.borrow_mut().push(duration);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingSleeper;
    use super::*;

    fn executor(sleeper: &RecordingSleeper) -> RetryExecutor<&RecordingSleeper> {
        RetryExecutor::with_sleeper(RetryPolicy::default(), sleeper)
    }

    #[test]
    fn classify_known_reasons() {
        assert_eq!(classify("serviceUnavailable"), ErrorClass::Transient);
        assert_eq!(classify("backendError"), ErrorClass::Transient);
        assert_eq!(classify("INTERNAL_ERROR"), ErrorClass::Transient);
        assert_eq!(classify("videoNotFound"), ErrorClass::Permanent);
        assert_eq!(classify("forbidden"), ErrorClass::Permanent);
        assert_eq!(classify("playlistOperationUnsupported"), ErrorClass::Permanent);
        assert_eq!(classify("duplicate"), ErrorClass::Permanent);
        assert_eq!(classify("quotaExceeded"), ErrorClass::Quota);
        assert_eq!(classify("QUOTA_EXCEEDED"), ErrorClass::Quota);
    }

    #[test]
    fn classify_is_total() {
        let reasons = ["", "rateLimitExceeded", "transportError", "quota", "duplicates", "ünïcode"];
        for reason in reasons {
            assert_eq!(classify(reason), ErrorClass::Unknown, "{reason}");
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert_eq!(policy.backoff(6), Duration::from_secs(32));
        assert_eq!(policy.backoff(40), Duration::from_secs(32));
    }

    #[test]
    fn always_transient_exhausts_retries_and_defers() {
        let sleeper = RecordingSleeper::default();
        let mut attempts = 0;
        let outcome = executor(&sleeper).execute("vid", || {
            attempts += 1;
            Err(ApiError::new("backendError", "try later"))
        });
        assert_eq!(attempts, 3);
        assert_eq!(
            *sleeper.sleeps.borrow(),
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
        assert!(matches!(outcome, Outcome::Deferred(err) if err.reason == "backendError"));
    }

    #[test]
    fn transient_then_success_is_applied() {
        let sleeper = RecordingSleeper::default();
        let mut attempts = 0;
        let outcome = executor(&sleeper).execute("vid", || {
            attempts += 1;
            if attempts < 2 {
                Err(ApiError::new("serviceUnavailable", "blip"))
            } else {
                Ok(())
            }
        });
        assert_eq!(outcome, Outcome::Applied);
        assert_eq!(attempts, 2);
        assert_eq!(*sleeper.sleeps.borrow(), vec![Duration::from_secs(1)]);
    }

    #[test]
    fn permanent_is_not_retried() {
        let sleeper = RecordingSleeper::default();
        let mut attempts = 0;
        let outcome = executor(&sleeper).execute("vid", || {
            attempts += 1;
            Err(ApiError::new("videoNotFound", "gone"))
        });
        assert_eq!(attempts, 1);
        assert!(sleeper.sleeps.borrow().is_empty());
        assert!(matches!(outcome, Outcome::Permanent(_)));
    }

    #[test]
    fn quota_defers_immediately() {
        let sleeper = RecordingSleeper::default();
        let mut attempts = 0;
        let outcome = executor(&sleeper).execute("vid", || {
            attempts += 1;
            Err(ApiError::new("quotaExceeded", "daily limit"))
        });
        assert_eq!(attempts, 1);
        assert!(sleeper.sleeps.borrow().is_empty());
        assert!(matches!(outcome, Outcome::Deferred(_)));
    }

    #[test]
    fn unknown_surfaces_without_retry() {
        let sleeper = RecordingSleeper::default();
        let mut attempts = 0;
        let outcome = executor(&sleeper).execute("vid", || {
            attempts += 1;
            Err(ApiError::new("rateLimitExceeded", "slow down"))
        });
        assert_eq!(attempts, 1);
        assert!(matches!(outcome, Outcome::Unknown(err) if err.reason == "rateLimitExceeded"));
    }
}
