//! Retry policy attached to activity decisions

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry configuration for activities
///
/// Remote activity retries are executed by the orchestration service; the
/// policy is carried verbatim on `ScheduleActivityTask` decisions. Local
/// activities are retried in-process by the decider using the same policy.
///
/// # Example
///
/// ```
/// use durable_replay::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_attempts(5)
///     .with_initial_interval(Duration::from_secs(1))
///     .with_max_interval(Duration::from_secs(60));
///
/// assert!(policy.has_attempts_remaining(4));
/// assert!(!policy.has_attempts_remaining(5));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including initial). Zero means unlimited.
    pub max_attempts: u32,

    /// Initial delay before first retry
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Maximum delay between retries. Zero means "derive from initial interval".
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier (e.g., 2.0 for exponential). Zero means default.
    pub backoff_coefficient: f64,

    /// Overall time budget for all attempts. Zero means unbounded.
    #[serde(with = "duration_millis")]
    pub expiration: Duration,

    /// Error types that should NOT be retried
    #[serde(default)]
    pub non_retryable_errors: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Default backoff coefficient applied by [`validate_with_defaults`](Self::validate_with_defaults)
    pub const DEFAULT_BACKOFF_COEFFICIENT: f64 = 2.0;

    /// Maximum interval defaults to this multiple of the initial interval
    pub const DEFAULT_MAX_INTERVAL_MULTIPLIER: u32 = 100;

    /// Exponential backoff with sensible defaults
    ///
    /// - 5 max attempts
    /// - 1 second initial interval
    /// - 60 second max interval
    /// - 2x backoff coefficient
    pub fn exponential() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            backoff_coefficient: Self::DEFAULT_BACKOFF_COEFFICIENT,
            expiration: Duration::ZERO,
            non_retryable_errors: vec![],
        }
    }

    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            expiration: Duration::ZERO,
            non_retryable_errors: vec![],
        }
    }

    /// Set the maximum number of attempts
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the initial retry interval
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    /// Set the maximum retry interval
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set the backoff coefficient
    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    /// Set the overall expiration
    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = expiration;
        self
    }

    /// Add a non-retryable error type
    pub fn with_non_retryable_error(mut self, error_type: impl Into<String>) -> Self {
        self.non_retryable_errors.push(error_type.into());
        self
    }

    /// Fill unset fields with defaults and reject invalid combinations
    pub fn validate_with_defaults(mut self) -> Result<Self, RetryPolicyError> {
        if self.backoff_coefficient == 0.0 {
            self.backoff_coefficient = Self::DEFAULT_BACKOFF_COEFFICIENT;
        }
        if self.backoff_coefficient < 1.0 {
            return Err(RetryPolicyError::InvalidBackoff(self.backoff_coefficient));
        }
        if self.max_attempts == 0 && self.expiration.is_zero() {
            return Err(RetryPolicyError::Unbounded);
        }
        if self.initial_interval.is_zero() && self.max_attempts != 1 {
            return Err(RetryPolicyError::MissingInitialInterval);
        }
        if self.max_interval.is_zero() {
            self.max_interval = self.initial_interval * Self::DEFAULT_MAX_INTERVAL_MULTIPLIER;
        }
        if self.max_interval < self.initial_interval {
            return Err(RetryPolicyError::MaxIntervalTooSmall {
                initial: self.initial_interval,
                max: self.max_interval,
            });
        }
        Ok(self)
    }

    /// Overlay `override_with` on top of `self`; set fields of the override win
    pub fn merge(&self, override_with: &RetryPolicy) -> RetryPolicy {
        RetryPolicy {
            max_attempts: pick(override_with.max_attempts, self.max_attempts, 0),
            initial_interval: pick(override_with.initial_interval, self.initial_interval, Duration::ZERO),
            max_interval: pick(override_with.max_interval, self.max_interval, Duration::ZERO),
            backoff_coefficient: if override_with.backoff_coefficient != 0.0 {
                override_with.backoff_coefficient
            } else {
                self.backoff_coefficient
            },
            expiration: pick(override_with.expiration, self.expiration, Duration::ZERO),
            non_retryable_errors: if override_with.non_retryable_errors.is_empty() {
                self.non_retryable_errors.clone()
            } else {
                override_with.non_retryable_errors.clone()
            },
        }
    }

    /// Backoff before the retry that follows `attempt` (1-based)
    ///
    /// Grows by the backoff coefficient and is capped at the max interval
    /// when one is set.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay = self.initial_interval.as_secs_f64() * self.backoff_coefficient.max(1.0).powi(exponent);
        let capped = if self.max_interval.is_zero() {
            delay
        } else {
            delay.min(self.max_interval.as_secs_f64())
        };
        Duration::try_from_secs_f64(capped).unwrap_or(Duration::MAX)
    }

    /// Check if an error type should be retried
    pub fn should_retry(&self, error_type: Option<&str>) -> bool {
        match error_type {
            Some(error_type) => !self.non_retryable_errors.iter().any(|e| e == error_type),
            None => true,
        }
    }

    /// Check if there are remaining attempts after `current_attempt` (1-based)
    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        self.max_attempts == 0 || current_attempt < self.max_attempts
    }
}

fn pick<T: PartialEq + Copy>(preferred: T, fallback: T, unset: T) -> T {
    if preferred != unset {
        preferred
    } else {
        fallback
    }
}

/// Invalid retry policy
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RetryPolicyError {
    /// Backoff below 1.0 would shrink intervals
    #[error("backoff coefficient must be >= 1.0, got {0}")]
    InvalidBackoff(f64),

    /// Unlimited attempts need an expiration to stop retrying
    #[error("maximum attempts and expiration cannot both be unset")]
    Unbounded,

    /// Retrying requires a non-zero initial interval
    #[error("initial interval is required when retries are allowed")]
    MissingInitialInterval,

    /// Max interval below initial interval
    #[error("max interval {max:?} is smaller than initial interval {initial:?}")]
    MaxIntervalTooSmall { initial: Duration, max: Duration },
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Serde support for Option<Duration> as milliseconds
pub(crate) mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => (d.as_millis() as u64).serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_defaults() {
        let policy = RetryPolicy::exponential();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_interval, Duration::from_secs(1));
        assert_eq!(policy.backoff_coefficient, 2.0);
    }

    #[test]
    fn test_no_retry() {
        let policy = RetryPolicy::no_retry();
        assert!(!policy.has_attempts_remaining(1));
        assert!(policy.validate_with_defaults().is_ok());
    }

    #[test]
    fn test_unlimited_attempts() {
        let policy = RetryPolicy::exponential().with_max_attempts(0);
        assert!(policy.has_attempts_remaining(1_000));
    }

    #[test]
    fn test_validate_rejects_unbounded_retries() {
        let result = RetryPolicy::exponential().with_max_attempts(0).validate_with_defaults();
        assert_eq!(result, Err(RetryPolicyError::Unbounded));

        let bounded = RetryPolicy::exponential()
            .with_max_attempts(0)
            .with_expiration(Duration::from_secs(30))
            .validate_with_defaults();
        assert!(bounded.is_ok());
    }

    #[test]
    fn test_delay_for_attempt() {
        let policy = RetryPolicy::exponential()
            .with_initial_interval(Duration::from_secs(1))
            .with_max_interval(Duration::from_secs(5));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(5));
    }

    #[test]
    fn test_validate_fills_defaults() {
        let policy = RetryPolicy::exponential()
            .with_backoff_coefficient(0.0)
            .with_max_interval(Duration::ZERO)
            .validate_with_defaults()
            .unwrap();

        assert_eq!(policy.backoff_coefficient, 2.0);
        assert_eq!(policy.max_interval, Duration::from_secs(100));
    }

    #[test]
    fn test_validate_rejects_shrinking_backoff() {
        let result = RetryPolicy::exponential()
            .with_backoff_coefficient(0.5)
            .validate_with_defaults();
        assert_eq!(result, Err(RetryPolicyError::InvalidBackoff(0.5)));
    }

    #[test]
    fn test_validate_rejects_small_max_interval() {
        let result = RetryPolicy::exponential()
            .with_initial_interval(Duration::from_secs(10))
            .with_max_interval(Duration::from_secs(1))
            .validate_with_defaults();
        assert!(matches!(result, Err(RetryPolicyError::MaxIntervalTooSmall { .. })));
    }

    #[test]
    fn test_merge_prefers_override() {
        let base = RetryPolicy::exponential().with_non_retryable_error("BASE");
        let override_with = RetryPolicy {
            max_attempts: 9,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff_coefficient: 0.0,
            expiration: Duration::from_secs(30),
            non_retryable_errors: vec![],
        };

        let merged = base.merge(&override_with);
        assert_eq!(merged.max_attempts, 9);
        assert_eq!(merged.initial_interval, Duration::from_secs(1));
        assert_eq!(merged.backoff_coefficient, 2.0);
        assert_eq!(merged.expiration, Duration::from_secs(30));
        assert_eq!(merged.non_retryable_errors, vec!["BASE".to_string()]);
    }

    #[test]
    fn test_non_retryable_errors() {
        let policy = RetryPolicy::exponential()
            .with_non_retryable_error("INVALID_INPUT")
            .with_non_retryable_error("NOT_FOUND");

        assert!(!policy.should_retry(Some("INVALID_INPUT")));
        assert!(!policy.should_retry(Some("NOT_FOUND")));
        assert!(policy.should_retry(Some("TIMEOUT")));
        assert!(policy.should_retry(None));
    }
}
