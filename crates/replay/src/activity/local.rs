//! Local activities: options, registry and in-process execution

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::ActivityError;
use crate::reliability::{option_duration_millis, RetryPolicy, RetryPolicyError};

/// Options declared alongside an activity method
///
/// Merged with per-call [`LocalActivityOptions`]; per-call values win.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ActivityMethodOptions {
    /// Declared schedule-to-close timeout
    #[serde(with = "option_duration_millis")]
    pub schedule_to_close_timeout: Option<Duration>,
}

/// Options controlling how a local activity is invoked
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LocalActivityOptions {
    /// Overall time the workflow is willing to wait for the activity
    #[serde(with = "option_duration_millis")]
    pub schedule_to_close_timeout: Option<Duration>,

    /// Retry policy. `None` means a single attempt.
    pub retry_policy: Option<RetryPolicy>,
}

impl LocalActivityOptions {
    /// Create empty options
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the schedule-to-close timeout
    pub fn with_schedule_to_close_timeout(mut self, timeout: Duration) -> Self {
        self.schedule_to_close_timeout = Some(timeout);
        self
    }

    /// Set the retry policy
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Merge method-level declarations with call options
    ///
    /// Call options take precedence over the method declaration, and the
    /// call's retry policy is overlaid on the method's retry policy. The
    /// result has all defaults filled in.
    pub fn merge(
        method: Option<&ActivityMethodOptions>,
        method_retry: Option<&RetryPolicy>,
        options: Option<&LocalActivityOptions>,
    ) -> Result<Self, RetryPolicyError> {
        let options = options.cloned().unwrap_or_default();

        let schedule_to_close_timeout = options
            .schedule_to_close_timeout
            .or_else(|| method.and_then(|m| m.schedule_to_close_timeout));

        let retry_policy = match (method_retry, options.retry_policy) {
            (Some(base), Some(call)) => Some(base.merge(&call)),
            (Some(base), None) => Some(base.clone()),
            (None, call) => call,
        };

        LocalActivityOptions {
            schedule_to_close_timeout,
            retry_policy,
        }
        .validate_and_build_with_defaults()
    }

    /// Round the timeout up to whole seconds and validate the retry policy
    pub fn validate_and_build_with_defaults(self) -> Result<Self, RetryPolicyError> {
        let retry_policy = self
            .retry_policy
            .map(RetryPolicy::validate_with_defaults)
            .transpose()?;

        Ok(Self {
            schedule_to_close_timeout: self.schedule_to_close_timeout.map(round_up_to_seconds),
            retry_policy,
        })
    }
}

fn round_up_to_seconds(duration: Duration) -> Duration {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        Duration::from_secs(secs + 1)
    } else {
        Duration::from_secs(secs)
    }
}

/// Error type reported when a local activity's retry policy is invalid
pub const INVALID_RETRY_POLICY: &str = "INVALID_RETRY_POLICY";

/// In-process local activity implementation
pub type LocalActivityFn = Arc<dyn Fn(Value) -> Result<Value, ActivityError> + Send + Sync>;

/// Outcome of running a local activity, as recorded in its marker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocalActivityOutcome {
    /// Activity type that ran
    pub activity_type: String,

    /// Number of attempts made
    pub attempts: u32,

    /// Result or final error
    pub result: Result<Value, ActivityError>,
}

/// Registry of local activity implementations keyed by activity type
#[derive(Clone, Default)]
pub struct LocalActivityRegistry {
    activities: HashMap<String, LocalActivityFn>,
}

impl LocalActivityRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a local activity
    pub fn register<F>(&mut self, activity_type: impl Into<String>, activity: F)
    where
        F: Fn(Value) -> Result<Value, ActivityError> + Send + Sync + 'static,
    {
        self.activities.insert(activity_type.into(), Arc::new(activity));
    }

    /// Check whether an activity type is registered
    pub fn contains(&self, activity_type: &str) -> bool {
        self.activities.contains_key(activity_type)
    }

    /// Run a local activity to completion, retrying per `options`
    ///
    /// Attempts are separated by the retry policy's backoff. A retry whose
    /// backoff would overrun the schedule-to-close timeout or the policy
    /// expiration is not made. Policies that could retry forever are
    /// rejected before the first attempt.
    pub fn execute(
        &self,
        activity_type: &str,
        input: Value,
        options: &LocalActivityOptions,
    ) -> LocalActivityOutcome {
        let Some(activity) = self.activities.get(activity_type) else {
            return LocalActivityOutcome {
                activity_type: activity_type.to_string(),
                attempts: 0,
                result: Err(ActivityError::non_retryable(format!(
                    "local activity type not registered: {}",
                    activity_type
                ))
                .with_type("NOT_REGISTERED")),
            };
        };

        let policy = match options
            .retry_policy
            .clone()
            .map(RetryPolicy::validate_with_defaults)
            .transpose()
        {
            Ok(policy) => policy.unwrap_or_else(RetryPolicy::no_retry),
            Err(e) => {
                warn!(activity_type, error = %e, "invalid local activity retry policy");
                return LocalActivityOutcome {
                    activity_type: activity_type.to_string(),
                    attempts: 0,
                    result: Err(ActivityError::non_retryable(e.to_string()).with_type(INVALID_RETRY_POLICY)),
                };
            }
        };

        let started = Instant::now();
        let deadline = [
            options.schedule_to_close_timeout,
            (!policy.expiration.is_zero()).then_some(policy.expiration),
        ]
        .into_iter()
        .flatten()
        .min();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = activity(input.clone());

            let error = match result {
                Ok(value) => {
                    debug!(activity_type, attempt, "local activity completed");
                    return LocalActivityOutcome {
                        activity_type: activity_type.to_string(),
                        attempts: attempt,
                        result: Ok(value),
                    };
                }
                Err(error) => error,
            };

            let timed_out = options
                .schedule_to_close_timeout
                .is_some_and(|timeout| started.elapsed() >= timeout);
            let expired = !policy.expiration.is_zero() && started.elapsed() >= policy.expiration;

            if timed_out {
                warn!(activity_type, attempt, "local activity timed out");
                return LocalActivityOutcome {
                    activity_type: activity_type.to_string(),
                    attempts: attempt,
                    result: Err(ActivityError::timeout(format!(
                        "schedule to close timeout exceeded after {} attempts: {}",
                        attempt, error.message
                    ))),
                };
            }

            let delay = policy.delay_for_attempt(attempt);
            let fits_deadline = deadline.map_or(true, |deadline| started.elapsed() + delay < deadline);
            let retry = error.retryable
                && !expired
                && fits_deadline
                && policy.should_retry(error.error_type.as_deref())
                && policy.has_attempts_remaining(attempt);

            if !retry {
                warn!(activity_type, attempt, error = %error, "local activity failed");
                return LocalActivityOutcome {
                    activity_type: activity_type.to_string(),
                    attempts: attempt,
                    result: Err(error),
                };
            }

            debug!(
                activity_type,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying local activity"
            );
            std::thread::sleep(delay);
        }
    }
}

impl fmt::Debug for LocalActivityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalActivityRegistry")
            .field("activity_types", &self.activities.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_round_up_to_seconds() {
        assert_eq!(round_up_to_seconds(Duration::from_millis(1500)), Duration::from_secs(2));
        assert_eq!(round_up_to_seconds(Duration::from_secs(3)), Duration::from_secs(3));
        assert_eq!(round_up_to_seconds(Duration::from_millis(1)), Duration::from_secs(1));
    }

    #[test]
    fn test_merge_without_method_options() {
        let options = LocalActivityOptions::new()
            .with_schedule_to_close_timeout(Duration::from_millis(2500));

        let merged = LocalActivityOptions::merge(None, None, Some(&options)).unwrap();
        assert_eq!(merged.schedule_to_close_timeout, Some(Duration::from_secs(3)));
        assert_eq!(merged.retry_policy, None);
    }

    #[test]
    fn test_merge_call_options_win() {
        let method = ActivityMethodOptions {
            schedule_to_close_timeout: Some(Duration::from_secs(60)),
        };
        let options =
            LocalActivityOptions::new().with_schedule_to_close_timeout(Duration::from_secs(10));

        let merged = LocalActivityOptions::merge(Some(&method), None, Some(&options)).unwrap();
        assert_eq!(merged.schedule_to_close_timeout, Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_merge_falls_back_to_method_timeout() {
        let method = ActivityMethodOptions {
            schedule_to_close_timeout: Some(Duration::from_secs(60)),
        };

        let merged = LocalActivityOptions::merge(Some(&method), None, None).unwrap();
        assert_eq!(merged.schedule_to_close_timeout, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_merge_overlays_retry_policy() {
        let method_retry = RetryPolicy::exponential().with_max_attempts(3);
        let call = LocalActivityOptions::new().with_retry_policy(RetryPolicy {
            max_attempts: 7,
            ..RetryPolicy::exponential()
        });

        let merged = LocalActivityOptions::merge(None, Some(&method_retry), Some(&call)).unwrap();
        assert_eq!(merged.retry_policy.unwrap().max_attempts, 7);
    }

    #[test]
    fn test_merge_rejects_invalid_retry() {
        let call = LocalActivityOptions::new()
            .with_retry_policy(RetryPolicy::exponential().with_backoff_coefficient(0.1));
        assert!(LocalActivityOptions::merge(None, None, Some(&call)).is_err());
    }

    #[test]
    fn test_execute_success() {
        let mut registry = LocalActivityRegistry::new();
        registry.register("double", |input| {
            let n = input.as_i64().unwrap_or(0);
            Ok(json!(n * 2))
        });

        let outcome = registry.execute("double", json!(21), &LocalActivityOptions::new());
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.result, Ok(json!(42)));
    }

    #[test]
    fn test_execute_retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let mut registry = LocalActivityRegistry::new();
        registry.register("flaky", move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ActivityError::retryable("not yet"))
            } else {
                Ok(json!("ok"))
            }
        });

        let options = LocalActivityOptions::new().with_retry_policy(
            RetryPolicy::exponential()
                .with_max_attempts(5)
                .with_initial_interval(Duration::from_millis(1)),
        );
        let outcome = registry.execute("flaky", json!(null), &options);

        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.result, Ok(json!("ok")));
    }

    #[test]
    fn test_execute_waits_between_attempts() {
        let mut registry = LocalActivityRegistry::new();
        registry.register("down", |_| Err(ActivityError::retryable("unavailable")));

        let options = LocalActivityOptions::new().with_retry_policy(
            RetryPolicy::exponential()
                .with_max_attempts(3)
                .with_initial_interval(Duration::from_millis(20))
                .with_backoff_coefficient(1.0),
        );
        let started = Instant::now();
        let outcome = registry.execute("down", json!(null), &options);

        assert_eq!(outcome.attempts, 3);
        assert!(outcome.result.is_err());
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_execute_rejects_unbounded_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let mut registry = LocalActivityRegistry::new();
        registry.register("down", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(ActivityError::retryable("unavailable"))
        });

        let options = LocalActivityOptions {
            schedule_to_close_timeout: None,
            retry_policy: Some(RetryPolicy::exponential().with_max_attempts(0)),
        };
        let outcome = registry.execute("down", json!(null), &options);

        assert_eq!(outcome.attempts, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let error = outcome.result.unwrap_err();
        assert_eq!(error.error_type.as_deref(), Some(INVALID_RETRY_POLICY));
        assert!(!error.retryable);
    }

    #[test]
    fn test_execute_stops_before_backoff_overruns_expiration() {
        let mut registry = LocalActivityRegistry::new();
        registry.register("down", |_| Err(ActivityError::retryable("unavailable")));

        let options = LocalActivityOptions::new().with_retry_policy(
            RetryPolicy::exponential()
                .with_max_attempts(0)
                .with_initial_interval(Duration::from_millis(50))
                .with_expiration(Duration::from_millis(200)),
        );
        let started = Instant::now();
        let outcome = registry.execute("down", json!(null), &options);

        assert!(outcome.result.is_err());
        assert!(outcome.attempts <= 3);
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    #[test]
    fn test_execute_stops_on_non_retryable() {
        let mut registry = LocalActivityRegistry::new();
        registry.register("broken", |_| Err(ActivityError::non_retryable("nope")));

        let options = LocalActivityOptions::new()
            .with_retry_policy(RetryPolicy::exponential().with_max_attempts(5));
        let outcome = registry.execute("broken", json!(null), &options);

        assert_eq!(outcome.attempts, 1);
        assert!(outcome.result.is_err());
    }

    #[test]
    fn test_execute_unknown_type() {
        let registry = LocalActivityRegistry::new();
        let outcome = registry.execute("missing", json!(null), &LocalActivityOptions::new());

        assert_eq!(outcome.attempts, 0);
        let error = outcome.result.unwrap_err();
        assert_eq!(error.error_type.as_deref(), Some("NOT_REGISTERED"));
    }
}
