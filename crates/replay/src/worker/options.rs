//! Worker factory and worker configuration

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::poller::PollerConfig;
use crate::cache::EvictionPolicy;
use crate::reliability::duration_millis;

/// Options shared by every worker of a factory
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerFactoryOptions {
    /// Identity reported to the service when polling
    pub identity: String,

    /// Domain the workers belong to
    pub domain: String,

    /// Maximum number of cached deciders
    pub decider_cache_size: usize,

    /// Maximum number of logical workflow threads across all deciders
    pub max_workflow_thread_count: usize,

    /// Turn sticky execution off; every task then carries full history
    pub disable_sticky_execution: bool,

    /// Schedule-to-start timeout on the sticky queue
    #[serde(with = "duration_millis")]
    pub sticky_schedule_to_start_timeout: Duration,

    /// Which triggers may evict cached deciders
    pub eviction_policy: EvictionPolicy,
}

impl Default for WorkerFactoryOptions {
    fn default() -> Self {
        Self {
            identity: format!("worker-{}", Uuid::now_v7()),
            domain: "default".to_string(),
            decider_cache_size: 600,
            max_workflow_thread_count: 600,
            disable_sticky_execution: false,
            sticky_schedule_to_start_timeout: Duration::from_secs(5),
            eviction_policy: EvictionPolicy::default(),
        }
    }
}

impl WorkerFactoryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create options from environment variables
    ///
    /// Environment variables:
    /// - `DECIDER_CACHE_SIZE`: maximum cached deciders (default: 600)
    /// - `MAX_WORKFLOW_THREAD_COUNT`: logical thread budget (default: 600)
    /// - `DISABLE_STICKY_EXECUTION`: `true` or `1` turns sticky execution off
    /// - `STICKY_SCHEDULE_TO_START_SECS`: sticky schedule-to-start timeout (default: 5)
    ///
    /// Unset or unparsable values fall back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let decider_cache_size = parse_var("DECIDER_CACHE_SIZE").unwrap_or(defaults.decider_cache_size);
        let max_workflow_thread_count =
            parse_var("MAX_WORKFLOW_THREAD_COUNT").unwrap_or(defaults.max_workflow_thread_count);
        let disable_sticky_execution = env::var("DISABLE_STICKY_EXECUTION")
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(defaults.disable_sticky_execution);
        let sticky_schedule_to_start_timeout = parse_var("STICKY_SCHEDULE_TO_START_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.sticky_schedule_to_start_timeout);

        Self {
            decider_cache_size,
            max_workflow_thread_count,
            disable_sticky_execution,
            sticky_schedule_to_start_timeout,
            ..defaults
        }
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    pub fn with_decider_cache_size(mut self, size: usize) -> Self {
        self.decider_cache_size = size;
        self
    }

    /// Set the logical thread budget (at least one thread)
    pub fn with_max_workflow_thread_count(mut self, count: usize) -> Self {
        self.max_workflow_thread_count = count.max(1);
        self
    }

    pub fn with_sticky_execution_disabled(mut self, disabled: bool) -> Self {
        self.disable_sticky_execution = disabled;
        self
    }

    pub fn with_sticky_schedule_to_start_timeout(mut self, timeout: Duration) -> Self {
        self.sticky_schedule_to_start_timeout = timeout;
        self
    }

    pub fn with_eviction_policy(mut self, policy: EvictionPolicy) -> Self {
        self.eviction_policy = policy;
        self
    }
}

/// Options for a single worker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerOptions {
    /// Maximum decision tasks handled concurrently
    pub max_concurrent_decision_tasks: usize,

    /// Poll loop configuration
    pub poller: PollerConfig,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            max_concurrent_decision_tasks: 50,
            poller: PollerConfig::default(),
        }
    }
}

impl WorkerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create options from environment variables
    ///
    /// Reads `MAX_CONCURRENT_DECISION_TASKS` (default: 50).
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_concurrent_decision_tasks: parse_var("MAX_CONCURRENT_DECISION_TASKS")
                .unwrap_or(defaults.max_concurrent_decision_tasks),
            ..defaults
        }
    }

    /// Set maximum concurrency (at least one task)
    pub fn with_max_concurrent_decision_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_decision_tasks = max.max(1);
        self
    }

    pub fn with_poller(mut self, poller: PollerConfig) -> Self {
        self.poller = poller;
        self
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_defaults() {
        let options = WorkerFactoryOptions::default();
        assert!(options.identity.starts_with("worker-"));
        assert_eq!(options.decider_cache_size, 600);
        assert_eq!(options.max_workflow_thread_count, 600);
        assert!(!options.disable_sticky_execution);
        assert_eq!(options.sticky_schedule_to_start_timeout, Duration::from_secs(5));
        assert_eq!(options.eviction_policy, EvictionPolicy::CapacityAndStarvation);
    }

    #[test]
    fn test_factory_builder() {
        let options = WorkerFactoryOptions::new()
            .with_identity("host-1")
            .with_domain("orders")
            .with_decider_cache_size(10)
            .with_max_workflow_thread_count(0)
            .with_sticky_execution_disabled(true)
            .with_eviction_policy(EvictionPolicy::CapacityOnly);

        assert_eq!(options.identity, "host-1");
        assert_eq!(options.domain, "orders");
        assert_eq!(options.decider_cache_size, 10);
        assert_eq!(options.max_workflow_thread_count, 1);
        assert!(options.disable_sticky_execution);
        assert_eq!(options.eviction_policy, EvictionPolicy::CapacityOnly);
    }

    #[test]
    fn test_factory_options_serialization() {
        let options = WorkerFactoryOptions::new()
            .with_identity("host-1")
            .with_sticky_schedule_to_start_timeout(Duration::from_secs(7));

        let json = serde_json::to_value(&options).unwrap();
        assert_eq!(json["sticky_schedule_to_start_timeout"], 7000);
        assert_eq!(json["eviction_policy"], "capacity_and_starvation");

        let parsed: WorkerFactoryOptions = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, options);
    }

    #[test]
    fn test_worker_options() {
        let options = WorkerOptions::new().with_max_concurrent_decision_tasks(0);
        assert_eq!(options.max_concurrent_decision_tasks, 1);
        assert_eq!(options.poller, PollerConfig::default());
    }
}
