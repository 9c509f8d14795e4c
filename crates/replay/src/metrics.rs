//! Metrics emitted by the decision pipeline
//!
//! Sinks are fire-and-forget: methods return nothing, so a failing backend
//! cannot change decision outcomes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Metric names
pub mod names {
    pub const STICKY_CACHE_HIT: &str = "sticky_cache_hit";
    pub const STICKY_CACHE_MISS: &str = "sticky_cache_miss";
    pub const STICKY_CACHE_EVICTION: &str = "sticky_cache_eviction";
    pub const STICKY_CACHE_THREAD_FORCED_EVICTION: &str = "sticky_cache_thread_forced_eviction";
    pub const STICKY_CACHE_STALL: &str = "sticky_cache_stall";
    pub const STICKY_CACHE_SIZE: &str = "sticky_cache_size";
    pub const DECISION_TASK_COMPLETED: &str = "decision_task_completed";
    pub const DECISION_TASK_FAILED: &str = "decision_task_failed";
    pub const DECISION_TASK_NON_DETERMINISTIC: &str = "decision_task_non_deterministic";
    pub const QUERY_TASK_COMPLETED: &str = "query_task_completed";
}

/// Destination for counters and gauges
pub trait MetricsSink: Send + Sync {
    fn increment(&self, name: &'static str, delta: u64);

    fn gauge(&self, name: &'static str, value: f64);
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment(&self, _name: &'static str, _delta: u64) {}

    fn gauge(&self, _name: &'static str, _value: f64) {}
}

/// Keeps metrics in memory, for tests and diagnostics
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: Mutex<HashMap<&'static str, AtomicU64>>,
    gauges: Mutex<HashMap<&'static str, f64>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn gauge_value(&self, name: &str) -> Option<f64> {
        self.gauges.lock().get(name).copied()
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment(&self, name: &'static str, delta: u64) {
        self.counters
            .lock()
            .entry(name)
            .or_default()
            .fetch_add(delta, Ordering::Relaxed);
    }

    fn gauge(&self, name: &'static str, value: f64) {
        self.gauges.lock().insert(name, value);
    }
}
