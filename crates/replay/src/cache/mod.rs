//! Bounded cache of live workflow executions
//!
//! Sticky execution keeps a workflow's decider in memory between decision
//! tasks so the next task only needs the new events. The cache bounds how
//! many deciders stay resident and serializes access to each one.

mod decider_cache;

pub use decider_cache::{DeciderCache, DeciderLease};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::history::WorkflowExecutionKey;
use crate::replay::RegistryError;

/// Which conditions may evict a cached decider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Evict only to stay within the configured entry count
    CapacityOnly,

    /// Also evict idle deciders when a workflow thread cannot get a permit
    #[default]
    CapacityAndStarvation,
}

/// Errors from cache lookups
#[derive(Debug, Error)]
pub enum CacheError {
    /// Partial history arrived but nothing is cached for the execution
    #[error("no cached decider for {0}")]
    MissingDecider(WorkflowExecutionKey),

    /// The decider was evicted while waiting for it
    #[error("cached decider for {0} was evicted")]
    Evicted(WorkflowExecutionKey),

    /// Building a fresh decider failed
    #[error(transparent)]
    Build(#[from] RegistryError),
}
