//! Workflow abstractions and types
//!
//! This module contains the workflow-facing primitives:
//! - [`Workflow`] trait for defining workflows as async functions
//! - [`WorkflowContext`] for deterministic interaction with the outside world
//! - [`Decision`] enum for commands sent to the service

mod context;
mod decision;
mod definition;

pub use context::{
    ActivityFuture, ConditionFuture, JoinHandle, SignalFuture, TimerFuture, WorkflowContext,
    LOCAL_ACTIVITY_MARKER, SIDE_EFFECT_MARKER,
};
pub use decision::{ActivityOptions, Decision};
pub use definition::{Workflow, WorkflowError};
