//! Activity abstractions
//!
//! Remote activities are executed by activity workers outside this crate; the
//! decider only schedules them and consumes their outcomes from history.
//! Local activities run in-process while a decision task is being handled and
//! their outcome is recorded as a marker.

mod error;
mod local;

pub use error::ActivityError;
pub use local::{
    ActivityMethodOptions, LocalActivityFn, LocalActivityOptions, LocalActivityOutcome,
    LocalActivityRegistry, INVALID_RETRY_POLICY,
};
