//! Decision task handling
//!
//! [`ReplayDecisionTaskHandler`] turns a [`DecisionTask`](crate::history::DecisionTask)
//! into a [`HandlerResult`], choosing between replaying full history on a
//! fresh decider and resuming a cached one.

mod result;
mod task_handler;

pub use result::{DecisionTaskFailedCause, HandlerResult, QueryCompleted, TaskCompleted, TaskFailed};
pub use task_handler::{HandlerError, HandlerOptions, ReplayDecisionTaskHandler};
