//! Connection to the orchestration service
//!
//! The service hands out decision tasks per task queue and accepts one
//! response per task. Transport and wire encoding live behind
//! [`DecisionTaskSource`].

mod memory;

use async_trait::async_trait;

use crate::handler::HandlerResult;
use crate::history::DecisionTask;

pub use memory::InMemoryDecisionTaskSource;

/// Error type for task source operations
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The service could not be reached
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// The task token is unknown or already answered
    #[error("unknown task token")]
    UnknownTask,

    /// Payload could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Source of decision tasks and sink for their results
#[async_trait]
pub trait DecisionTaskSource: Send + Sync + 'static {
    /// Poll one task from `task_queue`
    ///
    /// Returns `Ok(None)` when no task is available right now.
    async fn poll_decision_task(
        &self,
        task_queue: &str,
        identity: &str,
    ) -> Result<Option<DecisionTask>, SourceError>;

    /// Report the outcome of a task
    async fn respond(&self, result: HandlerResult) -> Result<(), SourceError>;
}
