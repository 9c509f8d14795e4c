//! Responses produced by the decision task handler

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::history::StickyExecutionAttributes;
use crate::workflow::{Decision, WorkflowError};

/// Why a decision task could not be completed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionTaskFailedCause {
    /// Cached state is missing or stale; resend the full history
    ResetStickyTaskQueue,

    /// Workflow code no longer matches its history
    NonDeterministicWorkflow,

    /// Workflow code panicked or could not be scheduled
    UnhandledFailure,
}

/// Successful decision task outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCompleted {
    pub task_token: Vec<u8>,

    /// Decisions in emission order
    pub decisions: Vec<Decision>,

    /// Present only when the decider was cached on this worker
    pub sticky_attributes: Option<StickyExecutionAttributes>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailed {
    pub task_token: Vec<u8>,
    pub cause: DecisionTaskFailedCause,
    pub details: String,
}

/// Answer to a legacy query task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryCompleted {
    pub task_token: Vec<u8>,
    pub result: Result<Value, WorkflowError>,
}

/// Outcome of handling one decision task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandlerResult {
    Completed(TaskCompleted),
    Failed(TaskFailed),
    QueryCompleted(QueryCompleted),
}

impl HandlerResult {
    pub fn task_token(&self) -> &[u8] {
        match self {
            Self::Completed(completed) => &completed.task_token,
            Self::Failed(failed) => &failed.task_token,
            Self::QueryCompleted(query) => &query.task_token,
        }
    }

    pub fn task_completed(&self) -> Option<&TaskCompleted> {
        match self {
            Self::Completed(completed) => Some(completed),
            _ => None,
        }
    }

    pub fn task_failed(&self) -> Option<&TaskFailed> {
        match self {
            Self::Failed(failed) => Some(failed),
            _ => None,
        }
    }

    pub fn query_completed(&self) -> Option<&QueryCompleted> {
        match self {
            Self::QueryCompleted(query) => Some(query),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessors_are_exclusive() {
        let result = HandlerResult::Failed(TaskFailed {
            task_token: b"t".to_vec(),
            cause: DecisionTaskFailedCause::ResetStickyTaskQueue,
            details: "missing".to_string(),
        });

        assert!(result.task_completed().is_none());
        assert!(result.query_completed().is_none());
        assert_eq!(
            result.task_failed().map(|f| f.cause),
            Some(DecisionTaskFailedCause::ResetStickyTaskQueue)
        );
        assert_eq!(result.task_token(), b"t");
    }
}
