//! Workflow trait definition

use std::future::Future;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use super::WorkflowContext;
use crate::activity::ActivityError;

/// Error type for workflow failures
///
/// Returning this from a workflow is a terminal outcome: the decider emits
/// `FailWorkflowExecution`, or `CancelWorkflowExecution` when the error was
/// built with [`WorkflowError::cancelled`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowError {
    /// Error message
    pub message: String,

    /// Error code for programmatic handling
    pub code: Option<String>,

    /// Additional error details
    pub details: Option<Value>,
}

impl WorkflowError {
    /// Code of errors that cancel rather than fail the workflow
    pub const CANCELED: &'static str = "CANCELED";

    /// Code used when the start input cannot be decoded
    pub const INVALID_INPUT: &'static str = "INVALID_INPUT";

    /// Create a new workflow error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            details: None,
        }
    }

    /// Create an error that ends the workflow as canceled
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(message).with_code(Self::CANCELED)
    }

    /// Set the error code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.code.as_deref() == Some(Self::CANCELED)
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for WorkflowError {}

impl From<ActivityError> for WorkflowError {
    fn from(error: ActivityError) -> Self {
        let mut converted = WorkflowError::new(error.message);
        converted.code = error.error_type;
        converted.details = error.details;
        converted
    }
}

impl From<serde_json::Error> for WorkflowError {
    fn from(error: serde_json::Error) -> Self {
        WorkflowError::new(error.to_string()).with_code(Self::INVALID_INPUT)
    }
}

/// A workflow is deterministic async code driven by history replay
///
/// The body runs inside the decider's cooperative scheduler. It must only
/// suspend on futures obtained from the [`WorkflowContext`] (activities,
/// timers, signals, joins and conditions) and must read time, randomness and
/// other non-deterministic inputs through the context.
///
/// # Determinism
///
/// Given the same sequence of events, a workflow must produce the same
/// sequence of decisions. This enables replay-based recovery on any worker.
///
/// # Example
///
/// ```
/// use durable_replay::prelude::*;
/// use serde_json::json;
///
/// struct GreetingWorkflow;
///
/// impl Workflow for GreetingWorkflow {
///     const TYPE: &'static str = "greeting";
///     type Input = String;
///     type Output = String;
///
///     async fn execute(ctx: WorkflowContext, name: String) -> Result<String, WorkflowError> {
///         let greeting = ctx
///             .schedule_activity("compose_greeting", json!(name), ActivityOptions::default())
///             .await?;
///         Ok(greeting.as_str().unwrap_or_default().to_string())
///     }
/// }
/// ```
pub trait Workflow: Send + Sync + 'static {
    /// Unique type identifier for this workflow
    ///
    /// This is used to look up the workflow in the registry during replay.
    const TYPE: &'static str;

    /// Input type for starting the workflow
    type Input: DeserializeOwned + Send + 'static;

    /// Output type when workflow completes successfully
    type Output: Serialize + Send + 'static;

    /// Run the workflow to completion
    fn execute(
        ctx: WorkflowContext,
        input: Self::Input,
    ) -> impl Future<Output = Result<Self::Output, WorkflowError>> + Send + 'static;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_error_display() {
        let error = WorkflowError::new("something went wrong");
        assert_eq!(error.to_string(), "something went wrong");
    }

    #[test]
    fn test_workflow_error_with_code() {
        let error = WorkflowError::new("not found").with_code("NOT_FOUND");
        assert_eq!(error.code, Some("NOT_FOUND".to_string()));
        assert!(!error.is_cancelled());
    }

    #[test]
    fn test_cancelled_error() {
        assert!(WorkflowError::cancelled("stop requested").is_cancelled());
    }

    #[test]
    fn test_from_activity_error() {
        let error: WorkflowError = ActivityError::non_retryable("card declined")
            .with_type("DECLINED")
            .into();
        assert_eq!(error.message, "card declined");
        assert_eq!(error.code.as_deref(), Some("DECLINED"));
    }
}
