//! Workflow execution identity

use std::fmt;

use serde::{Deserialize, Serialize};

/// Workflow id and run id as reported by the orchestration service
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowExecution {
    /// Business identifier of the workflow
    pub workflow_id: String,

    /// Identifier of this particular run
    pub run_id: String,
}

impl WorkflowExecution {
    pub fn new(workflow_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            run_id: run_id.into(),
        }
    }
}

/// Uniquely identifies one running workflow instance
///
/// Used as the decider cache key. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowExecutionKey {
    domain: String,
    workflow_id: String,
    run_id: String,
}

impl WorkflowExecutionKey {
    pub fn new(domain: impl Into<String>, execution: &WorkflowExecution) -> Self {
        Self {
            domain: domain.into(),
            workflow_id: execution.workflow_id.clone(),
            run_id: execution.run_id.clone(),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}

impl fmt::Display for WorkflowExecutionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.domain, self.workflow_id, self.run_id)
    }
}
