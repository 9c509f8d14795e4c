//! Decision tasks delivered by the orchestration service

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{HistoryEvent, WorkflowExecution};
use crate::reliability::duration_millis;

/// Routing instructions that keep an execution on one worker
///
/// Returned with a completed decision task so the service sends the next
/// task for the execution to the worker's sticky queue, with only the new
/// events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StickyExecutionAttributes {
    /// Worker-specific task queue
    pub worker_task_queue: String,

    /// How long the service waits on the sticky queue before falling back
    #[serde(with = "duration_millis")]
    pub schedule_to_start_timeout: Duration,
}

impl StickyExecutionAttributes {
    pub fn new(worker_task_queue: impl Into<String>, schedule_to_start_timeout: Duration) -> Self {
        Self {
            worker_task_queue: worker_task_queue.into(),
            schedule_to_start_timeout,
        }
    }

    /// Timeout as reported on the wire, in whole seconds
    pub fn schedule_to_start_timeout_seconds(&self) -> u64 {
        self.schedule_to_start_timeout.as_secs()
    }
}

/// Read-only query against workflow state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowQuery {
    pub query_type: String,
    pub args: Value,
}

/// A unit of work asking the worker to decide what a workflow does next
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTask {
    /// Opaque token echoed back in the response
    pub task_token: Vec<u8>,

    pub workflow_execution: WorkflowExecution,

    pub workflow_type: String,

    /// Full history on a cache miss, only the new events on a cache hit
    pub history: Vec<HistoryEvent>,

    /// Sticky attributes the service has on record for the execution
    #[serde(default)]
    pub sticky_attributes: Option<StickyExecutionAttributes>,

    /// Set for legacy query tasks
    #[serde(default)]
    pub query: Option<WorkflowQuery>,
}

impl DecisionTask {
    /// Whether the window starts at the beginning of the history
    pub fn is_full_history(&self) -> bool {
        self.history.first().is_some_and(|event| event.event_id == 1)
    }

    pub fn is_query(&self) -> bool {
        self.query.is_some()
    }

    /// Id of the first event in the window
    pub fn first_event_id(&self) -> Option<i64> {
        self.history.first().map(|event| event.event_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::HistoryBuilder;

    #[test]
    fn test_sticky_timeout_in_seconds() {
        let attrs = StickyExecutionAttributes::new("sticky", Duration::from_millis(5_900));
        assert_eq!(attrs.schedule_to_start_timeout_seconds(), 5);
    }

    #[test]
    fn test_full_history_detection() {
        let mut builder = HistoryBuilder::new("greeting");
        builder.workflow_started(serde_json::json!("world")).decision_task();
        let events = builder.build();

        let task = DecisionTask {
            task_token: b"token".to_vec(),
            workflow_execution: WorkflowExecution::new("wf", "run"),
            workflow_type: "greeting".to_string(),
            history: events.clone(),
            sticky_attributes: None,
            query: None,
        };
        assert!(task.is_full_history());

        let partial = DecisionTask {
            history: events[1..].to_vec(),
            ..task
        };
        assert!(!partial.is_full_history());
        assert_eq!(partial.first_event_id(), Some(2));
    }
}
