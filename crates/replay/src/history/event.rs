//! Workflow history events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::activity::ActivityError;
use crate::workflow::WorkflowError;

/// Types of activity timeouts reported by the service
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutType {
    /// Activity was not picked up within schedule_to_start_timeout
    ScheduleToStart,

    /// Activity did not complete within start_to_close_timeout
    StartToClose,

    /// Overall schedule_to_close_timeout elapsed
    ScheduleToClose,

    /// Worker did not send heartbeat within heartbeat_timeout
    Heartbeat,
}

/// One entry in a workflow's append-only history
///
/// Event ids are 1-based and contiguous within a run. The timestamp is
/// assigned by the service and is the only clock workflow code may observe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEvent {
    /// Position in the history, starting at 1
    pub event_id: i64,

    /// Time the service recorded the event
    pub timestamp: DateTime<Utc>,

    /// Event payload
    pub attributes: EventAttributes,
}

impl HistoryEvent {
    pub fn new(event_id: i64, timestamp: DateTime<Utc>, attributes: EventAttributes) -> Self {
        Self {
            event_id,
            timestamp,
            attributes,
        }
    }

    /// Short name of the event kind, for logs and error messages
    pub fn kind(&self) -> &'static str {
        self.attributes.kind()
    }
}

/// Event payloads
///
/// Command events echo a decision the workflow produced earlier and are
/// matched against it during replay. Outcome events resolve work the
/// workflow is waiting on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventAttributes {
    // =========================================================================
    // Workflow Lifecycle Events
    // =========================================================================
    /// Workflow was started with the given input
    WorkflowExecutionStarted {
        workflow_type: String,
        task_queue: String,
        input: Value,
    },

    /// External signal was delivered to the workflow
    WorkflowExecutionSignaled { signal_name: String, input: Value },

    /// Cancellation of the workflow was requested
    WorkflowExecutionCancelRequested { cause: Option<String> },

    /// Workflow completed successfully
    WorkflowExecutionCompleted { result: Value },

    /// Workflow failed with an error
    WorkflowExecutionFailed { error: WorkflowError },

    /// Workflow accepted a cancellation request
    WorkflowExecutionCanceled { details: Option<Value> },

    // =========================================================================
    // Decision Task Events
    // =========================================================================
    DecisionTaskScheduled { task_queue: String },

    /// A worker picked up the decision task
    DecisionTaskStarted { identity: String },

    DecisionTaskCompleted,

    /// The worker reported the decision task as failed
    DecisionTaskFailed { cause: String },

    DecisionTaskTimedOut,

    // =========================================================================
    // Activity Events
    // =========================================================================
    /// Activity was scheduled for execution
    ActivityTaskScheduled {
        activity_id: String,
        activity_type: String,
        input: Value,
    },

    /// Activity was claimed by an activity worker
    ActivityTaskStarted { activity_id: String, attempt: u32 },

    ActivityTaskCompleted { activity_id: String, result: Value },

    /// Activity failed after the service gave up retrying
    ActivityTaskFailed {
        activity_id: String,
        error: ActivityError,
    },

    ActivityTaskTimedOut {
        activity_id: String,
        timeout_type: TimeoutType,
    },

    /// Workflow requested cancellation of the activity
    ActivityTaskCancelRequested { activity_id: String },

    ActivityTaskCanceled { activity_id: String },

    // =========================================================================
    // Timer Events
    // =========================================================================
    TimerStarted { timer_id: String, duration_ms: u64 },

    TimerFired { timer_id: String },

    TimerCanceled { timer_id: String },

    // =========================================================================
    // Marker Events
    // =========================================================================
    /// Recorded side effect or local activity result
    MarkerRecorded {
        marker_name: String,
        marker_id: String,
        details: Value,
    },
}

impl EventAttributes {
    /// Short name of the event kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::WorkflowExecutionStarted { .. } => "workflow_execution_started",
            Self::WorkflowExecutionSignaled { .. } => "workflow_execution_signaled",
            Self::WorkflowExecutionCancelRequested { .. } => "workflow_execution_cancel_requested",
            Self::WorkflowExecutionCompleted { .. } => "workflow_execution_completed",
            Self::WorkflowExecutionFailed { .. } => "workflow_execution_failed",
            Self::WorkflowExecutionCanceled { .. } => "workflow_execution_canceled",
            Self::DecisionTaskScheduled { .. } => "decision_task_scheduled",
            Self::DecisionTaskStarted { .. } => "decision_task_started",
            Self::DecisionTaskCompleted => "decision_task_completed",
            Self::DecisionTaskFailed { .. } => "decision_task_failed",
            Self::DecisionTaskTimedOut => "decision_task_timed_out",
            Self::ActivityTaskScheduled { .. } => "activity_task_scheduled",
            Self::ActivityTaskStarted { .. } => "activity_task_started",
            Self::ActivityTaskCompleted { .. } => "activity_task_completed",
            Self::ActivityTaskFailed { .. } => "activity_task_failed",
            Self::ActivityTaskTimedOut { .. } => "activity_task_timed_out",
            Self::ActivityTaskCancelRequested { .. } => "activity_task_cancel_requested",
            Self::ActivityTaskCanceled { .. } => "activity_task_canceled",
            Self::TimerStarted { .. } => "timer_started",
            Self::TimerFired { .. } => "timer_fired",
            Self::TimerCanceled { .. } => "timer_canceled",
            Self::MarkerRecorded { .. } => "marker_recorded",
        }
    }

    /// Whether this event echoes a decision made by the workflow
    pub fn is_command(&self) -> bool {
        matches!(
            self,
            Self::ActivityTaskScheduled { .. }
                | Self::ActivityTaskCancelRequested { .. }
                | Self::TimerStarted { .. }
                | Self::TimerCanceled { .. }
                | Self::MarkerRecorded { .. }
                | Self::WorkflowExecutionCompleted { .. }
                | Self::WorkflowExecutionFailed { .. }
                | Self::WorkflowExecutionCanceled { .. }
        )
    }

    /// Check if this is a terminal workflow event
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::WorkflowExecutionCompleted { .. }
                | Self::WorkflowExecutionFailed { .. }
                | Self::WorkflowExecutionCanceled { .. }
        )
    }

    /// Get the activity_id if this is an activity-related event
    pub fn activity_id(&self) -> Option<&str> {
        match self {
            Self::ActivityTaskScheduled { activity_id, .. }
            | Self::ActivityTaskStarted { activity_id, .. }
            | Self::ActivityTaskCompleted { activity_id, .. }
            | Self::ActivityTaskFailed { activity_id, .. }
            | Self::ActivityTaskTimedOut { activity_id, .. }
            | Self::ActivityTaskCancelRequested { activity_id }
            | Self::ActivityTaskCanceled { activity_id } => Some(activity_id),
            _ => None,
        }
    }
}
