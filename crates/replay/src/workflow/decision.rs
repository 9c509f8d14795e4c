//! Decisions sent back to the orchestration service

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::WorkflowError;
use crate::history::EventAttributes;
use crate::reliability::{duration_millis, option_duration_millis, RetryPolicy};

/// Commands a workflow issues in response to a decision task
///
/// Order matters: the service records them in the order they are returned,
/// and replay matches the recorded command events against them in the same
/// order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Decision {
    /// Schedule an activity for execution
    ScheduleActivityTask {
        /// Unique identifier for this activity within the workflow
        activity_id: String,

        /// Type of activity to execute
        activity_type: String,

        /// Input data for the activity (JSON)
        input: Value,

        /// Execution options (retries, timeouts, etc.)
        options: ActivityOptions,
    },

    /// Request cancellation of a scheduled activity
    RequestCancelActivityTask { activity_id: String },

    /// Start a timer that fires after the specified duration
    StartTimer {
        timer_id: String,

        #[serde(with = "duration_millis")]
        duration: Duration,
    },

    CancelTimer { timer_id: String },

    /// Record a side effect or local activity result in history
    RecordMarker {
        marker_name: String,
        marker_id: String,
        details: Value,
    },

    /// Complete the workflow successfully with a result
    CompleteWorkflowExecution { result: Value },

    /// Fail the workflow with an error
    FailWorkflowExecution { error: WorkflowError },

    /// Acknowledge a cancellation request
    CancelWorkflowExecution { details: Option<Value> },
}

impl Decision {
    /// Short name of the decision kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ScheduleActivityTask { .. } => "schedule_activity_task",
            Self::RequestCancelActivityTask { .. } => "request_cancel_activity_task",
            Self::StartTimer { .. } => "start_timer",
            Self::CancelTimer { .. } => "cancel_timer",
            Self::RecordMarker { .. } => "record_marker",
            Self::CompleteWorkflowExecution { .. } => "complete_workflow_execution",
            Self::FailWorkflowExecution { .. } => "fail_workflow_execution",
            Self::CancelWorkflowExecution { .. } => "cancel_workflow_execution",
        }
    }

    /// Whether this decision closes the workflow
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::CompleteWorkflowExecution { .. }
                | Self::FailWorkflowExecution { .. }
                | Self::CancelWorkflowExecution { .. }
        )
    }

    /// Check whether a recorded command event echoes this decision
    ///
    /// Identity is compared (ids, types, names), not payloads.
    pub fn matches_event(&self, event: &EventAttributes) -> bool {
        match (self, event) {
            (
                Self::ScheduleActivityTask {
                    activity_id,
                    activity_type,
                    ..
                },
                EventAttributes::ActivityTaskScheduled {
                    activity_id: recorded_id,
                    activity_type: recorded_type,
                    ..
                },
            ) => activity_id == recorded_id && activity_type == recorded_type,
            (
                Self::RequestCancelActivityTask { activity_id },
                EventAttributes::ActivityTaskCancelRequested {
                    activity_id: recorded_id,
                },
            ) => activity_id == recorded_id,
            (
                Self::StartTimer { timer_id, .. },
                EventAttributes::TimerStarted {
                    timer_id: recorded_id,
                    ..
                },
            ) => timer_id == recorded_id,
            (
                Self::CancelTimer { timer_id },
                EventAttributes::TimerCanceled {
                    timer_id: recorded_id,
                },
            ) => timer_id == recorded_id,
            (
                Self::RecordMarker {
                    marker_name,
                    marker_id,
                    ..
                },
                EventAttributes::MarkerRecorded {
                    marker_name: recorded_name,
                    marker_id: recorded_id,
                    ..
                },
            ) => marker_name == recorded_name && marker_id == recorded_id,
            (
                Self::CompleteWorkflowExecution { .. },
                EventAttributes::WorkflowExecutionCompleted { .. },
            )
            | (Self::FailWorkflowExecution { .. }, EventAttributes::WorkflowExecutionFailed { .. })
            | (
                Self::CancelWorkflowExecution { .. },
                EventAttributes::WorkflowExecutionCanceled { .. },
            ) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ScheduleActivityTask {
                activity_id,
                activity_type,
                ..
            } => write!(f, "{}({}, {})", self.kind(), activity_id, activity_type),
            Self::RequestCancelActivityTask { activity_id } => {
                write!(f, "{}({})", self.kind(), activity_id)
            }
            Self::StartTimer { timer_id, .. } | Self::CancelTimer { timer_id } => {
                write!(f, "{}({})", self.kind(), timer_id)
            }
            Self::RecordMarker {
                marker_name,
                marker_id,
                ..
            } => write!(f, "{}({}, {})", self.kind(), marker_name, marker_id),
            _ => f.write_str(self.kind()),
        }
    }
}

/// Options for remote activity execution
///
/// Carried verbatim on `ScheduleActivityTask`; timeouts and retries are
/// enforced by the service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityOptions {
    /// Task queue to dispatch the activity on; the workflow's queue when unset
    pub task_queue: Option<String>,

    /// Maximum time to wait for activity to be claimed by a worker
    #[serde(with = "duration_millis")]
    pub schedule_to_start_timeout: Duration,

    /// Maximum time for activity execution (from start to completion)
    #[serde(with = "duration_millis")]
    pub start_to_close_timeout: Duration,

    /// If set, activity workers must heartbeat within this interval
    #[serde(with = "option_duration_millis")]
    pub heartbeat_timeout: Option<Duration>,

    pub retry_policy: Option<RetryPolicy>,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            task_queue: None,
            schedule_to_start_timeout: Duration::from_secs(60),
            start_to_close_timeout: Duration::from_secs(300),
            heartbeat_timeout: None,
            retry_policy: None,
        }
    }
}

impl ActivityOptions {
    pub fn with_task_queue(mut self, task_queue: impl Into<String>) -> Self {
        self.task_queue = Some(task_queue.into());
        self
    }

    /// Create options with a specific retry policy
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_schedule_to_start_timeout(mut self, timeout: Duration) -> Self {
        self.schedule_to_start_timeout = timeout;
        self
    }

    pub fn with_start_to_close_timeout(mut self, timeout: Duration) -> Self {
        self.start_to_close_timeout = timeout;
        self
    }

    /// Enable heartbeating with the specified timeout
    pub fn with_heartbeat(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = Some(timeout);
        self
    }
}
