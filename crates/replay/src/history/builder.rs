//! Fluent construction of workflow histories
//!
//! Used by tests and tools to assemble histories the way the service would
//! record them: contiguous event ids starting at 1 and monotonically
//! increasing timestamps.

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use serde_json::Value;
use std::time::Duration;

use super::{EventAttributes, HistoryEvent, TimeoutType};
use crate::activity::ActivityError;
use crate::workflow::WorkflowError;

/// Builder for workflow histories
///
/// # Example
///
/// ```
/// use durable_replay::history::HistoryBuilder;
/// use serde_json::json;
///
/// let mut history = HistoryBuilder::new("greeting");
/// history
///     .workflow_started(json!("world"))
///     .decision_task()
///     .decision_completed()
///     .activity_scheduled("activity-1", "compose_greeting", json!("world"))
///     .activity_completed("activity-1", json!("Hello, world!"))
///     .decision_task();
///
/// let events = history.build();
/// assert_eq!(events.len(), 8);
/// assert_eq!(events[0].event_id, 1);
/// ```
#[derive(Debug, Clone)]
pub struct HistoryBuilder {
    workflow_type: String,
    task_queue: String,
    identity: String,
    clock: DateTime<Utc>,
    tick: ChronoDuration,
    events: Vec<HistoryEvent>,
}

impl HistoryBuilder {
    /// Create a builder for a workflow of the given type
    pub fn new(workflow_type: impl Into<String>) -> Self {
        Self {
            workflow_type: workflow_type.into(),
            task_queue: "default".to_string(),
            identity: "test-worker".to_string(),
            clock: Utc
                .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
                .single()
                .unwrap_or_else(Utc::now),
            tick: ChronoDuration::seconds(1),
            events: Vec::new(),
        }
    }

    /// Set the task queue recorded on start and decision events
    pub fn with_task_queue(mut self, task_queue: impl Into<String>) -> Self {
        self.task_queue = task_queue.into();
        self
    }

    /// Set the time of the first event
    pub fn with_start_time(mut self, start: DateTime<Utc>) -> Self {
        self.clock = start;
        self
    }

    /// Move the clock forward without recording an event
    pub fn advance(&mut self, duration: Duration) -> &mut Self {
        self.clock += ChronoDuration::from_std(duration).unwrap_or(self.tick);
        self
    }

    /// Append an arbitrary event
    pub fn push(&mut self, attributes: EventAttributes) -> &mut Self {
        let event_id = self.events.len() as i64 + 1;
        self.events
            .push(HistoryEvent::new(event_id, self.clock, attributes));
        self.clock += self.tick;
        self
    }

    pub fn workflow_started(&mut self, input: Value) -> &mut Self {
        let attributes = EventAttributes::WorkflowExecutionStarted {
            workflow_type: self.workflow_type.clone(),
            task_queue: self.task_queue.clone(),
            input,
        };
        self.push(attributes)
    }

    /// Append a scheduled and started decision task pair
    pub fn decision_task(&mut self) -> &mut Self {
        let task_queue = self.task_queue.clone();
        let identity = self.identity.clone();
        self.push(EventAttributes::DecisionTaskScheduled { task_queue })
            .push(EventAttributes::DecisionTaskStarted { identity })
    }

    pub fn decision_completed(&mut self) -> &mut Self {
        self.push(EventAttributes::DecisionTaskCompleted)
    }

    pub fn decision_failed(&mut self, cause: impl Into<String>) -> &mut Self {
        self.push(EventAttributes::DecisionTaskFailed {
            cause: cause.into(),
        })
    }

    pub fn activity_scheduled(
        &mut self,
        activity_id: impl Into<String>,
        activity_type: impl Into<String>,
        input: Value,
    ) -> &mut Self {
        self.push(EventAttributes::ActivityTaskScheduled {
            activity_id: activity_id.into(),
            activity_type: activity_type.into(),
            input,
        })
    }

    /// Append started and completed events for an activity
    pub fn activity_completed(&mut self, activity_id: impl Into<String>, result: Value) -> &mut Self {
        let activity_id = activity_id.into();
        self.push(EventAttributes::ActivityTaskStarted {
            activity_id: activity_id.clone(),
            attempt: 1,
        })
        .push(EventAttributes::ActivityTaskCompleted {
            activity_id,
            result,
        })
    }

    /// Append started and failed events for an activity
    pub fn activity_failed(&mut self, activity_id: impl Into<String>, error: ActivityError) -> &mut Self {
        let activity_id = activity_id.into();
        self.push(EventAttributes::ActivityTaskStarted {
            activity_id: activity_id.clone(),
            attempt: 1,
        })
        .push(EventAttributes::ActivityTaskFailed { activity_id, error })
    }

    pub fn activity_timed_out(
        &mut self,
        activity_id: impl Into<String>,
        timeout_type: TimeoutType,
    ) -> &mut Self {
        self.push(EventAttributes::ActivityTaskTimedOut {
            activity_id: activity_id.into(),
            timeout_type,
        })
    }

    pub fn timer_started(&mut self, timer_id: impl Into<String>, duration: Duration) -> &mut Self {
        self.push(EventAttributes::TimerStarted {
            timer_id: timer_id.into(),
            duration_ms: duration.as_millis() as u64,
        })
    }

    /// Append a fired timer, advancing the clock by its recorded duration
    pub fn timer_fired(&mut self, timer_id: impl Into<String>) -> &mut Self {
        let timer_id = timer_id.into();
        let duration = self.events.iter().rev().find_map(|event| match &event.attributes {
            EventAttributes::TimerStarted {
                timer_id: started,
                duration_ms,
            } if *started == timer_id => Some(Duration::from_millis(*duration_ms)),
            _ => None,
        });
        if let Some(duration) = duration {
            self.advance(duration);
        }
        self.push(EventAttributes::TimerFired { timer_id })
    }

    pub fn timer_canceled(&mut self, timer_id: impl Into<String>) -> &mut Self {
        self.push(EventAttributes::TimerCanceled {
            timer_id: timer_id.into(),
        })
    }

    pub fn signal(&mut self, signal_name: impl Into<String>, input: Value) -> &mut Self {
        self.push(EventAttributes::WorkflowExecutionSignaled {
            signal_name: signal_name.into(),
            input,
        })
    }

    pub fn cancel_requested(&mut self) -> &mut Self {
        self.push(EventAttributes::WorkflowExecutionCancelRequested { cause: None })
    }

    pub fn marker(
        &mut self,
        marker_name: impl Into<String>,
        marker_id: impl Into<String>,
        details: Value,
    ) -> &mut Self {
        self.push(EventAttributes::MarkerRecorded {
            marker_name: marker_name.into(),
            marker_id: marker_id.into(),
            details,
        })
    }

    pub fn workflow_completed(&mut self, result: Value) -> &mut Self {
        self.push(EventAttributes::WorkflowExecutionCompleted { result })
    }

    pub fn workflow_failed(&mut self, error: WorkflowError) -> &mut Self {
        self.push(EventAttributes::WorkflowExecutionFailed { error })
    }

    /// Id of the most recently appended event, 0 when empty
    pub fn last_event_id(&self) -> i64 {
        self.events.len() as i64
    }

    /// All events recorded so far
    pub fn build(&self) -> Vec<HistoryEvent> {
        self.events.clone()
    }

    /// Events from `event_id` (inclusive) to the end
    ///
    /// This is the window a sticky worker receives on a cache hit.
    pub fn events_from(&self, event_id: i64) -> Vec<HistoryEvent> {
        self.events
            .iter()
            .filter(|event| event.event_id >= event_id)
            .cloned()
            .collect()
    }
}
