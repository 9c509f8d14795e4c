//! Replay decider: applies history to a workflow and collects decisions

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, instrument, trace};

use super::registry::{RegistryError, ReplayWorkflowFactory, WorkflowFuture};
use super::scheduler::{DeterministicRunner, SelfEviction, ThreadBudget, ThreadState};
use super::state::{ExecutionState, SharedState, WorkflowOutcome};
use super::ReplayError;
use crate::activity::{ActivityError, LocalActivityRegistry};
use crate::history::{EventAttributes, HistoryEvent, WorkflowExecutionKey};
use crate::workflow::{Decision, WorkflowContext, WorkflowError};

/// Name of the root logical thread
pub const ROOT_THREAD: &str = "workflow-root";

/// Error code returned for queries nobody registered
pub const UNKNOWN_QUERY: &str = "UNKNOWN_QUERY";

/// Live replay state of one workflow execution
///
/// A decider is fed consecutive windows of history. It matches recorded
/// command events against the decisions the workflow produced, resolves
/// outcome events into the futures awaiting them, and runs the workflow's
/// logical threads at every `DecisionTaskStarted` until they block again.
/// Decisions still pending after the last window are the response to the
/// current decision task.
pub struct ReplayDecider {
    key: WorkflowExecutionKey,
    workflow_type: String,
    state: SharedState,
    runner: DeterministicRunner,
    root: Option<WorkflowFuture>,
    next_event_id: i64,
    awaiting_echo: bool,
    decision_tasks: u64,
}

impl ReplayDecider {
    /// Build a decider from the first event of a full history
    pub fn new(
        key: WorkflowExecutionKey,
        start_event: &HistoryEvent,
        factory: &dyn ReplayWorkflowFactory,
        budget: ThreadBudget,
        local_activities: Arc<LocalActivityRegistry>,
    ) -> Result<Self, RegistryError> {
        let (workflow_type, input) = match &start_event.attributes {
            EventAttributes::WorkflowExecutionStarted {
                workflow_type,
                input,
                ..
            } if start_event.event_id == 1 => (workflow_type.clone(), input.clone()),
            other => {
                return Err(RegistryError::MissingStartEvent {
                    found: other.kind().to_string(),
                })
            }
        };

        let workflow = factory.get_workflow(&workflow_type)?;
        let state = ExecutionState::new(key.clone(), workflow_type.clone(), local_activities).shared();
        let root = workflow.start(WorkflowContext::new(state.clone()), input)?;
        let runner = DeterministicRunner::new(key.clone(), state.clone(), budget);

        debug!(
            workflow_id = %key.workflow_id(),
            run_id = %key.run_id(),
            workflow_type = %workflow_type,
            "created replay decider"
        );

        Ok(Self {
            key,
            workflow_type,
            state,
            runner,
            root: Some(root),
            next_event_id: 1,
            awaiting_echo: false,
            decision_tasks: 0,
        })
    }

    pub fn key(&self) -> &WorkflowExecutionKey {
        &self.key
    }

    pub fn workflow_type(&self) -> &str {
        &self.workflow_type
    }

    /// Id of the next event this decider expects
    pub fn next_event_id(&self) -> i64 {
        self.next_event_id
    }

    /// Number of decision tasks whose event loop has run
    pub fn decision_tasks_processed(&self) -> u64 {
        self.decision_tasks
    }

    /// Apply a window of history and return the decisions to send
    ///
    /// The window must start exactly at [`next_event_id`](Self::next_event_id)
    /// and be contiguous. It is validated before anything is applied.
    #[instrument(
        skip_all,
        fields(
            workflow_id = %self.key.workflow_id(),
            run_id = %self.key.run_id(),
            next_event_id = self.next_event_id,
            events = events.len()
        )
    )]
    pub fn handle_window(
        &mut self,
        events: &[HistoryEvent],
        eviction: &dyn SelfEviction,
    ) -> Result<Vec<Decision>, ReplayError> {
        if self.runner.is_closed() {
            return Err(ReplayError::Closed);
        }
        if events.is_empty() {
            return Err(ReplayError::EmptyHistory);
        }
        for (offset, event) in events.iter().enumerate() {
            let expected = self.next_event_id + offset as i64;
            if event.event_id != expected {
                return Err(ReplayError::HistoryGap {
                    expected,
                    actual: event.event_id,
                });
            }
        }

        let live_started = live_decision_task(events);

        for (index, event) in events.iter().enumerate() {
            self.apply(events, index, live_started, eviction)?;
            self.next_event_id = event.event_id + 1;
        }

        let decisions: Vec<Decision> = self.state.lock().decisions.iter().cloned().collect();
        debug!(
            decisions = decisions.len(),
            terminal = self.is_terminal(),
            "history window applied"
        );
        Ok(decisions)
    }

    fn apply(
        &mut self,
        events: &[HistoryEvent],
        index: usize,
        live_started: Option<usize>,
        eviction: &dyn SelfEviction,
    ) -> Result<(), ReplayError> {
        let event = &events[index];
        trace!(event_id = event.event_id, kind = event.kind(), "applying event");

        if self.awaiting_echo && !event.attributes.is_command() {
            self.awaiting_echo = false;
            if let Some(missing) = self.state.lock().decisions.front() {
                return Err(ReplayError::NonDeterministic(format!(
                    "decision {} was not recorded; history has {} at event {}",
                    missing,
                    event.kind(),
                    event.event_id
                )));
            }
        }

        if event.attributes.is_command() {
            return self.match_command(event);
        }

        match &event.attributes {
            EventAttributes::WorkflowExecutionStarted { .. } => {
                let Some(root) = self.root.take() else {
                    return Err(ReplayError::NonDeterministic(format!(
                        "duplicate workflow start at event {}",
                        event.event_id
                    )));
                };
                self.state.lock().now = event.timestamp;
                let state = self.state.clone();
                let thread = async move {
                    let result = root.await;
                    state.lock().finish(result);
                };
                self.runner.spawn(ROOT_THREAD, Box::pin(thread), eviction)?;
            }
            EventAttributes::DecisionTaskStarted { .. } => {
                let live = Some(index) == live_started;
                {
                    let mut state = self.state.lock();
                    state.now = event.timestamp;
                    state.replaying = !live;
                    state.markers = if live {
                        HashMap::new()
                    } else {
                        recorded_markers(&events[index + 1..])
                    };
                }
                self.runner.run_until_blocked(eviction)?;
                self.decision_tasks += 1;
            }
            EventAttributes::DecisionTaskCompleted => {
                self.awaiting_echo = true;
            }
            EventAttributes::DecisionTaskScheduled { .. }
            | EventAttributes::DecisionTaskFailed { .. }
            | EventAttributes::DecisionTaskTimedOut
            | EventAttributes::ActivityTaskStarted { .. } => {}
            EventAttributes::ActivityTaskCompleted {
                activity_id,
                result,
            } => self.resolve_activity(event, activity_id, Ok(result.clone()))?,
            EventAttributes::ActivityTaskFailed { activity_id, error } => {
                self.resolve_activity(event, activity_id, Err(error.clone()))?
            }
            EventAttributes::ActivityTaskTimedOut {
                activity_id,
                timeout_type,
            } => self.resolve_activity(
                event,
                activity_id,
                Err(ActivityError::timeout(format!(
                    "activity {} timed out ({:?})",
                    activity_id, timeout_type
                ))),
            )?,
            EventAttributes::ActivityTaskCanceled { activity_id } => self.resolve_activity(
                event,
                activity_id,
                Err(ActivityError::non_retryable("activity canceled").with_type(WorkflowError::CANCELED)),
            )?,
            EventAttributes::TimerFired { timer_id } => {
                if !self.state.lock().resolve_timer(timer_id, Ok(())) {
                    debug!(timer_id = %timer_id, "ignoring fired event for inactive timer");
                }
            }
            EventAttributes::WorkflowExecutionSignaled { signal_name, input } => {
                self.state.lock().deliver_signal(signal_name, input.clone());
            }
            EventAttributes::WorkflowExecutionCancelRequested { .. } => {
                self.state.lock().request_cancel();
            }
            // Command events are matched above.
            _ => {}
        }
        Ok(())
    }

    fn match_command(&mut self, event: &HistoryEvent) -> Result<(), ReplayError> {
        let mut state = self.state.lock();
        match state.decisions.front() {
            Some(decision) if decision.matches_event(&event.attributes) => {
                state.decisions.pop_front();
                Ok(())
            }
            Some(decision) => Err(ReplayError::NonDeterministic(format!(
                "history has {} at event {} but workflow produced {}",
                event.kind(),
                event.event_id,
                decision
            ))),
            None => Err(ReplayError::NonDeterministic(format!(
                "history has {} at event {} but workflow produced no decision",
                event.kind(),
                event.event_id
            ))),
        }
    }

    fn resolve_activity(
        &mut self,
        event: &HistoryEvent,
        activity_id: &str,
        result: Result<Value, ActivityError>,
    ) -> Result<(), ReplayError> {
        if !self.state.lock().resolve_activity(activity_id, result) {
            return Err(ReplayError::NonDeterministic(format!(
                "{} at event {} for unknown activity {}",
                event.kind(),
                event.event_id,
                activity_id
            )));
        }
        Ok(())
    }

    /// Answer a query from the handlers the workflow registered
    pub fn query(&self, query_type: &str, args: Value) -> Result<Value, WorkflowError> {
        let handler = self.state.lock().queries.get(query_type).cloned();
        match handler {
            Some(handler) => handler(args),
            None => Err(WorkflowError::new(format!("unknown query type: {}", query_type))
                .with_code(UNKNOWN_QUERY)),
        }
    }

    /// Whether the workflow function has returned
    pub fn is_terminal(&self) -> bool {
        self.state.lock().outcome.is_some()
    }

    pub fn outcome(&self) -> Option<WorkflowOutcome> {
        self.state.lock().outcome.clone()
    }

    /// Decisions emitted but not yet recorded in history
    pub fn pending_decisions(&self) -> usize {
        self.state.lock().decisions.len()
    }

    pub fn thread_states(&self) -> Vec<(String, ThreadState)> {
        self.runner.thread_states()
    }

    /// Logical threads still holding a budget permit
    pub fn live_threads(&self) -> usize {
        self.runner.live_threads()
    }

    /// Drop all logical threads and release their permits
    pub fn close(&mut self) {
        if self.runner.is_closed() {
            return;
        }
        self.runner.close();
        self.root = None;
        debug!(workflow_id = %self.key.workflow_id(), run_id = %self.key.run_id(), "closed replay decider");
    }

    pub fn is_closed(&self) -> bool {
        self.runner.is_closed()
    }
}

impl std::fmt::Debug for ReplayDecider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayDecider")
            .field("key", &self.key)
            .field("workflow_type", &self.workflow_type)
            .field("next_event_id", &self.next_event_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Index of the `DecisionTaskStarted` whose decisions are not recorded yet
///
/// Only the last start can be live, and only if no completion, failure or
/// timeout of that decision task follows it in the window. Query tasks carry
/// histories that end after the last decision task completed.
fn live_decision_task(events: &[HistoryEvent]) -> Option<usize> {
    let last_started = events
        .iter()
        .rposition(|e| matches!(e.attributes, EventAttributes::DecisionTaskStarted { .. }))?;
    let closed = events[last_started + 1..].iter().any(|e| {
        matches!(
            e.attributes,
            EventAttributes::DecisionTaskCompleted
                | EventAttributes::DecisionTaskFailed { .. }
                | EventAttributes::DecisionTaskTimedOut
        )
    });
    (!closed).then_some(last_started)
}

/// Markers recorded for one decision task: everything up to the next start
fn recorded_markers(events: &[HistoryEvent]) -> HashMap<String, Value> {
    events
        .iter()
        .take_while(|e| !matches!(e.attributes, EventAttributes::DecisionTaskStarted { .. }))
        .filter_map(|e| match &e.attributes {
            EventAttributes::MarkerRecorded {
                marker_id, details, ..
            } => Some((marker_id.clone(), details.clone())),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{HistoryBuilder, WorkflowExecution};
    use crate::replay::{NoEviction, WorkflowRegistry};
    use crate::workflow::ActivityOptions;
    use serde_json::json;
    use std::time::Duration;

    async fn greeting(ctx: WorkflowContext, input: Value) -> Result<Value, WorkflowError> {
        let greeting = ctx
            .schedule_activity("compose", input, ActivityOptions::default())
            .await?;
        ctx.sleep(Duration::from_secs(5)).await?;
        Ok(greeting)
    }

    async fn clock(ctx: WorkflowContext, _input: Value) -> Result<Value, WorkflowError> {
        let first = ctx.now();
        ctx.sleep(Duration::from_secs(60)).await?;
        Ok(json!([first.timestamp(), ctx.now().timestamp()]))
    }

    async fn recorded(ctx: WorkflowContext, _input: Value) -> Result<Value, WorkflowError> {
        let value: u64 = ctx.side_effect(|| 99)?;
        ctx.register_query("value", move |_| Ok(json!(value)));
        ctx.sleep(Duration::from_secs(60)).await?;
        Ok(json!(value))
    }

    async fn panics(_ctx: WorkflowContext, _input: Value) -> Result<Value, WorkflowError> {
        panic!("workflow bug")
    }

    fn registry() -> WorkflowRegistry {
        let mut registry = WorkflowRegistry::new();
        registry.register_fn("greeting", greeting);
        registry.register_fn("clock", clock);
        registry.register_fn("panics", panics);
        registry.register_fn("recorded", recorded);
        registry
    }

    fn decider(history: &[HistoryEvent]) -> ReplayDecider {
        let key = WorkflowExecutionKey::new("domain", &WorkflowExecution::new("wf-1", "run-1"));
        ReplayDecider::new(
            key,
            &history[0],
            &registry(),
            ThreadBudget::new(16),
            Arc::new(LocalActivityRegistry::new()),
        )
        .unwrap()
    }

    fn greeting_history() -> HistoryBuilder {
        let mut builder = HistoryBuilder::new("greeting");
        builder.workflow_started(json!("world")).decision_task();
        builder
    }

    #[test]
    fn test_first_decision_task() {
        let history = greeting_history().build();
        let mut decider = decider(&history);

        let decisions = decider.handle_window(&history, &NoEviction).unwrap();
        assert_eq!(decisions.len(), 1);
        assert!(matches!(
            &decisions[0],
            Decision::ScheduleActivityTask { activity_id, activity_type, .. }
                if activity_id == "activity-1" && activity_type == "compose"
        ));
        assert_eq!(decider.next_event_id(), 4);
        assert!(!decider.is_terminal());
    }

    #[test]
    fn test_incremental_windows_match_full_replay() {
        let mut builder = greeting_history();
        let first_window = builder.build();

        let mut sticky = decider(&first_window);
        sticky.handle_window(&first_window, &NoEviction).unwrap();

        builder
            .decision_completed()
            .activity_scheduled("activity-1", "compose", json!("world"))
            .activity_completed("activity-1", json!("Hello, world!"))
            .decision_task();
        let tail = builder.events_from(4);
        let incremental = sticky.handle_window(&tail, &NoEviction).unwrap();

        let full = builder.build();
        let mut fresh = decider(&full);
        let replayed = fresh.handle_window(&full, &NoEviction).unwrap();

        assert_eq!(incremental, replayed);
        assert!(matches!(&replayed[0], Decision::StartTimer { timer_id, .. } if timer_id == "timer-1"));
    }

    #[test]
    fn test_completion_after_timer() {
        let mut builder = greeting_history();
        builder
            .decision_completed()
            .activity_scheduled("activity-1", "compose", json!("world"))
            .activity_completed("activity-1", json!("Hello"))
            .decision_task()
            .decision_completed()
            .timer_started("timer-1", Duration::from_secs(5))
            .timer_fired("timer-1")
            .decision_task();
        let history = builder.build();

        let mut decider = decider(&history);
        let decisions = decider.handle_window(&history, &NoEviction).unwrap();

        assert_eq!(
            decisions,
            vec![Decision::CompleteWorkflowExecution {
                result: json!("Hello")
            }]
        );
        assert!(decider.is_terminal());
        assert_eq!(decider.outcome(), Some(WorkflowOutcome::Completed(json!("Hello"))));
    }

    #[test]
    fn test_completed_decision_task_replays_recorded_markers() {
        let mut builder = HistoryBuilder::new("recorded");
        builder
            .workflow_started(json!(null))
            .decision_task()
            .decision_completed()
            .marker(crate::workflow::SIDE_EFFECT_MARKER, "side_effect-1", json!(41))
            .timer_started("timer-1", Duration::from_secs(60));
        let history = builder.build();

        let mut decider = decider(&history);
        let decisions = decider.handle_window(&history, &NoEviction).unwrap();

        assert!(decisions.is_empty());
        assert_eq!(decider.query("value", Value::Null), Ok(json!(41)));
    }

    #[test]
    fn test_live_decision_task_detection() {
        let mut completed = greeting_history();
        assert_eq!(live_decision_task(&completed.build()), Some(2));
        completed.decision_completed();
        assert_eq!(live_decision_task(&completed.build()), None);

        let mut retried = greeting_history();
        retried.decision_failed("UnhandledFailure");
        assert_eq!(live_decision_task(&retried.build()), None);
        retried.decision_task();
        assert_eq!(live_decision_task(&retried.build()), Some(5));
    }

    #[test]
    fn test_history_gap_is_rejected() {
        let mut builder = greeting_history();
        let first = builder.build();
        let mut decider = decider(&first);
        decider.handle_window(&first, &NoEviction).unwrap();

        builder.decision_completed().activity_scheduled("activity-1", "compose", json!("world"));
        let result = decider.handle_window(&builder.events_from(5), &NoEviction);
        assert!(matches!(
            result,
            Err(ReplayError::HistoryGap {
                expected: 4,
                actual: 5
            })
        ));
        assert_eq!(decider.next_event_id(), 4);
    }

    #[test]
    fn test_mismatched_command_is_non_deterministic() {
        let mut builder = greeting_history();
        builder
            .decision_completed()
            .timer_started("timer-1", Duration::from_secs(1))
            .decision_task();
        let history = builder.build();

        let mut decider = decider(&history);
        let result = decider.handle_window(&history, &NoEviction);
        assert!(matches!(result, Err(ReplayError::NonDeterministic(_))));
    }

    #[test]
    fn test_missing_echo_is_non_deterministic() {
        let mut builder = greeting_history();
        builder.decision_completed().decision_task();
        let history = builder.build();

        let mut decider = decider(&history);
        let result = decider.handle_window(&history, &NoEviction);
        assert!(matches!(result, Err(ReplayError::NonDeterministic(_))));
    }

    #[test]
    fn test_clock_follows_decision_task_time() {
        let mut builder = HistoryBuilder::new("clock");
        builder.workflow_started(json!(null)).decision_task();
        let first_started = builder.build()[2].timestamp;
        builder
            .decision_completed()
            .timer_started("timer-1", Duration::from_secs(60))
            .timer_fired("timer-1")
            .decision_task();
        let history = builder.build();
        let second_started = history.last().unwrap().timestamp;

        let mut decider = decider(&history);
        let decisions = decider.handle_window(&history, &NoEviction).unwrap();
        assert_eq!(
            decisions,
            vec![Decision::CompleteWorkflowExecution {
                result: json!([first_started.timestamp(), second_started.timestamp()])
            }]
        );
    }

    #[test]
    fn test_panic_reported_as_error() {
        let mut builder = HistoryBuilder::new("panics");
        builder.workflow_started(json!(null)).decision_task();
        let history = builder.build();

        let mut decider = decider(&history);
        let result = decider.handle_window(&history, &NoEviction);
        assert!(matches!(result, Err(ReplayError::WorkflowPanicked { .. })));
    }

    #[test]
    fn test_missing_start_event() {
        let mut builder = greeting_history();
        builder.decision_completed();
        let history = builder.build();
        let key = WorkflowExecutionKey::new("domain", &WorkflowExecution::new("wf", "run"));

        let result = ReplayDecider::new(
            key,
            &history[1],
            &registry(),
            ThreadBudget::new(1),
            Arc::new(LocalActivityRegistry::new()),
        );
        assert!(matches!(result, Err(RegistryError::MissingStartEvent { .. })));
    }

    #[test]
    fn test_close_releases_permits() {
        let history = greeting_history().build();
        let budget = ThreadBudget::new(4);
        let key = WorkflowExecutionKey::new("domain", &WorkflowExecution::new("wf", "run"));
        let mut decider = ReplayDecider::new(
            key,
            &history[0],
            &registry(),
            budget.clone(),
            Arc::new(LocalActivityRegistry::new()),
        )
        .unwrap();

        decider.handle_window(&history, &NoEviction).unwrap();
        assert_eq!(budget.available(), 3);

        decider.close();
        assert_eq!(budget.available(), 4);
        assert!(matches!(
            decider.handle_window(&history, &NoEviction),
            Err(ReplayError::Closed)
        ));
    }
}
