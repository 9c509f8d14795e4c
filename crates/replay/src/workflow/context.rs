//! Workflow-facing API for deterministic execution
//!
//! Everything a workflow needs from the outside world goes through
//! [`WorkflowContext`]: scheduling activities and timers, waiting for
//! signals, spawning logical threads, and reading time or randomness.
//! During replay the context answers from history instead of acting.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::RngCore;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use super::{ActivityOptions, Decision, WorkflowError};
use crate::activity::{ActivityError, LocalActivityOptions, LocalActivityOutcome};
use crate::history::WorkflowExecutionKey;
use crate::replay::state::{PendingThread, QueryHandler, SharedState};
use crate::replay::BlockReason;

/// Marker name for recorded side effects
pub const SIDE_EFFECT_MARKER: &str = "SideEffect";

/// Marker name for recorded local activity outcomes
pub const LOCAL_ACTIVITY_MARKER: &str = "LocalActivity";

/// Handle to the running workflow execution
///
/// Cheap to clone; every clone refers to the same execution.
#[derive(Clone)]
pub struct WorkflowContext {
    state: SharedState,
}

impl WorkflowContext {
    pub(crate) fn new(state: SharedState) -> Self {
        Self { state }
    }

    pub fn workflow_execution(&self) -> WorkflowExecutionKey {
        self.state.lock().key.clone()
    }

    pub fn workflow_type(&self) -> String {
        self.state.lock().workflow_type.clone()
    }

    /// Current workflow time
    ///
    /// This is the timestamp of the decision task being processed, never the
    /// wall clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.state.lock().now
    }

    /// Whether the code is re-executing already recorded history
    pub fn is_replaying(&self) -> bool {
        self.state.lock().replaying
    }

    /// Whether cancellation of this workflow was requested
    pub fn is_cancel_requested(&self) -> bool {
        self.state.lock().cancel_requested
    }

    /// Schedule an activity with a generated id
    pub fn schedule_activity(
        &self,
        activity_type: impl Into<String>,
        input: Value,
        options: ActivityOptions,
    ) -> ActivityFuture {
        let activity_id = {
            let mut state = self.state.lock();
            state.next_activity_seq += 1;
            format!("activity-{}", state.next_activity_seq)
        };
        self.schedule_activity_with_id(activity_id, activity_type, input, options)
    }

    /// Schedule an activity with an explicit id
    ///
    /// Ids must be unique within the execution and must not collide with
    /// generated `activity-N` ids.
    pub fn schedule_activity_with_id(
        &self,
        activity_id: impl Into<String>,
        activity_type: impl Into<String>,
        input: Value,
        options: ActivityOptions,
    ) -> ActivityFuture {
        let activity_id = activity_id.into();
        let mut state = self.state.lock();
        state.activities.insert(activity_id.clone(), None);
        state.emit(Decision::ScheduleActivityTask {
            activity_id: activity_id.clone(),
            activity_type: activity_type.into(),
            input,
            options,
        });
        ActivityFuture {
            activity_id,
            state: self.state.clone(),
        }
    }

    /// Request cancellation of a scheduled activity
    ///
    /// The activity future resolves once the service reports the outcome.
    pub fn cancel_activity(&self, activity_id: &str) -> bool {
        let mut state = self.state.lock();
        if !matches!(state.activities.get(activity_id), Some(None)) {
            return false;
        }
        state.emit(Decision::RequestCancelActivityTask {
            activity_id: activity_id.to_string(),
        });
        true
    }

    /// Start a durable timer
    ///
    /// A zero duration completes immediately without a decision.
    pub fn start_timer(&self, duration: Duration) -> TimerFuture {
        if duration.is_zero() {
            return TimerFuture {
                timer_id: None,
                state: self.state.clone(),
            };
        }

        let mut state = self.state.lock();
        state.next_timer_seq += 1;
        let timer_id = format!("timer-{}", state.next_timer_seq);
        state.timers.insert(timer_id.clone(), None);
        state.emit(Decision::StartTimer {
            timer_id: timer_id.clone(),
            duration,
        });
        TimerFuture {
            timer_id: Some(timer_id),
            state: self.state.clone(),
        }
    }

    /// Sleep for `duration` of workflow time
    pub fn sleep(&self, duration: Duration) -> TimerFuture {
        self.start_timer(duration)
    }

    /// Cancel a pending timer; its future resolves with a cancellation error
    ///
    /// Returns false if the timer already fired or does not exist.
    pub fn cancel_timer(&self, timer_id: &str) -> bool {
        let mut state = self.state.lock();
        if !state.resolve_timer(timer_id, Err(WorkflowError::cancelled("timer canceled"))) {
            return false;
        }
        state.emit(Decision::CancelTimer {
            timer_id: timer_id.to_string(),
        });
        true
    }

    /// Wait for the next signal with the given name
    ///
    /// Signals delivered before anyone waits are buffered in arrival order.
    pub fn wait_signal(&self, signal_name: impl Into<String>) -> SignalFuture {
        SignalFuture {
            signal_name: signal_name.into(),
            state: self.state.clone(),
        }
    }

    /// Wait until `condition` holds
    ///
    /// The condition is re-evaluated whenever another logical thread makes
    /// progress. It must only read workflow state.
    pub fn wait_until<F>(&self, condition: F) -> ConditionFuture
    where
        F: Fn() -> bool + Send + 'static,
    {
        ConditionFuture {
            condition: Box::new(condition),
            state: self.state.clone(),
        }
    }

    /// Spawn a logical thread
    ///
    /// Threads run cooperatively in spawn order and hold a permit from the
    /// worker's thread budget until they finish.
    pub fn spawn<F, T>(&self, name: impl Into<String>, future: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let name = name.into();
        let slot = Arc::new(Mutex::new(None));
        let writer = slot.clone();
        let thread = async move {
            let value = future.await;
            *writer.lock() = Some(value);
        };

        let mut state = self.state.lock();
        state.spawned.push(PendingThread {
            name: name.clone(),
            future: Box::pin(thread),
        });
        state.epoch += 1;

        JoinHandle {
            name,
            slot,
            state: self.state.clone(),
        }
    }

    /// Run a non-deterministic function once and record its result
    ///
    /// On replay the recorded value is returned and `f` is not called.
    pub fn side_effect<T, F>(&self, f: F) -> Result<T, WorkflowError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> T,
    {
        let (marker_id, recorded) = {
            let mut state = self.state.lock();
            state.next_side_effect_seq += 1;
            let marker_id = format!("side_effect-{}", state.next_side_effect_seq);
            let recorded = state.markers.get(&marker_id).cloned();
            (marker_id, recorded)
        };

        let details = match recorded {
            Some(details) => details,
            None => serde_json::to_value(f())?,
        };

        self.state.lock().emit(Decision::RecordMarker {
            marker_name: SIDE_EFFECT_MARKER.to_string(),
            marker_id,
            details: details.clone(),
        });

        Ok(serde_json::from_value(details)?)
    }

    /// Run a registered local activity in-process
    ///
    /// Retries happen within the call, separated by the policy's backoff. The
    /// outcome is recorded as a marker, and replay returns the recorded
    /// outcome without running the activity again.
    pub fn execute_local_activity(
        &self,
        activity_type: &str,
        input: Value,
        options: LocalActivityOptions,
    ) -> Result<Value, ActivityError> {
        let (marker_id, recorded, registry) = {
            let mut state = self.state.lock();
            state.next_local_activity_seq += 1;
            let marker_id = format!("local_activity-{}", state.next_local_activity_seq);
            let recorded = state.markers.get(&marker_id).cloned();
            (marker_id, recorded, state.local_activities.clone())
        };

        let outcome = match recorded {
            Some(details) => serde_json::from_value::<LocalActivityOutcome>(details).map_err(|e| {
                ActivityError::non_retryable(format!("corrupt local activity marker: {}", e))
            })?,
            None => {
                let options = options
                    .validate_and_build_with_defaults()
                    .map_err(|e| ActivityError::non_retryable(e.to_string()))?;
                debug!(activity_type, marker_id = %marker_id, "running local activity");
                registry.execute(activity_type, input, &options)
            }
        };

        let details = serde_json::to_value(&outcome)
            .map_err(|e| ActivityError::non_retryable(e.to_string()))?;
        self.state.lock().emit(Decision::RecordMarker {
            marker_name: LOCAL_ACTIVITY_MARKER.to_string(),
            marker_id,
            details,
        });

        outcome.result
    }

    /// Deterministic random number, seeded from the run id
    pub fn random_u64(&self) -> u64 {
        self.state.lock().rng.next_u64()
    }

    /// Deterministic v4 UUID, seeded from the run id
    pub fn new_uuid(&self) -> Uuid {
        let mut bytes = [0u8; 16];
        self.state.lock().rng.fill_bytes(&mut bytes);
        uuid::Builder::from_random_bytes(bytes).into_uuid()
    }

    /// Register a handler answering read-only queries
    pub fn register_query<F>(&self, query_type: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Result<Value, WorkflowError> + Send + Sync + 'static,
    {
        let handler: QueryHandler = Arc::new(handler);
        self.state.lock().queries.insert(query_type.into(), handler);
    }
}

impl std::fmt::Debug for WorkflowContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("WorkflowContext")
            .field("execution", &state.key)
            .field("workflow_type", &state.workflow_type)
            .finish()
    }
}

/// Resolves with the activity result or failure
pub struct ActivityFuture {
    activity_id: String,
    state: SharedState,
}

impl ActivityFuture {
    pub fn activity_id(&self) -> &str {
        &self.activity_id
    }
}

impl Future for ActivityFuture {
    type Output = Result<Value, ActivityError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.state.lock();
        let resolved = state.activities.get(&self.activity_id).map(Option::is_some);
        match resolved {
            Some(true) => {
                let result = state
                    .activities
                    .remove(&self.activity_id)
                    .flatten()
                    .unwrap_or_else(|| Err(ActivityError::non_retryable("activity result missing")));
                state.epoch += 1;
                Poll::Ready(result)
            }
            Some(false) => {
                state.block_on(BlockReason::Activity(self.activity_id.clone()));
                Poll::Pending
            }
            None => Poll::Ready(Err(ActivityError::non_retryable(format!(
                "activity {} result already consumed",
                self.activity_id
            )))),
        }
    }
}

/// Resolves when the timer fires, or with an error when it is canceled
pub struct TimerFuture {
    timer_id: Option<String>,
    state: SharedState,
}

impl TimerFuture {
    /// Id of the timer; `None` for zero-duration timers
    pub fn timer_id(&self) -> Option<&str> {
        self.timer_id.as_deref()
    }
}

impl Future for TimerFuture {
    type Output = Result<(), WorkflowError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(timer_id) = &self.timer_id else {
            return Poll::Ready(Ok(()));
        };

        let mut state = self.state.lock();
        let resolved = state.timers.get(timer_id).map(Option::is_some);
        match resolved {
            Some(true) => {
                let result = state
                    .timers
                    .remove(timer_id)
                    .flatten()
                    .unwrap_or_else(|| Err(WorkflowError::new("timer result missing")));
                state.epoch += 1;
                Poll::Ready(result)
            }
            Some(false) => {
                state.block_on(BlockReason::Timer(timer_id.clone()));
                Poll::Pending
            }
            None => Poll::Ready(Err(WorkflowError::new(format!(
                "timer {} already consumed",
                timer_id
            )))),
        }
    }
}

/// Resolves with the payload of the next matching signal
pub struct SignalFuture {
    signal_name: String,
    state: SharedState,
}

impl Future for SignalFuture {
    type Output = Value;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.state.lock();
        let next = state
            .signals
            .get_mut(&self.signal_name)
            .and_then(|queue| queue.pop_front());
        match next {
            Some(payload) => {
                state.epoch += 1;
                Poll::Ready(payload)
            }
            None => {
                state.block_on(BlockReason::Signal(self.signal_name.clone()));
                Poll::Pending
            }
        }
    }
}

/// Resolves once its condition holds
pub struct ConditionFuture {
    condition: Box<dyn Fn() -> bool + Send>,
    state: SharedState,
}

impl Future for ConditionFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Evaluated without the state lock; conditions may read the context.
        let satisfied = (self.condition)();
        let mut state = self.state.lock();
        if satisfied {
            state.epoch += 1;
            Poll::Ready(())
        } else {
            state.block_on(BlockReason::Condition);
            Poll::Pending
        }
    }
}

/// Resolves with the return value of a spawned logical thread
pub struct JoinHandle<T> {
    name: String,
    slot: Arc<Mutex<Option<T>>>,
    state: SharedState,
}

impl<T> JoinHandle<T> {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let value = self.slot.lock().take();
        let mut state = self.state.lock();
        match value {
            Some(value) => {
                state.epoch += 1;
                Poll::Ready(value)
            }
            None => {
                state.block_on(BlockReason::Join(self.name.clone()));
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::LocalActivityRegistry;
    use crate::history::WorkflowExecution;
    use crate::replay::state::ExecutionState;
    use futures::FutureExt;
    use serde_json::json;

    fn context() -> (WorkflowContext, SharedState) {
        let key = WorkflowExecutionKey::new("domain", &WorkflowExecution::new("wf", "run-7"));
        let mut registry = LocalActivityRegistry::new();
        registry.register("upper", |input| {
            Ok(json!(input.as_str().unwrap_or_default().to_uppercase()))
        });
        let state = ExecutionState::new(key, "test", Arc::new(registry)).shared();
        (WorkflowContext::new(state.clone()), state)
    }

    #[test]
    fn test_schedule_activity_emits_decision() {
        let (ctx, state) = context();
        let future = ctx.schedule_activity("charge", json!(5), ActivityOptions::default());
        assert_eq!(future.activity_id(), "activity-1");

        let state = state.lock();
        assert_eq!(state.decisions.len(), 1);
        assert_eq!(state.decisions[0].kind(), "schedule_activity_task");
    }

    #[test]
    fn test_activity_future_blocks_until_resolved() {
        let (ctx, state) = context();
        let mut future = ctx.schedule_activity("charge", json!(5), ActivityOptions::default());

        assert!((&mut future).now_or_never().is_none());
        assert_eq!(
            state.lock().blocked_on,
            Some(BlockReason::Activity("activity-1".to_string()))
        );

        state.lock().resolve_activity("activity-1", Ok(json!("done")));
        assert_eq!(future.now_or_never(), Some(Ok(json!("done"))));
    }

    #[test]
    fn test_zero_timer_is_immediate() {
        let (ctx, state) = context();
        let timer = ctx.start_timer(Duration::ZERO);
        assert_eq!(timer.timer_id(), None);
        assert_eq!(timer.now_or_never(), Some(Ok(())));
        assert!(state.lock().decisions.is_empty());
    }

    #[test]
    fn test_cancel_timer() {
        let (ctx, state) = context();
        let timer = ctx.start_timer(Duration::from_secs(10));
        let timer_id = timer.timer_id().unwrap().to_string();

        assert!(ctx.cancel_timer(&timer_id));
        assert!(!ctx.cancel_timer(&timer_id));

        let result = timer.now_or_never().unwrap();
        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(state.lock().decisions.len(), 2);
    }

    #[test]
    fn test_signals_are_buffered() {
        let (ctx, state) = context();
        state.lock().deliver_signal("approve", json!(1));
        state.lock().deliver_signal("approve", json!(2));

        assert_eq!(ctx.wait_signal("approve").now_or_never(), Some(json!(1)));
        assert_eq!(ctx.wait_signal("approve").now_or_never(), Some(json!(2)));
        assert_eq!(ctx.wait_signal("approve").now_or_never(), None);
    }

    #[test]
    fn test_side_effect_replays_recorded_value() {
        let (ctx, state) = context();
        state
            .lock()
            .markers
            .insert("side_effect-1".to_string(), json!(41));

        let value: i64 = ctx.side_effect(|| 99).unwrap();
        assert_eq!(value, 41);

        let fresh: i64 = ctx.side_effect(|| 7).unwrap();
        assert_eq!(fresh, 7);
        assert_eq!(state.lock().decisions.len(), 2);
    }

    #[test]
    fn test_local_activity_runs_and_records() {
        let (ctx, state) = context();
        let result = ctx
            .execute_local_activity("upper", json!("abc"), LocalActivityOptions::new())
            .unwrap();
        assert_eq!(result, json!("ABC"));

        let state = state.lock();
        match &state.decisions[0] {
            Decision::RecordMarker {
                marker_name,
                marker_id,
                ..
            } => {
                assert_eq!(marker_name, LOCAL_ACTIVITY_MARKER);
                assert_eq!(marker_id, "local_activity-1");
            }
            other => panic!("unexpected decision: {}", other),
        }
    }

    #[test]
    fn test_randomness_is_seeded_by_run() {
        let (first, _) = context();
        let (second, _) = context();
        assert_eq!(first.random_u64(), second.random_u64());
        assert_eq!(first.new_uuid(), second.new_uuid());
    }

    #[test]
    fn test_spawn_queues_thread() {
        let (ctx, state) = context();
        let handle = ctx.spawn("child", async { 5 });
        assert_eq!(handle.name(), "child");
        assert_eq!(state.lock().spawned.len(), 1);
    }
}
