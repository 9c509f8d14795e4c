//! Execution state shared between a decider, its runner and workflow code

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::Value;

use super::scheduler::BlockReason;
use crate::activity::{ActivityError, LocalActivityRegistry};
use crate::history::WorkflowExecutionKey;
use crate::workflow::{Decision, WorkflowError};

pub(crate) type SharedState = Arc<Mutex<ExecutionState>>;

/// Answers a named query against workflow state
pub type QueryHandler = Arc<dyn Fn(Value) -> Result<Value, WorkflowError> + Send + Sync>;

/// How the workflow function finished
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowOutcome {
    Completed(Value),
    Failed(WorkflowError),
    Canceled(Option<Value>),
}

/// A logical thread spawned by workflow code, not yet admitted by the runner
pub(crate) struct PendingThread {
    pub(crate) name: String,
    pub(crate) future: BoxFuture<'static, ()>,
}

pub(crate) struct ExecutionState {
    pub(crate) key: WorkflowExecutionKey,
    pub(crate) workflow_type: String,

    /// Timestamp of the decision task currently being processed
    pub(crate) now: DateTime<Utc>,
    pub(crate) replaying: bool,

    /// Bumped on every observable change; the runner polls until it is stable
    pub(crate) epoch: u64,

    /// Decisions emitted and not yet echoed back by history
    pub(crate) decisions: VecDeque<Decision>,

    pub(crate) next_activity_seq: u64,
    pub(crate) next_timer_seq: u64,
    pub(crate) next_side_effect_seq: u64,
    pub(crate) next_local_activity_seq: u64,

    /// Scheduled activities; `None` until the outcome arrives
    pub(crate) activities: HashMap<String, Option<Result<Value, ActivityError>>>,
    pub(crate) timers: HashMap<String, Option<Result<(), WorkflowError>>>,
    pub(crate) signals: HashMap<String, VecDeque<Value>>,

    /// Markers recorded for the decision task being replayed, by marker id
    pub(crate) markers: HashMap<String, Value>,

    pub(crate) rng: StdRng,
    pub(crate) spawned: Vec<PendingThread>,
    pub(crate) blocked_on: Option<BlockReason>,
    pub(crate) queries: HashMap<String, QueryHandler>,
    pub(crate) local_activities: Arc<LocalActivityRegistry>,
    pub(crate) cancel_requested: bool,
    pub(crate) outcome: Option<WorkflowOutcome>,
}

impl ExecutionState {
    pub(crate) fn new(
        key: WorkflowExecutionKey,
        workflow_type: impl Into<String>,
        local_activities: Arc<LocalActivityRegistry>,
    ) -> Self {
        let seed = seed_from(key.run_id());
        Self {
            key,
            workflow_type: workflow_type.into(),
            now: DateTime::<Utc>::UNIX_EPOCH,
            replaying: true,
            epoch: 0,
            decisions: VecDeque::new(),
            next_activity_seq: 0,
            next_timer_seq: 0,
            next_side_effect_seq: 0,
            next_local_activity_seq: 0,
            activities: HashMap::new(),
            timers: HashMap::new(),
            signals: HashMap::new(),
            markers: HashMap::new(),
            rng: StdRng::seed_from_u64(seed),
            spawned: Vec::new(),
            blocked_on: None,
            queries: HashMap::new(),
            local_activities,
            cancel_requested: false,
            outcome: None,
        }
    }

    pub(crate) fn shared(self) -> SharedState {
        Arc::new(Mutex::new(self))
    }

    pub(crate) fn emit(&mut self, decision: Decision) {
        self.decisions.push_back(decision);
        self.epoch += 1;
    }

    pub(crate) fn block_on(&mut self, reason: BlockReason) {
        self.blocked_on = Some(reason);
    }

    /// Returns false if no pending activity has this id
    pub(crate) fn resolve_activity(
        &mut self,
        activity_id: &str,
        result: Result<Value, ActivityError>,
    ) -> bool {
        match self.activities.get_mut(activity_id) {
            Some(slot) if slot.is_none() => {
                *slot = Some(result);
                self.epoch += 1;
                true
            }
            _ => false,
        }
    }

    /// Returns false if no pending timer has this id
    pub(crate) fn resolve_timer(&mut self, timer_id: &str, result: Result<(), WorkflowError>) -> bool {
        match self.timers.get_mut(timer_id) {
            Some(slot) if slot.is_none() => {
                *slot = Some(result);
                self.epoch += 1;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn deliver_signal(&mut self, signal_name: &str, input: Value) {
        self.signals
            .entry(signal_name.to_string())
            .or_default()
            .push_back(input);
        self.epoch += 1;
    }

    pub(crate) fn request_cancel(&mut self) {
        self.cancel_requested = true;
        self.epoch += 1;
    }

    /// Record the root outcome and emit the closing decision
    pub(crate) fn finish(&mut self, result: Result<Value, WorkflowError>) {
        if self.outcome.is_some() {
            return;
        }
        let (decision, outcome) = match result {
            Ok(result) => (
                Decision::CompleteWorkflowExecution {
                    result: result.clone(),
                },
                WorkflowOutcome::Completed(result),
            ),
            Err(error) if error.is_cancelled() => (
                Decision::CancelWorkflowExecution {
                    details: error.details.clone(),
                },
                WorkflowOutcome::Canceled(error.details),
            ),
            Err(error) => (
                Decision::FailWorkflowExecution {
                    error: error.clone(),
                },
                WorkflowOutcome::Failed(error),
            ),
        };
        self.emit(decision);
        self.outcome = Some(outcome);
    }
}

/// FNV-1a over the run id; stable across processes and releases
fn seed_from(run_id: &str) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0100_0000_01b3;
    run_id
        .bytes()
        .fold(OFFSET, |hash, byte| (hash ^ byte as u64).wrapping_mul(PRIME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::WorkflowExecution;
    use serde_json::json;

    fn state() -> ExecutionState {
        let key = WorkflowExecutionKey::new("domain", &WorkflowExecution::new("wf", "run-1"));
        ExecutionState::new(key, "test", Arc::new(LocalActivityRegistry::new()))
    }

    #[test]
    fn test_seed_is_stable() {
        assert_eq!(seed_from("run-1"), seed_from("run-1"));
        assert_ne!(seed_from("run-1"), seed_from("run-2"));
    }

    #[test]
    fn test_resolve_unknown_activity() {
        let mut state = state();
        assert!(!state.resolve_activity("missing", Ok(json!(1))));

        state.activities.insert("a".to_string(), None);
        assert!(state.resolve_activity("a", Ok(json!(1))));
        assert!(!state.resolve_activity("a", Ok(json!(2))));
    }

    #[test]
    fn test_finish_emits_single_terminal_decision() {
        let mut state = state();
        state.finish(Err(WorkflowError::cancelled("stop")));
        state.finish(Ok(json!(1)));

        assert_eq!(state.decisions.len(), 1);
        assert!(matches!(
            state.decisions[0],
            Decision::CancelWorkflowExecution { .. }
        ));
        assert_eq!(state.outcome, Some(WorkflowOutcome::Canceled(None)));
    }
}
