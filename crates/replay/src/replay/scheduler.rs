//! Cooperative scheduler for a workflow's logical threads
//!
//! Each execution owns one [`DeterministicRunner`]. Workflow code runs as
//! boxed futures polled with a no-op waker, always in spawn order, so the
//! interleaving depends only on the history being replayed. A thread only
//! suspends on futures handed out by the workflow context; those record why
//! the thread is blocked before returning `Pending`.
//!
//! A blocked thread is not polled again until the execution epoch moves past
//! the value it blocked at. Every resolution, signal, emitted decision and
//! finished thread bumps the epoch. Threads blocked on a condition are the
//! exception: conditions may read state the epoch does not track, so they are
//! re-evaluated on every pass.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::task::noop_waker_ref;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use super::state::{PendingThread, SharedState};
use super::ReplayError;
use crate::history::WorkflowExecutionKey;

/// Upper bound on scheduler passes per event loop run
const MAX_PASSES: usize = 10_000;

/// What a blocked logical thread is waiting for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    Activity(String),
    Timer(String),
    Signal(String),
    Join(String),
    Condition,
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Activity(id) => write!(f, "activity {}", id),
            Self::Timer(id) => write!(f, "timer {}", id),
            Self::Signal(name) => write!(f, "signal {}", name),
            Self::Join(name) => write!(f, "join {}", name),
            Self::Condition => f.write_str("condition"),
        }
    }
}

/// Scheduling state of a logical thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadState {
    Runnable,
    Blocked(BlockReason),
    Done,
}

/// Process-wide limit on live logical threads
///
/// Every logical thread holds one permit for its whole life. Permits come
/// back when the thread finishes or its decider is closed.
#[derive(Debug, Clone)]
pub struct ThreadBudget {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl ThreadBudget {
    pub fn new(capacity: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.permits.clone().try_acquire_owned().ok()
    }
}

/// Hook used by the runner to free thread permits held by idle executions
pub trait SelfEviction: Send + Sync {
    /// Evict one cached execution that is not being processed
    ///
    /// Returns true if something was evicted.
    fn evict_any_not_in_processing(&self, except: &WorkflowExecutionKey) -> bool;
}

/// Eviction hook that never evicts
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEviction;

impl SelfEviction for NoEviction {
    fn evict_any_not_in_processing(&self, _except: &WorkflowExecutionKey) -> bool {
        false
    }
}

struct LogicalThread {
    name: String,
    future: Option<BoxFuture<'static, ()>>,
    state: ThreadState,
    /// Epoch observed when the thread last blocked
    blocked_at: u64,
    permit: Option<OwnedSemaphorePermit>,
}

impl LogicalThread {
    fn is_ready(&self, epoch: u64) -> bool {
        match &self.state {
            ThreadState::Runnable | ThreadState::Blocked(BlockReason::Condition) => true,
            ThreadState::Blocked(_) => self.blocked_at != epoch,
            ThreadState::Done => false,
        }
    }

    fn finish(&mut self) {
        self.state = ThreadState::Done;
        self.future = None;
        self.permit = None;
    }
}

/// Deterministic cooperative scheduler for one workflow execution
pub struct DeterministicRunner {
    key: WorkflowExecutionKey,
    state: SharedState,
    budget: ThreadBudget,
    threads: Vec<LogicalThread>,
    closed: bool,
}

impl DeterministicRunner {
    pub(crate) fn new(key: WorkflowExecutionKey, state: SharedState, budget: ThreadBudget) -> Self {
        Self {
            key,
            state,
            budget,
            threads: Vec::new(),
            closed: false,
        }
    }

    /// Add a thread to the end of the schedule, acquiring its permit
    pub(crate) fn spawn(
        &mut self,
        name: impl Into<String>,
        future: BoxFuture<'static, ()>,
        eviction: &dyn SelfEviction,
    ) -> Result<(), ReplayError> {
        let name = name.into();
        let permit = self.acquire_permit(&name, eviction)?;
        debug!(
            workflow_id = %self.key.workflow_id(),
            thread = %name,
            "spawned logical thread"
        );
        self.threads.push(LogicalThread {
            name,
            future: Some(future),
            state: ThreadState::Runnable,
            blocked_at: 0,
            permit: Some(permit),
        });
        Ok(())
    }

    fn acquire_permit(
        &self,
        thread: &str,
        eviction: &dyn SelfEviction,
    ) -> Result<OwnedSemaphorePermit, ReplayError> {
        loop {
            if let Some(permit) = self.budget.try_acquire() {
                return Ok(permit);
            }
            if !eviction.evict_any_not_in_processing(&self.key) {
                warn!(
                    workflow_id = %self.key.workflow_id(),
                    thread,
                    capacity = self.budget.capacity(),
                    "no workflow thread permit available"
                );
                return Err(ReplayError::ThreadBudgetExhausted {
                    capacity: self.budget.capacity(),
                });
            }
            debug!(
                workflow_id = %self.key.workflow_id(),
                thread,
                "evicted idle execution to free a thread permit"
            );
        }
    }

    /// Poll ready threads until none of them can make progress
    ///
    /// The first thread is the workflow root; once it is done, the remaining
    /// threads are dropped.
    pub(crate) fn run_until_blocked(&mut self, eviction: &dyn SelfEviction) -> Result<(), ReplayError> {
        if self.closed {
            return Err(ReplayError::Closed);
        }

        let waker = noop_waker_ref();
        let mut cx = Context::from_waker(waker);

        for _ in 0..MAX_PASSES {
            self.admit_spawned(eviction)?;

            let mut progressed = false;
            let count = self.threads.len();

            for index in 0..count {
                let epoch_before = {
                    let mut state = self.state.lock();
                    if !self.threads[index].is_ready(state.epoch) {
                        continue;
                    }
                    state.blocked_on = None;
                    state.epoch
                };
                let Some(future) = self.threads[index].future.as_mut() else {
                    continue;
                };

                let polled = catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)));

                let (epoch_after, blocked_on) = {
                    let mut state = self.state.lock();
                    (state.epoch, state.blocked_on.take())
                };

                let thread = &mut self.threads[index];
                match polled {
                    Ok(Poll::Ready(())) => {
                        debug!(
                            workflow_id = %self.key.workflow_id(),
                            thread = %thread.name,
                            "logical thread finished"
                        );
                        thread.finish();
                        // Joiners wait on the epoch.
                        self.state.lock().epoch += 1;
                        progressed = true;
                    }
                    Ok(Poll::Pending) => {
                        thread.blocked_at = epoch_after;
                        thread.state = match blocked_on {
                            Some(reason) => ThreadState::Blocked(reason),
                            None => ThreadState::Runnable,
                        };
                    }
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        let thread_name = thread.name.clone();
                        thread.finish();
                        return Err(ReplayError::WorkflowPanicked {
                            thread: thread_name,
                            message,
                        });
                    }
                }

                if epoch_after != epoch_before {
                    progressed = true;
                }

                if index == 0 && self.threads[0].state == ThreadState::Done {
                    self.drop_children();
                    return Ok(());
                }
            }

            let spawned_pending = !self.state.lock().spawned.is_empty();
            if !progressed && !spawned_pending {
                return Ok(());
            }
        }

        Err(ReplayError::Livelock { passes: MAX_PASSES })
    }

    fn admit_spawned(&mut self, eviction: &dyn SelfEviction) -> Result<(), ReplayError> {
        let spawned: Vec<PendingThread> = std::mem::take(&mut self.state.lock().spawned);
        for thread in spawned {
            self.spawn(thread.name, thread.future, eviction)?;
        }
        Ok(())
    }

    fn drop_children(&mut self) {
        for thread in self.threads.iter_mut().skip(1) {
            if thread.state != ThreadState::Done {
                thread.finish();
            }
        }
        self.state.lock().spawned.clear();
    }

    /// Whether every thread has finished
    pub fn is_done(&self) -> bool {
        !self.threads.is_empty() && self.threads.iter().all(|t| t.state == ThreadState::Done)
    }

    /// Number of threads still holding a permit
    pub fn live_threads(&self) -> usize {
        self.threads.iter().filter(|t| t.permit.is_some()).count()
    }

    /// Snapshot of thread names and states, in spawn order
    pub fn thread_states(&self) -> Vec<(String, ThreadState)> {
        self.threads
            .iter()
            .map(|t| (t.name.clone(), t.state.clone()))
            .collect()
    }

    /// Drop every suspended thread and return its permit
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for thread in &mut self.threads {
            thread.finish();
        }
        self.state.lock().spawned.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for DeterministicRunner {
    fn drop(&mut self) {
        self.close();
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
