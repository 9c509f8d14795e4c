//! In-memory decision task source for testing

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use super::{DecisionTaskSource, SourceError};
use crate::handler::HandlerResult;
use crate::history::DecisionTask;

/// In-memory implementation of [`DecisionTaskSource`]
///
/// Tasks are queued per task queue and handed out in FIFO order. Responses
/// are recorded in arrival order.
///
/// # Example
///
/// ```
/// use durable_replay::service::InMemoryDecisionTaskSource;
///
/// let source = InMemoryDecisionTaskSource::new();
/// assert_eq!(source.pending("orders"), 0);
/// ```
#[derive(Default)]
pub struct InMemoryDecisionTaskSource {
    queues: Mutex<HashMap<String, VecDeque<DecisionTask>>>,
    responses: Mutex<Vec<HandlerResult>>,
    polls: Mutex<Vec<(String, String)>>,
    responded: Notify,
}

impl InMemoryDecisionTaskSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a task on `task_queue`
    pub fn push(&self, task_queue: impl Into<String>, task: DecisionTask) {
        self.queues
            .lock()
            .entry(task_queue.into())
            .or_default()
            .push_back(task);
    }

    /// Tasks still waiting on `task_queue`
    pub fn pending(&self, task_queue: &str) -> usize {
        self.queues.lock().get(task_queue).map_or(0, VecDeque::len)
    }

    /// Responses received so far
    pub fn responses(&self) -> Vec<HandlerResult> {
        self.responses.lock().clone()
    }

    /// `(task_queue, identity)` of every poll that returned a task
    pub fn polls(&self) -> Vec<(String, String)> {
        self.polls.lock().clone()
    }

    /// Wait until at least `count` responses arrived
    ///
    /// Returns false if `timeout` elapses first.
    pub async fn wait_for_responses(&self, count: usize, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.responded.notified();
                if self.responses.lock().len() >= count {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

#[async_trait]
impl DecisionTaskSource for InMemoryDecisionTaskSource {
    async fn poll_decision_task(
        &self,
        task_queue: &str,
        identity: &str,
    ) -> Result<Option<DecisionTask>, SourceError> {
        let task = self
            .queues
            .lock()
            .get_mut(task_queue)
            .and_then(VecDeque::pop_front);

        if task.is_some() {
            debug!(task_queue, identity, "handing out decision task");
            self.polls
                .lock()
                .push((task_queue.to_string(), identity.to_string()));
        }
        Ok(task)
    }

    async fn respond(&self, result: HandlerResult) -> Result<(), SourceError> {
        self.responses.lock().push(result);
        self.responded.notify_waiters();
        Ok(())
    }
}
