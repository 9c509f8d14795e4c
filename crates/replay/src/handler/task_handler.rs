//! Sticky-aware decision task handler

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, instrument, warn};

use super::{DecisionTaskFailedCause, HandlerResult, QueryCompleted, TaskCompleted, TaskFailed};
use crate::activity::LocalActivityRegistry;
use crate::cache::{CacheError, DeciderCache, DeciderLease};
use crate::history::{DecisionTask, StickyExecutionAttributes, WorkflowExecutionKey, WorkflowQuery};
use crate::metrics::{names, MetricsSink, NoopMetrics};
use crate::replay::{RegistryError, ReplayDecider, ReplayError, ReplayWorkflowFactory, ThreadBudget};
use crate::workflow::WorkflowError;

/// Errors that escape the handler instead of becoming a task failure
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The decider could not be built from the task
    #[error("failed to build decider: {0}")]
    Build(#[from] RegistryError),
}

/// Handler configuration
#[derive(Debug, Clone)]
pub struct HandlerOptions {
    /// Sticky queue of this worker; `None` disables sticky execution
    pub sticky_task_queue: Option<String>,

    /// Schedule-to-start timeout advertised with sticky attributes
    pub sticky_schedule_to_start_timeout: Duration,

    /// How often to retry when a cached decider is evicted mid-wait
    pub max_lease_attempts: usize,

    /// Thread budget shared by every decider of the worker factory
    pub max_workflow_thread_count: usize,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            sticky_task_queue: None,
            sticky_schedule_to_start_timeout: Duration::from_secs(5),
            max_lease_attempts: 3,
            max_workflow_thread_count: 600,
        }
    }
}

impl HandlerOptions {
    /// Enable sticky execution on `task_queue`
    pub fn sticky(task_queue: impl Into<String>, schedule_to_start_timeout: Duration) -> Self {
        Self {
            sticky_task_queue: Some(task_queue.into()),
            sticky_schedule_to_start_timeout: schedule_to_start_timeout,
            ..Self::default()
        }
    }
}

/// Decision task handler backed by the decider cache
///
/// Tasks with full history are replayed on a fresh decider. Tasks with only
/// new events resume the cached decider for the execution; if none is
/// cached the task fails with [`DecisionTaskFailedCause::ResetStickyTaskQueue`]
/// so the service resends full history.
pub struct ReplayDecisionTaskHandler {
    domain: String,
    factory: Arc<dyn ReplayWorkflowFactory>,
    cache: DeciderCache,
    options: HandlerOptions,
    budget: ThreadBudget,
    local_activities: Arc<LocalActivityRegistry>,
    metrics: Arc<dyn MetricsSink>,
}

impl ReplayDecisionTaskHandler {
    pub fn new(
        domain: impl Into<String>,
        factory: Arc<dyn ReplayWorkflowFactory>,
        cache: DeciderCache,
        options: HandlerOptions,
    ) -> Self {
        let budget = ThreadBudget::new(options.max_workflow_thread_count);
        Self {
            domain: domain.into(),
            factory,
            cache,
            options,
            budget,
            local_activities: Arc::new(LocalActivityRegistry::new()),
            metrics: Arc::new(NoopMetrics),
        }
    }

    /// Share a thread budget with other handlers
    pub fn with_thread_budget(mut self, budget: ThreadBudget) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_local_activities(mut self, local_activities: Arc<LocalActivityRegistry>) -> Self {
        self.local_activities = local_activities;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn cache(&self) -> &DeciderCache {
        &self.cache
    }

    pub fn thread_budget(&self) -> &ThreadBudget {
        &self.budget
    }

    /// Whether completed tasks may carry sticky attributes
    pub fn is_sticky(&self) -> bool {
        self.options.sticky_task_queue.is_some()
    }

    /// Handle one decision task
    #[instrument(
        skip(self, task),
        fields(
            workflow_id = %task.workflow_execution.workflow_id,
            run_id = %task.workflow_execution.run_id,
            workflow_type = %task.workflow_type,
            first_event_id = task.first_event_id().unwrap_or_default()
        )
    )]
    pub async fn handle(&self, task: DecisionTask) -> Result<HandlerResult, HandlerError> {
        let key = WorkflowExecutionKey::new(self.domain.clone(), &task.workflow_execution);

        if let Some(query) = &task.query {
            return self.handle_query(&key, &task, query).await;
        }

        if !task.is_full_history() && !self.routed_to_this_worker(&task) {
            self.cache
                .invalidate(&key, "partial history without matching sticky attributes");
            return Ok(self.reset_sticky(&task, "partial history was not routed to this worker"));
        }

        for attempt in 1..=self.options.max_lease_attempts {
            let lease = self
                .cache
                .get_or_create(&key, &task.history, || self.build_decider(&key, &task))
                .await;

            match lease {
                Ok(lease) => return Ok(self.process(&task, lease)),
                Err(CacheError::Evicted(_)) => {
                    debug!(attempt, "cached decider evicted while waiting, retrying");
                }
                Err(CacheError::MissingDecider(_)) => {
                    return Ok(self.reset_sticky(&task, "no cached decider for partial history"));
                }
                Err(CacheError::Build(e)) => {
                    error!(error = %e, "failed to build decider");
                    return Err(HandlerError::Build(e));
                }
            }
        }

        Ok(self.reset_sticky(&task, "cached decider kept being evicted"))
    }

    fn routed_to_this_worker(&self, task: &DecisionTask) -> bool {
        match (&task.sticky_attributes, &self.options.sticky_task_queue) {
            (Some(attributes), Some(queue)) => attributes.worker_task_queue == *queue,
            _ => false,
        }
    }

    fn build_decider(
        &self,
        key: &WorkflowExecutionKey,
        task: &DecisionTask,
    ) -> Result<ReplayDecider, RegistryError> {
        let Some(start_event) = task.history.first() else {
            return Err(RegistryError::MissingStartEvent {
                found: "empty history".to_string(),
            });
        };
        ReplayDecider::new(
            key.clone(),
            start_event,
            self.factory.as_ref(),
            self.budget.clone(),
            self.local_activities.clone(),
        )
    }

    fn process(&self, task: &DecisionTask, mut lease: DeciderLease) -> HandlerResult {
        match lease.handle_window(&task.history, &self.cache) {
            Ok(decisions) => {
                let terminal = lease.is_terminal();
                let sticky_attributes = match &self.options.sticky_task_queue {
                    Some(queue) if !terminal => {
                        if self.cache.add_to_cache(lease) {
                            Some(StickyExecutionAttributes::new(
                                queue.clone(),
                                self.options.sticky_schedule_to_start_timeout,
                            ))
                        } else {
                            None
                        }
                    }
                    _ => {
                        let reason = if terminal {
                            "workflow closed"
                        } else {
                            "sticky execution disabled"
                        };
                        self.cache.invalidate_lease(lease, reason);
                        None
                    }
                };

                debug!(
                    decisions = decisions.len(),
                    sticky = sticky_attributes.is_some(),
                    "decision task completed"
                );
                self.metrics.increment(names::DECISION_TASK_COMPLETED, 1);

                HandlerResult::Completed(TaskCompleted {
                    task_token: task.task_token.clone(),
                    decisions,
                    sticky_attributes,
                })
            }
            Err(err) => {
                let cause = failure_cause(&err);
                match cause {
                    DecisionTaskFailedCause::NonDeterministicWorkflow => {
                        error!(error = %err, "workflow is non-deterministic");
                        self.metrics.increment(names::DECISION_TASK_NON_DETERMINISTIC, 1);
                    }
                    _ => warn!(error = %err, ?cause, "decision task failed"),
                }
                self.cache.invalidate_lease(lease, &err.to_string());
                self.metrics.increment(names::DECISION_TASK_FAILED, 1);

                HandlerResult::Failed(TaskFailed {
                    task_token: task.task_token.clone(),
                    cause,
                    details: err.to_string(),
                })
            }
        }
    }

    async fn handle_query(
        &self,
        key: &WorkflowExecutionKey,
        task: &DecisionTask,
        query: &WorkflowQuery,
    ) -> Result<HandlerResult, HandlerError> {
        let result = if task.is_full_history() {
            let mut decider = self.build_decider(key, task)?;
            let result = match decider.handle_window(&task.history, &self.cache) {
                Ok(_) => decider.query(&query.query_type, query.args.clone()),
                Err(e) => Err(WorkflowError::new(e.to_string())),
            };
            decider.close();
            result
        } else {
            self.query_cached(key, task, query).await?
        };

        debug!(query_type = %query.query_type, ok = result.is_ok(), "query answered");
        self.metrics.increment(names::QUERY_TASK_COMPLETED, 1);

        Ok(HandlerResult::QueryCompleted(QueryCompleted {
            task_token: task.task_token.clone(),
            result,
        }))
    }

    async fn query_cached(
        &self,
        key: &WorkflowExecutionKey,
        task: &DecisionTask,
        query: &WorkflowQuery,
    ) -> Result<Result<Value, WorkflowError>, HandlerError> {
        let mut evicted = None;
        for attempt in 1..=self.options.max_lease_attempts {
            match self
                .cache
                .get_or_create(key, &task.history, || self.build_decider(key, task))
                .await
            {
                Ok(lease) => {
                    let result = lease.query(&query.query_type, query.args.clone());
                    self.cache.mark_processing_done(lease);
                    return Ok(result);
                }
                Err(e @ CacheError::Evicted(_)) => {
                    debug!(attempt, "cached decider evicted while waiting for query, retrying");
                    evicted = Some(e);
                }
                Err(CacheError::Build(e)) => return Err(HandlerError::Build(e)),
                Err(e) => return Ok(Err(WorkflowError::new(e.to_string()))),
            }
        }
        let message = evicted.map_or_else(
            || format!("no cached decider for {}", key),
            |e| e.to_string(),
        );
        Ok(Err(WorkflowError::new(message)))
    }

    fn reset_sticky(&self, task: &DecisionTask, details: &str) -> HandlerResult {
        warn!(details, "resetting sticky execution");
        self.metrics.increment(names::DECISION_TASK_FAILED, 1);
        HandlerResult::Failed(TaskFailed {
            task_token: task.task_token.clone(),
            cause: DecisionTaskFailedCause::ResetStickyTaskQueue,
            details: details.to_string(),
        })
    }
}

impl std::fmt::Debug for ReplayDecisionTaskHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayDecisionTaskHandler")
            .field("domain", &self.domain)
            .field("options", &self.options)
            .field("cache", &self.cache)
            .finish()
    }
}

fn failure_cause(err: &ReplayError) -> DecisionTaskFailedCause {
    if err.is_non_deterministic() {
        DecisionTaskFailedCause::NonDeterministicWorkflow
    } else if err.is_history_inconsistency() {
        DecisionTaskFailedCause::ResetStickyTaskQueue
    } else {
        DecisionTaskFailedCause::UnhandledFailure
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_causes() {
        assert_eq!(
            failure_cause(&ReplayError::NonDeterministic("x".to_string())),
            DecisionTaskFailedCause::NonDeterministicWorkflow
        );
        assert_eq!(
            failure_cause(&ReplayError::HistoryGap {
                expected: 4,
                actual: 9
            }),
            DecisionTaskFailedCause::ResetStickyTaskQueue
        );
        assert_eq!(
            failure_cause(&ReplayError::ThreadBudgetExhausted { capacity: 2 }),
            DecisionTaskFailedCause::UnhandledFailure
        );
        assert_eq!(
            failure_cause(&ReplayError::WorkflowPanicked {
                thread: "workflow-root".to_string(),
                message: "boom".to_string()
            }),
            DecisionTaskFailedCause::UnhandledFailure
        );
    }

    #[test]
    fn test_sticky_options() {
        let options = HandlerOptions::sticky("sticky", Duration::from_secs(5));
        assert_eq!(options.sticky_task_queue.as_deref(), Some("sticky"));
        assert_eq!(options.max_lease_attempts, 3);
    }
}
