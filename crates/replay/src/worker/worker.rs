//! Decision worker: poll loops for one task queue and its sticky queue

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{watch, Semaphore};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::factory::{FactoryError, FactoryState};
use super::options::WorkerOptions;
use super::poller::TaskPoller;
use crate::activity::{ActivityError, LocalActivityRegistry};
use crate::cache::DeciderCache;
use crate::handler::{
    DecisionTaskFailedCause, HandlerOptions, HandlerResult, ReplayDecisionTaskHandler, TaskFailed,
};
use crate::metrics::MetricsSink;
use crate::replay::{ThreadBudget, WorkflowRegistry};
use crate::service::DecisionTaskSource;
use crate::workflow::{Workflow, WorkflowContext, WorkflowError};

/// Everything a worker borrows from its factory when it starts
pub(crate) struct WorkerRuntime {
    pub source: Arc<dyn DecisionTaskSource>,
    pub cache: DeciderCache,
    pub budget: ThreadBudget,
    pub metrics: Arc<dyn MetricsSink>,
    pub domain: String,
    pub identity: String,
    /// Factory-wide sticky queue; `None` when sticky execution is disabled
    pub sticky_task_queue: Option<String>,
    pub sticky_schedule_to_start_timeout: std::time::Duration,
    pub shutdown_rx: watch::Receiver<bool>,
    pub tracker: TaskTracker,
}

#[derive(Default)]
struct Registrations {
    workflows: WorkflowRegistry,
    local_activities: LocalActivityRegistry,
    started: bool,
    sticky_task_queue: Option<String>,
}

/// Handle to a worker created by a [`WorkerFactory`](super::WorkerFactory)
///
/// Workflows and local activities are registered before the factory starts.
/// Cloning yields another handle to the same worker.
#[derive(Clone)]
pub struct Worker {
    task_queue: Arc<str>,
    options: WorkerOptions,
    registrations: Arc<Mutex<Registrations>>,
}

impl Worker {
    pub(crate) fn new(task_queue: impl Into<String>, options: WorkerOptions) -> Self {
        Self {
            task_queue: Arc::from(task_queue.into()),
            options,
            registrations: Arc::new(Mutex::new(Registrations::default())),
        }
    }

    /// Task queue this worker polls
    pub fn task_queue(&self) -> &str {
        &self.task_queue
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    /// Factory sticky queue this worker polls; `None` before start or when disabled
    pub fn sticky_task_queue(&self) -> Option<String> {
        self.registrations.lock().sticky_task_queue.clone()
    }

    pub fn is_started(&self) -> bool {
        self.registrations.lock().started
    }

    /// Register a typed workflow
    pub fn register_workflow<W: Workflow>(&self) -> Result<(), FactoryError> {
        let mut registrations = self.open_registrations("register_workflow")?;
        registrations.workflows.register::<W>();
        Ok(())
    }

    /// Register a workflow implemented by a closure over raw JSON input
    pub fn register_workflow_fn<F, Fut>(
        &self,
        workflow_type: impl Into<String>,
        body: F,
    ) -> Result<(), FactoryError>
    where
        F: Fn(WorkflowContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, WorkflowError>> + Send + 'static,
    {
        let mut registrations = self.open_registrations("register_workflow_fn")?;
        registrations.workflows.register_fn(workflow_type, body);
        Ok(())
    }

    /// Register a local activity
    pub fn register_local_activity<F>(
        &self,
        activity_type: impl Into<String>,
        activity: F,
    ) -> Result<(), FactoryError>
    where
        F: Fn(Value) -> Result<Value, ActivityError> + Send + Sync + 'static,
    {
        let mut registrations = self.open_registrations("register_local_activity")?;
        registrations.local_activities.register(activity_type, activity);
        Ok(())
    }

    /// Registered workflow types
    pub fn workflow_types(&self) -> Vec<String> {
        self.registrations
            .lock()
            .workflows
            .workflow_types()
            .map(str::to_string)
            .collect()
    }

    fn open_registrations(
        &self,
        operation: &'static str,
    ) -> Result<parking_lot::MutexGuard<'_, Registrations>, FactoryError> {
        let registrations = self.registrations.lock();
        if registrations.started {
            return Err(FactoryError::IllegalState {
                operation,
                state: FactoryState::Started,
            });
        }
        Ok(registrations)
    }

    /// Freeze registrations and spawn the poll loops
    pub(crate) fn start(&self, runtime: WorkerRuntime) {
        let (workflows, local_activities, sticky_task_queue) = {
            let mut registrations = self.registrations.lock();
            if registrations.started {
                return;
            }
            registrations.started = true;
            registrations.sticky_task_queue = runtime.sticky_task_queue.clone();
            (
                registrations.workflows.clone(),
                registrations.local_activities.clone(),
                registrations.sticky_task_queue.clone(),
            )
        };

        let handler_options = HandlerOptions {
            sticky_task_queue: sticky_task_queue.clone(),
            sticky_schedule_to_start_timeout: runtime.sticky_schedule_to_start_timeout,
            ..HandlerOptions::default()
        };
        let handler = Arc::new(
            ReplayDecisionTaskHandler::new(
                runtime.domain.clone(),
                Arc::new(workflows),
                runtime.cache.clone(),
                handler_options,
            )
            .with_thread_budget(runtime.budget.clone())
            .with_local_activities(Arc::new(local_activities))
            .with_metrics(runtime.metrics.clone()),
        );

        info!(
            task_queue = %self.task_queue,
            sticky_task_queue = ?sticky_task_queue,
            identity = %runtime.identity,
            max_concurrent = self.options.max_concurrent_decision_tasks,
            "starting decision worker"
        );

        let permits = Arc::new(Semaphore::new(self.options.max_concurrent_decision_tasks));
        let queues = std::iter::once(self.task_queue.to_string()).chain(sticky_task_queue);
        for queue in queues {
            let poller = TaskPoller::new(
                runtime.source.clone(),
                queue,
                runtime.identity.clone(),
                self.options.poller.clone(),
                runtime.shutdown_rx.clone(),
            );
            let poll_loop = PollLoop {
                poller,
                source: runtime.source.clone(),
                handler: handler.clone(),
                permits: permits.clone(),
                shutdown_rx: runtime.shutdown_rx.clone(),
                tracker: runtime.tracker.clone(),
            };
            runtime.tracker.spawn(poll_loop.run());
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("task_queue", &self.task_queue)
            .field("options", &self.options)
            .field("started", &self.is_started())
            .finish()
    }
}

struct PollLoop {
    poller: TaskPoller,
    source: Arc<dyn DecisionTaskSource>,
    handler: Arc<ReplayDecisionTaskHandler>,
    permits: Arc<Semaphore>,
    shutdown_rx: watch::Receiver<bool>,
    tracker: TaskTracker,
}

impl PollLoop {
    async fn run(mut self) {
        loop {
            if self.poller.is_shutdown() {
                break;
            }

            let permit = tokio::select! {
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = self.shutdown_rx.changed() => break,
            };

            match self.poller.poll().await {
                Ok(Some(task)) => {
                    let source = self.source.clone();
                    let handler = self.handler.clone();
                    self.tracker.spawn(async move {
                        let task_token = task.task_token.clone();
                        let result = match handler.handle(task).await {
                            Ok(result) => result,
                            Err(e) => {
                                error!(error = %e, "decision task handler failed");
                                HandlerResult::Failed(TaskFailed {
                                    task_token,
                                    cause: DecisionTaskFailedCause::UnhandledFailure,
                                    details: e.to_string(),
                                })
                            }
                        };
                        if let Err(e) = source.respond(result).await {
                            error!(error = %e, "failed to respond to decision task");
                        }
                        drop(permit);
                    });
                    continue;
                }
                Ok(None) => drop(permit),
                Err(e) => {
                    drop(permit);
                    warn!(task_queue = %self.poller.task_queue(), error = %e, "poll failed");
                }
            }

            if self.poller.wait().await {
                break;
            }
        }

        debug!(task_queue = %self.poller.task_queue(), "poll loop exited");
    }
}
