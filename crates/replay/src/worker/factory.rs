//! Worker factory: owns the decider cache and drives worker lifecycle

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::task::TaskTracker;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::options::{WorkerFactoryOptions, WorkerOptions};
use super::worker::{Worker, WorkerRuntime};
use crate::cache::DeciderCache;
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::replay::ThreadBudget;
use crate::service::DecisionTaskSource;

/// Lifecycle state of a [`WorkerFactory`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactoryState {
    /// Workers may be created and configured
    Created,
    /// Poll loops are running
    Started,
    /// Shutdown requested; terminal
    ShutDown,
}

impl fmt::Display for FactoryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Started => write!(f, "started"),
            Self::ShutDown => write!(f, "shut down"),
        }
    }
}

/// Worker factory errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FactoryError {
    /// Operation not allowed in the current lifecycle state
    #[error("{operation} is not allowed when the factory is {state}")]
    IllegalState {
        operation: &'static str,
        state: FactoryState,
    },
}

/// Creates workers that share one decider cache, thread budget and sticky queue
///
/// # Lifecycle
///
/// ```text
/// Created ──start()──▶ Started ──shutdown()──▶ ShutDown
///    └──────────────shutdown()──────────────────▲
/// ```
///
/// Workers are created and registered while `Created`. `shutdown` stops every
/// poll loop and lets in-flight decision tasks finish; `await_termination`
/// waits for them and then empties the cache.
pub struct WorkerFactory {
    source: Arc<dyn DecisionTaskSource>,
    options: WorkerFactoryOptions,
    sticky_task_queue: Option<String>,
    cache: DeciderCache,
    budget: ThreadBudget,
    metrics: Arc<dyn MetricsSink>,
    state: Mutex<FactoryState>,
    workers: Mutex<Vec<Worker>>,
    shutdown_tx: watch::Sender<bool>,
    tracker: TaskTracker,
}

impl WorkerFactory {
    pub fn new(source: Arc<dyn DecisionTaskSource>, options: WorkerFactoryOptions) -> Self {
        Self::with_metrics(source, options, Arc::new(NoopMetrics))
    }

    /// Create a factory that reports to `metrics`
    pub fn with_metrics(
        source: Arc<dyn DecisionTaskSource>,
        options: WorkerFactoryOptions,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let cache = DeciderCache::new(
            options.decider_cache_size,
            options.eviction_policy,
            metrics.clone(),
        );
        let budget = ThreadBudget::new(options.max_workflow_thread_count);
        let (shutdown_tx, _) = watch::channel(false);
        let sticky_task_queue = (!options.disable_sticky_execution)
            .then(|| format!("{}:{}", options.identity, Uuid::new_v4()));

        Self {
            source,
            options,
            sticky_task_queue,
            cache,
            budget,
            metrics,
            state: Mutex::new(FactoryState::Created),
            workers: Mutex::new(Vec::new()),
            shutdown_tx,
            tracker: TaskTracker::new(),
        }
    }

    /// Create a worker for `task_queue`
    pub fn new_worker(
        &self,
        task_queue: impl Into<String>,
        options: WorkerOptions,
    ) -> Result<Worker, FactoryError> {
        let state = self.state.lock();
        if *state != FactoryState::Created {
            return Err(FactoryError::IllegalState {
                operation: "new_worker",
                state: *state,
            });
        }

        let worker = Worker::new(task_queue, options);
        self.workers.lock().push(worker.clone());
        Ok(worker)
    }

    /// Start every worker; a no-op if already started
    #[instrument(skip(self), fields(identity = %self.options.identity))]
    pub async fn start(&self) -> Result<(), FactoryError> {
        let workers = {
            let mut state = self.state.lock();
            match *state {
                FactoryState::Started => return Ok(()),
                FactoryState::ShutDown => {
                    return Err(FactoryError::IllegalState {
                        operation: "start",
                        state: FactoryState::ShutDown,
                    })
                }
                FactoryState::Created => *state = FactoryState::Started,
            }
            self.workers.lock().clone()
        };

        info!(
            workers = workers.len(),
            cache_size = self.options.decider_cache_size,
            thread_budget = self.options.max_workflow_thread_count,
            sticky_task_queue = ?self.sticky_task_queue,
            "starting worker factory"
        );

        for worker in &workers {
            worker.start(WorkerRuntime {
                source: self.source.clone(),
                cache: self.cache.clone(),
                budget: self.budget.clone(),
                metrics: self.metrics.clone(),
                domain: self.options.domain.clone(),
                identity: self.options.identity.clone(),
                sticky_task_queue: self.sticky_task_queue.clone(),
                sticky_schedule_to_start_timeout: self.options.sticky_schedule_to_start_timeout,
                shutdown_rx: self.shutdown_tx.subscribe(),
                tracker: self.tracker.clone(),
            });
        }

        Ok(())
    }

    /// Stop polling; in-flight decision tasks keep running
    pub fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            if *state == FactoryState::ShutDown {
                return;
            }
            *state = FactoryState::ShutDown;
        }

        info!(identity = %self.options.identity, "shutting down worker factory");
        self.shutdown_tx.send_replace(true);
        self.tracker.close();
    }

    /// Wait until every poll loop and in-flight task finished
    ///
    /// Returns false if `timeout` elapsed first. The decider cache is emptied
    /// once everything drained.
    pub async fn await_termination(&self, timeout: Duration) -> bool {
        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_err() {
            warn!(
                in_flight = self.tracker.len(),
                "worker factory did not terminate in time"
            );
            return false;
        }

        self.cache.invalidate_all();
        true
    }

    pub fn state(&self) -> FactoryState {
        *self.state.lock()
    }

    pub fn is_started(&self) -> bool {
        self.state() == FactoryState::Started
    }

    pub fn is_shutdown(&self) -> bool {
        self.state() == FactoryState::ShutDown
    }

    /// Cache shared by all workers of this factory
    pub fn cache(&self) -> &DeciderCache {
        &self.cache
    }

    pub fn thread_budget(&self) -> &ThreadBudget {
        &self.budget
    }

    pub fn options(&self) -> &WorkerFactoryOptions {
        &self.options
    }

    /// Sticky queue polled by every worker, `"{identity}:{uuid}"`
    ///
    /// `None` when sticky execution is disabled.
    pub fn sticky_task_queue(&self) -> Option<&str> {
        self.sticky_task_queue.as_deref()
    }

    pub fn workers(&self) -> Vec<Worker> {
        self.workers.lock().clone()
    }
}

impl Drop for WorkerFactory {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

impl fmt::Debug for WorkerFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerFactory")
            .field("state", &self.state())
            .field("options", &self.options)
            .field("cache", &self.cache)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::InMemoryDecisionTaskSource;

    fn factory() -> WorkerFactory {
        WorkerFactory::new(
            Arc::new(InMemoryDecisionTaskSource::new()),
            WorkerFactoryOptions::new().with_identity("test"),
        )
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let factory = factory();
        assert_eq!(factory.state(), FactoryState::Created);

        factory.new_worker("orders", WorkerOptions::default()).unwrap();
        factory.start().await.unwrap();
        assert!(factory.is_started());
        factory.start().await.unwrap();

        factory.shutdown();
        factory.shutdown();
        assert!(factory.is_shutdown());
        assert!(factory.await_termination(Duration::from_secs(5)).await);
        assert!(factory.await_termination(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_new_worker_after_start_is_rejected() {
        let factory = factory();
        factory.start().await.unwrap();

        let err = factory
            .new_worker("orders", WorkerOptions::default())
            .unwrap_err();
        assert_eq!(
            err,
            FactoryError::IllegalState {
                operation: "new_worker",
                state: FactoryState::Started
            }
        );
    }

    #[tokio::test]
    async fn test_start_after_shutdown_is_rejected() {
        let factory = factory();
        factory.shutdown();

        assert!(factory.start().await.is_err());
        assert!(factory.new_worker("orders", WorkerOptions::default()).is_err());
        assert!(factory.await_termination(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_await_termination_before_shutdown_times_out() {
        let factory = factory();
        factory.start().await.unwrap();
        assert!(!factory.await_termination(Duration::from_millis(20)).await);
        factory.shutdown();
        assert!(factory.await_termination(Duration::from_secs(5)).await);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(FactoryState::ShutDown.to_string(), "shut down");
        let err = FactoryError::IllegalState {
            operation: "start",
            state: FactoryState::ShutDown,
        };
        assert_eq!(err.to_string(), "start is not allowed when the factory is shut down");
    }
}
