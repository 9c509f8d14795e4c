//! Decision task polling with exponential backoff

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, instrument, trace};

use crate::history::DecisionTask;
use crate::reliability::duration_millis;
use crate::service::{DecisionTaskSource, SourceError};

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Interval after a poll that returned a task
    #[serde(with = "duration_millis")]
    pub min_interval: Duration,

    /// Interval cap while the queue stays empty
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier when no task was found
    pub backoff_multiplier: f64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            backoff_multiplier: 1.5,
        }
    }
}

impl PollerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set backoff multiplier (never below 1.0)
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }
}

/// Polls one task queue with adaptive backoff
///
/// Backs off exponentially while the queue is empty and resets to the
/// minimum interval once a task is found.
pub struct TaskPoller {
    source: Arc<dyn DecisionTaskSource>,
    task_queue: String,
    identity: String,
    config: PollerConfig,
    current_interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl TaskPoller {
    pub fn new(
        source: Arc<dyn DecisionTaskSource>,
        task_queue: impl Into<String>,
        identity: impl Into<String>,
        config: PollerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            source,
            task_queue: task_queue.into(),
            identity: identity.into(),
            current_interval: config.min_interval,
            config,
            shutdown_rx,
        }
    }

    /// Poll for one task and update the backoff state
    #[instrument(skip(self), fields(task_queue = %self.task_queue))]
    pub async fn poll(&mut self) -> Result<Option<DecisionTask>, SourceError> {
        if self.is_shutdown() {
            debug!("poller shutdown requested");
            return Ok(None);
        }

        let task = self
            .source
            .poll_decision_task(&self.task_queue, &self.identity)
            .await?;

        match &task {
            Some(task) => {
                self.reset_backoff();
                debug!(workflow_id = %task.workflow_execution.workflow_id, "polled decision task");
            }
            None => {
                self.increase_backoff();
                trace!(
                    interval_ms = self.current_interval.as_millis() as u64,
                    "no decision task, backing off"
                );
            }
        }

        Ok(task)
    }

    /// Wait for the current backoff interval
    ///
    /// Returns true if shutdown was signaled during the wait.
    pub async fn wait(&mut self) -> bool {
        if self.is_shutdown() {
            return true;
        }
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(self.current_interval) => false,
            _ = shutdown_rx.changed() => {
                debug!("shutdown signal received during wait");
                true
            }
        }
    }

    pub fn task_queue(&self) -> &str {
        &self.task_queue
    }

    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    fn reset_backoff(&mut self) {
        self.current_interval = self.config.min_interval;
    }

    fn increase_backoff(&mut self) {
        let next = Duration::from_secs_f64(
            self.current_interval.as_secs_f64() * self.config.backoff_multiplier,
        );
        self.current_interval = next.min(self.config.max_interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{HistoryBuilder, WorkflowExecution};
    use crate::service::InMemoryDecisionTaskSource;

    fn task() -> DecisionTask {
        let mut builder = HistoryBuilder::new("greeting");
        builder.workflow_started(serde_json::json!(null)).decision_task();
        DecisionTask {
            task_token: b"token".to_vec(),
            workflow_execution: WorkflowExecution::new("wf", "run"),
            workflow_type: "greeting".to_string(),
            history: builder.build(),
            sticky_attributes: None,
            query: None,
        }
    }

    #[test]
    fn test_config_builder() {
        let config = PollerConfig::new()
            .with_min_interval(Duration::from_millis(50))
            .with_max_interval(Duration::from_secs(10))
            .with_backoff_multiplier(0.5);

        assert_eq!(config.min_interval, Duration::from_millis(50));
        assert_eq!(config.max_interval, Duration::from_secs(10));
        assert_eq!(config.backoff_multiplier, 1.0);
    }

    #[tokio::test]
    async fn test_backoff_and_reset() {
        let source = Arc::new(InMemoryDecisionTaskSource::new());
        let (_tx, rx) = watch::channel(false);
        let config = PollerConfig::new()
            .with_min_interval(Duration::from_millis(100))
            .with_max_interval(Duration::from_millis(200))
            .with_backoff_multiplier(2.0);
        let mut poller = TaskPoller::new(source.clone(), "orders", "w1", config, rx);

        assert!(poller.poll().await.unwrap().is_none());
        assert_eq!(poller.current_interval(), Duration::from_millis(200));
        assert!(poller.poll().await.unwrap().is_none());
        assert_eq!(poller.current_interval(), Duration::from_millis(200));

        source.push("orders", task());
        assert!(poller.poll().await.unwrap().is_some());
        assert_eq!(poller.current_interval(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_shutdown_stops_polling() {
        let source = Arc::new(InMemoryDecisionTaskSource::new());
        source.push("orders", task());
        let (tx, rx) = watch::channel(false);
        let mut poller = TaskPoller::new(source.clone(), "orders", "w1", PollerConfig::default(), rx);

        tx.send(true).unwrap();
        assert!(poller.is_shutdown());
        assert!(poller.poll().await.unwrap().is_none());
        assert!(poller.wait().await);
        assert_eq!(source.pending("orders"), 1);
    }
}
