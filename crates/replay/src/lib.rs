//! # Sticky Decision-Replay Engine
//!
//! Client-side execution engine for durable workflows. Workflow code is
//! ordinary async Rust; the engine replays recorded history against it and
//! turns whatever it does next into decisions for the orchestration service.
//!
//! ## Features
//!
//! - **Deterministic replay**: cooperative logical threads, history matching and non-determinism detection
//! - **Sticky execution**: a bounded LRU cache keeps live deciders between decision tasks
//! - **Self-eviction**: a process-wide thread budget evicts idle executions instead of stalling
//! - **Graceful lifecycle**: worker factory with drain-on-shutdown
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkerFactory                           │
//! │  (poll loops per task queue and sticky queue)               │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ DecisionTask
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 ReplayDecisionTaskHandler                    │
//! │  (full replay on a fresh decider, or resume a cached one)   │
//! └─────────────────────────────────────────────────────────────┘
//!               │                                │
//!               ▼                                ▼
//! ┌──────────────────────────┐    ┌─────────────────────────────┐
//! │       DeciderCache       │───▶│        ReplayDecider        │
//! │  (LRU, per-key leases)   │    │  (DeterministicRunner)      │
//! └──────────────────────────┘    └─────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use durable_replay::prelude::*;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! async fn greeting(ctx: WorkflowContext, input: serde_json::Value) -> Result<serde_json::Value, WorkflowError> {
//!     let greeting = ctx
//!         .schedule_activity("compose_greeting", input, ActivityOptions::default())
//!         .await?;
//!     Ok(greeting)
//! }
//!
//! # tokio_test::block_on(async {
//! let mut registry = WorkflowRegistry::new();
//! registry.register_fn("greeting", greeting);
//!
//! let handler = ReplayDecisionTaskHandler::new(
//!     "default",
//!     Arc::new(registry),
//!     DeciderCache::with_capacity(10),
//!     HandlerOptions::default(),
//! );
//!
//! let mut history = HistoryBuilder::new("greeting");
//! history.workflow_started(json!("world")).decision_task();
//!
//! let task = DecisionTask {
//!     task_token: b"token".to_vec(),
//!     workflow_execution: WorkflowExecution::new("wf-1", "run-1"),
//!     workflow_type: "greeting".to_string(),
//!     history: history.build(),
//!     sticky_attributes: None,
//!     query: None,
//! };
//!
//! let result = handler.handle(task).await.unwrap();
//! let completed = result.task_completed().unwrap();
//! assert_eq!(completed.decisions.len(), 1);
//! assert!(completed.sticky_attributes.is_none());
//! # });
//! ```

pub mod activity;
pub mod cache;
pub mod handler;
pub mod history;
pub mod metrics;
pub mod reliability;
pub mod replay;
pub mod service;
pub mod worker;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::activity::{ActivityError, LocalActivityOptions};
    pub use crate::cache::{CacheError, DeciderCache, EvictionPolicy};
    pub use crate::handler::{
        DecisionTaskFailedCause, HandlerError, HandlerOptions, HandlerResult,
        ReplayDecisionTaskHandler,
    };
    pub use crate::history::{
        DecisionTask, HistoryBuilder, HistoryEvent, StickyExecutionAttributes, WorkflowExecution,
        WorkflowExecutionKey,
    };
    pub use crate::reliability::RetryPolicy;
    pub use crate::replay::{ReplayDecider, ReplayError, WorkflowRegistry};
    pub use crate::service::{DecisionTaskSource, InMemoryDecisionTaskSource};
    pub use crate::worker::{WorkerFactory, WorkerFactoryOptions, WorkerOptions};
    pub use crate::workflow::{ActivityOptions, Decision, Workflow, WorkflowContext, WorkflowError};
}

// Re-export key types at crate root
pub use activity::{ActivityError, LocalActivityOptions};
pub use cache::{CacheError, DeciderCache, EvictionPolicy};
pub use handler::{HandlerError, HandlerResult, ReplayDecisionTaskHandler};
pub use history::{DecisionTask, HistoryEvent, WorkflowExecutionKey};
pub use reliability::RetryPolicy;
pub use replay::{ReplayDecider, ReplayError, WorkflowRegistry};
pub use worker::{FactoryError, WorkerFactory, WorkerFactoryOptions};
pub use workflow::{ActivityOptions, Decision, Workflow, WorkflowContext, WorkflowError};
