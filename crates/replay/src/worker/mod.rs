//! Decision workers and their factory
//!
//! This module provides:
//! - [`WorkerFactory`] - owns the decider cache and the worker lifecycle
//! - [`Worker`] - workflow registrations and poll loops for one task queue
//! - [`TaskPoller`] - task polling with exponential backoff
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     WorkerFactory                         │
//! │   DeciderCache (shared)        ThreadBudget (shared)      │
//! │   sticky queue "{identity}:{uuid}" (shared)               │
//! │                                                           │
//! │  ┌────────────────────────┐  ┌────────────────────────┐   │
//! │  │ Worker "orders"        │  │ Worker "billing"       │   │
//! │  │  poll: orders          │  │  poll: billing         │   │
//! │  │  poll: sticky queue    │  │  poll: sticky queue    │   │
//! │  │        │               │  │        │               │   │
//! │  │        ▼               │  │        ▼               │   │
//! │  │  ReplayDecisionTask-   │  │  ReplayDecisionTask-   │   │
//! │  │  Handler (semaphore)   │  │  Handler (semaphore)   │   │
//! │  └────────────────────────┘  └────────────────────────┘   │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use durable_replay::service::InMemoryDecisionTaskSource;
//! use durable_replay::worker::{WorkerFactory, WorkerFactoryOptions, WorkerOptions};
//! use durable_replay::WorkflowError;
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let source = Arc::new(InMemoryDecisionTaskSource::new());
//! let factory = WorkerFactory::new(source, WorkerFactoryOptions::from_env());
//!
//! let worker = factory.new_worker("orders", WorkerOptions::from_env())?;
//! worker.register_workflow_fn("echo", |_ctx, input| async move {
//!     Ok::<_, WorkflowError>(json!({ "echo": input }))
//! })?;
//!
//! factory.start().await?;
//! // ...
//! factory.shutdown();
//! factory.await_termination(Duration::from_secs(30)).await;
//! # Ok(())
//! # }
//! ```

mod factory;
mod options;
mod poller;
#[allow(clippy::module_inception)]
mod worker;

pub use factory::{FactoryError, FactoryState, WorkerFactory};
pub use options::{WorkerFactoryOptions, WorkerOptions};
pub use poller::{PollerConfig, TaskPoller};
pub use worker::Worker;
