//! Workflow history and decision task types
//!
//! This module contains the input side of the decision protocol:
//! - [`HistoryEvent`] and [`EventAttributes`] for recorded workflow events
//! - [`WorkflowExecutionKey`] identifying one running execution
//! - [`DecisionTask`] as delivered by the orchestration service
//! - [`HistoryBuilder`] for assembling histories in tests and tools

mod builder;
mod event;
mod execution;
mod task;

pub use builder::HistoryBuilder;
pub use event::{EventAttributes, HistoryEvent, TimeoutType};
pub use execution::{WorkflowExecution, WorkflowExecutionKey};
pub use task::{DecisionTask, StickyExecutionAttributes, WorkflowQuery};
