//! Deterministic replay engine
//!
//! - [`ReplayDecider`] applies history windows to one workflow execution
//! - [`DeterministicRunner`] schedules its logical threads cooperatively
//! - [`WorkflowRegistry`] builds workflow implementations by type name
//! - [`ThreadBudget`] and [`SelfEviction`] bound the number of live threads

mod decider;
mod error;
mod registry;
mod scheduler;
pub(crate) mod state;

pub use decider::{ReplayDecider, ROOT_THREAD, UNKNOWN_QUERY};
pub use error::ReplayError;
pub use registry::{
    RegistryError, ReplayWorkflow, ReplayWorkflowFactory, WorkflowFuture, WorkflowRegistry,
};
pub use scheduler::{
    BlockReason, DeterministicRunner, NoEviction, SelfEviction, ThreadBudget, ThreadState,
};
pub use state::{QueryHandler, WorkflowOutcome};
