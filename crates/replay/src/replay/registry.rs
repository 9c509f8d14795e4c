//! Workflow registry for type-erased workflow creation
//!
//! The registry maps workflow type names to constructors so the decision
//! task handler can build a decider for any registered workflow without
//! knowing its concrete type.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::workflow::{Workflow, WorkflowContext, WorkflowError};

/// Root future of a running workflow
pub type WorkflowFuture = BoxFuture<'static, Result<Value, WorkflowError>>;

/// Type-erased workflow implementation
///
/// All inputs and outputs are JSON.
pub trait ReplayWorkflow: Send {
    /// Get the workflow type identifier
    fn workflow_type(&self) -> &str;

    /// Decode the start input and create the root future
    ///
    /// The returned future is not polled until the first decision task.
    fn start(self: Box<Self>, ctx: WorkflowContext, input: Value) -> Result<WorkflowFuture, RegistryError>;
}

/// Creates workflow implementations by type name
pub trait ReplayWorkflowFactory: Send + Sync {
    fn get_workflow(&self, workflow_type: &str) -> Result<Box<dyn ReplayWorkflow>, RegistryError>;
}

/// Wrapper to implement ReplayWorkflow for any Workflow
struct TypedWorkflow<W: Workflow> {
    _marker: PhantomData<fn() -> W>,
}

impl<W: Workflow> ReplayWorkflow for TypedWorkflow<W> {
    fn workflow_type(&self) -> &str {
        W::TYPE
    }

    fn start(self: Box<Self>, ctx: WorkflowContext, input: Value) -> Result<WorkflowFuture, RegistryError> {
        let input: W::Input =
            serde_json::from_value(input).map_err(|source| RegistryError::Deserialization {
                workflow_type: W::TYPE.to_string(),
                source,
            })?;

        Ok(Box::pin(async move {
            let output = W::execute(ctx, input).await?;
            serde_json::to_value(output)
                .map_err(|e| WorkflowError::new(format!("failed to encode workflow result: {}", e)))
        }))
    }
}

type WorkflowFn = Arc<dyn Fn(WorkflowContext, Value) -> WorkflowFuture + Send + Sync>;

/// Workflow defined by a closure over raw JSON input
struct FnWorkflow {
    workflow_type: String,
    body: WorkflowFn,
}

impl ReplayWorkflow for FnWorkflow {
    fn workflow_type(&self) -> &str {
        &self.workflow_type
    }

    fn start(self: Box<Self>, ctx: WorkflowContext, input: Value) -> Result<WorkflowFuture, RegistryError> {
        Ok((self.body)(ctx, input))
    }
}

type WorkflowConstructor = Arc<dyn Fn() -> Box<dyn ReplayWorkflow> + Send + Sync>;

/// Registry of workflow constructors
#[derive(Clone, Default)]
pub struct WorkflowRegistry {
    constructors: HashMap<String, WorkflowConstructor>,
}

impl WorkflowRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow type
    ///
    /// # Example
    ///
    /// ```ignore
    /// let mut registry = WorkflowRegistry::new();
    /// registry.register::<GreetingWorkflow>();
    /// ```
    pub fn register<W: Workflow>(&mut self) {
        let constructor: WorkflowConstructor = Arc::new(|| {
            Box::new(TypedWorkflow::<W> {
                _marker: PhantomData,
            }) as Box<dyn ReplayWorkflow>
        });
        self.constructors.insert(W::TYPE.to_string(), constructor);
    }

    /// Register a workflow implemented as a closure over JSON input
    pub fn register_fn<F, Fut>(&mut self, workflow_type: impl Into<String>, body: F)
    where
        F: Fn(WorkflowContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, WorkflowError>> + Send + 'static,
    {
        let workflow_type = workflow_type.into();
        let body: WorkflowFn = Arc::new(move |ctx: WorkflowContext, input: Value| -> WorkflowFuture {
            Box::pin(body(ctx, input))
        });
        let name = workflow_type.clone();
        let constructor: WorkflowConstructor = Arc::new(move || {
            Box::new(FnWorkflow {
                workflow_type: name.clone(),
                body: body.clone(),
            }) as Box<dyn ReplayWorkflow>
        });
        self.constructors.insert(workflow_type, constructor);
    }

    /// Check if a workflow type is registered
    pub fn contains(&self, workflow_type: &str) -> bool {
        self.constructors.contains_key(workflow_type)
    }

    /// Get the number of registered workflow types
    pub fn len(&self) -> usize {
        self.constructors.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.constructors.is_empty()
    }

    /// Get all registered workflow type names
    pub fn workflow_types(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(|s| s.as_str())
    }
}

impl ReplayWorkflowFactory for WorkflowRegistry {
    fn get_workflow(&self, workflow_type: &str) -> Result<Box<dyn ReplayWorkflow>, RegistryError> {
        let constructor = self
            .constructors
            .get(workflow_type)
            .ok_or_else(|| RegistryError::UnknownWorkflowType(workflow_type.to_string()))?;
        Ok(constructor())
    }
}

impl fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field("workflow_types", &self.constructors.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Errors raised while building a decider
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Workflow type not registered
    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    /// Start input could not be decoded into the workflow's input type
    #[error("invalid input for workflow {workflow_type}: {source}")]
    Deserialization {
        workflow_type: String,
        #[source]
        source: serde_json::Error,
    },

    /// A full history must begin with the workflow start event
    #[error("history does not begin with a workflow start event (found {found})")]
    MissingStartEvent { found: String },
}
