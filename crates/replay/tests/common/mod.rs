//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use durable_replay::history::{StickyExecutionAttributes, WorkflowExecution, WorkflowQuery};
use durable_replay::prelude::*;
use serde_json::{json, Value};

pub const DOMAIN: &str = "test-domain";
pub const STICKY_QUEUE: &str = "sticky";

/// Schedules `compose_greeting`, then completes with its result
pub async fn greeting(ctx: WorkflowContext, input: Value) -> Result<Value, WorkflowError> {
    ctx.register_query("phase", |_| Ok(json!("waiting for greeting")));
    let greeting = ctx
        .schedule_activity("compose_greeting", input, ActivityOptions::default())
        .await?;
    Ok(json!({ "greeting": greeting }))
}

/// Sleeps for a minute, then completes with the decision time
pub async fn sleeper(ctx: WorkflowContext, _input: Value) -> Result<Value, WorkflowError> {
    ctx.sleep(Duration::from_secs(60)).await?;
    Ok(json!(ctx.now().to_rfc3339()))
}

/// Draws a number once and reports it through the `number` query
pub async fn lucky_number(ctx: WorkflowContext, _input: Value) -> Result<Value, WorkflowError> {
    let number: u64 = ctx.side_effect(|| 99)?;
    ctx.register_query("number", move |_| Ok(json!(number)));
    ctx.sleep(Duration::from_secs(60)).await?;
    Ok(json!(number))
}

pub fn registry() -> WorkflowRegistry {
    let mut registry = WorkflowRegistry::new();
    registry.register_fn("greeting", greeting);
    registry.register_fn("sleeper", sleeper);
    registry.register_fn("lucky_number", lucky_number);
    registry
}

pub fn non_sticky_handler(cache: DeciderCache) -> ReplayDecisionTaskHandler {
    ReplayDecisionTaskHandler::new(DOMAIN, Arc::new(registry()), cache, HandlerOptions::default())
}

pub fn sticky_handler(cache: DeciderCache) -> ReplayDecisionTaskHandler {
    ReplayDecisionTaskHandler::new(
        DOMAIN,
        Arc::new(registry()),
        cache,
        HandlerOptions::sticky(STICKY_QUEUE, Duration::from_secs(5)),
    )
}

pub fn execution(workflow_id: &str) -> WorkflowExecution {
    WorkflowExecution::new(workflow_id, format!("{}-run", workflow_id))
}

pub fn key(workflow_id: &str) -> WorkflowExecutionKey {
    WorkflowExecutionKey::new(DOMAIN, &execution(workflow_id))
}

/// Decision task for `workflow_id` carrying `history`
pub fn task(workflow_id: &str, workflow_type: &str, history: Vec<HistoryEvent>) -> DecisionTask {
    DecisionTask {
        task_token: format!("token-{}", workflow_id).into_bytes(),
        workflow_execution: execution(workflow_id),
        workflow_type: workflow_type.to_string(),
        history,
        sticky_attributes: None,
        query: None,
    }
}

/// Same as [`task`], routed to `sticky_queue`
pub fn sticky_task(
    workflow_id: &str,
    workflow_type: &str,
    history: Vec<HistoryEvent>,
    sticky_queue: &str,
) -> DecisionTask {
    DecisionTask {
        sticky_attributes: Some(StickyExecutionAttributes::new(
            sticky_queue,
            Duration::from_secs(5),
        )),
        ..task(workflow_id, workflow_type, history)
    }
}

pub fn query_task(
    workflow_id: &str,
    workflow_type: &str,
    history: Vec<HistoryEvent>,
    query_type: &str,
) -> DecisionTask {
    DecisionTask {
        query: Some(WorkflowQuery {
            query_type: query_type.to_string(),
            args: Value::Null,
        }),
        ..task(workflow_id, workflow_type, history)
    }
}

/// First decision task of a `greeting` execution
pub fn greeting_started() -> HistoryBuilder {
    let mut history = HistoryBuilder::new("greeting");
    history.workflow_started(json!("world")).decision_task();
    history
}

/// `greeting` history after its activity completed
///
/// Returns the builder and the id of the first event the sticky worker has
/// not seen yet.
pub fn greeting_activity_done() -> (HistoryBuilder, i64) {
    let mut history = greeting_started();
    let next = history.last_event_id() + 1;
    history
        .decision_completed()
        .activity_scheduled("activity-1", "compose_greeting", json!("world"))
        .activity_completed("activity-1", json!("hello world"))
        .decision_task();
    (history, next)
}
