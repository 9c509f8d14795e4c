//! Replay throughput benchmark
//!
//! Compares replaying full history on a fresh decider with resuming a
//! cached decider from the newest events only.

use std::sync::Arc;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::{json, Value};
use tokio::runtime::Runtime;

use durable_replay::history::{StickyExecutionAttributes, WorkflowExecution};
use durable_replay::prelude::*;

async fn steps(ctx: WorkflowContext, input: Value) -> Result<Value, WorkflowError> {
    let count = input.as_u64().unwrap_or(0);
    let mut total = 0;
    for i in 0..count {
        let result = ctx
            .schedule_activity("step", json!(i), ActivityOptions::default())
            .await?;
        total += result.as_u64().unwrap_or(0);
    }
    Ok(json!(total))
}

fn handler(sticky: bool) -> ReplayDecisionTaskHandler {
    let mut registry = WorkflowRegistry::new();
    registry.register_fn("steps", steps);
    let options = if sticky {
        HandlerOptions::sticky("bench-sticky", Duration::from_secs(5))
    } else {
        HandlerOptions::default()
    };
    ReplayDecisionTaskHandler::new("bench", Arc::new(registry), DeciderCache::with_capacity(1_000), options)
}

/// History of a `steps` execution with `completed` finished activities
fn history(total: u64, completed: u64) -> HistoryBuilder {
    let mut history = HistoryBuilder::new("steps");
    history.workflow_started(json!(total)).decision_task();
    for i in 1..=completed {
        let activity_id = format!("activity-{}", i);
        history
            .decision_completed()
            .activity_scheduled(activity_id.clone(), "step", json!(i - 1))
            .activity_completed(activity_id, json!(1))
            .decision_task();
    }
    history
}

fn task(workflow_id: &str, events: Vec<HistoryEvent>, sticky: bool) -> DecisionTask {
    DecisionTask {
        task_token: workflow_id.as_bytes().to_vec(),
        workflow_execution: WorkflowExecution::new(workflow_id, "run"),
        workflow_type: "steps".to_string(),
        history: events,
        sticky_attributes: sticky
            .then(|| StickyExecutionAttributes::new("bench-sticky", Duration::from_secs(5))),
        query: None,
    }
}

/// Full replay cost grows with history length
fn bench_full_replay(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("replay/full_history");

    for completed in [10u64, 100, 500] {
        let events = history(completed + 1, completed).build();
        group.throughput(Throughput::Elements(events.len() as u64));
        group.bench_with_input(BenchmarkId::new("steps", completed), &events, |b, events| {
            let handler = handler(false);
            let handler = &handler;
            b.to_async(&rt).iter(|| async move {
                let result = handler.handle(task("wf", events.clone(), false)).await.unwrap();
                assert!(result.task_completed().is_some());
            });
        });
    }

    group.finish();
}

/// Sticky resume only applies the newest decision task's events
fn bench_sticky_resume(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("replay/sticky_resume");
    group.throughput(Throughput::Elements(1));

    for completed in [10u64, 100, 500] {
        let full = history(completed + 2, completed);
        let mut next = full.clone();
        let first_new = full.last_event_id() + 1;
        next.decision_completed()
            .activity_scheduled(format!("activity-{}", completed + 1), "step", json!(completed))
            .activity_completed(format!("activity-{}", completed + 1), json!(1))
            .decision_task();
        let tail = next.events_from(first_new);
        let prefix = full.build();

        group.bench_with_input(BenchmarkId::new("steps", completed), &completed, |b, _| {
            let handler = handler(true);
            b.to_async(&rt).iter_custom(|iters| {
                let handler = &handler;
                let prefix = prefix.clone();
                let tail = tail.clone();
                async move {
                    let mut elapsed = Duration::ZERO;
                    for i in 0..iters {
                        let workflow_id = format!("wf-{}", i);
                        handler.handle(task(&workflow_id, prefix.clone(), false)).await.unwrap();

                        let start = std::time::Instant::now();
                        let result = handler
                            .handle(task(&workflow_id, tail.clone(), true))
                            .await
                            .unwrap();
                        elapsed += start.elapsed();
                        assert!(result.task_completed().is_some());
                    }
                    elapsed
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_full_replay, bench_sticky_resume);
criterion_main!(benches);
