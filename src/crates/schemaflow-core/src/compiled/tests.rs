use futures::{StreamExt, TryStreamExt};
use schemaflow_checkpoint::{
    CheckpointSaver, CheckpointSource, InMemoryCheckpointSaver, ListOptions, TenantId, ThreadRef,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::builder::StateGraph;
use crate::error::{GraphError, StepError};
use crate::events::RunEvent;
use crate::graph::{END, START};
use crate::retry::RetryPolicy;
use crate::state::{AppendReducer, MergeMapReducer, OverwriteReducer, StateSchema};
use crate::step::StepOutput;
use crate::{CompiledGraph, RunConfig};

const TENANT: &str = "org-1";

fn saver() -> Arc<InMemoryCheckpointSaver> {
    Arc::new(InMemoryCheckpointSaver::new(TENANT).unwrap())
}

fn config(thread: &str) -> RunConfig {
    RunConfig::new(TenantId::new(TENANT).unwrap(), thread)
}

fn schema() -> StateSchema {
    StateSchema::new()
        .channel("log", AppendReducer, json!([]))
        .channel("value", OverwriteReducer, Value::Null)
        .channel("retry_count", MergeMapReducer, json!({}))
}

/// a -> b -> c, each appending its name; `b` fails fatally while `fail_b` is non-zero.
fn linear(calls: Arc<AtomicUsize>, fail_b: Arc<AtomicUsize>) -> StateGraph {
    let mut graph = StateGraph::new(schema());
    for name in ["a", "b", "c"] {
        let calls = calls.clone();
        let fail_b = fail_b.clone();
        graph.add_node(name, move |_, ctx| {
            let calls = calls.clone();
            let fail_b = fail_b.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if ctx.node == "b" && fail_b.load(Ordering::SeqCst) > 0 {
                    fail_b.fetch_sub(1, Ordering::SeqCst);
                    return Err(StepError::fatal("process died"));
                }
                Ok(StepOutput::update(json!({"log": [ctx.node]})))
            }
        });
    }
    graph
        .add_edge(START, "a")
        .add_edge("a", "b")
        .add_edge("b", "c")
        .add_edge("c", END);
    graph
}

async fn thread_history(saver: &InMemoryCheckpointSaver, thread: &str) -> Vec<schemaflow_checkpoint::CheckpointTuple> {
    saver
        .list(&ThreadRef::new(thread), ListOptions::new())
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_invoke_writes_one_checkpoint_per_step() {
    let saver = saver();
    let calls = Arc::new(AtomicUsize::new(0));
    let graph = linear(calls.clone(), Arc::new(AtomicUsize::new(0)))
        .compile()
        .unwrap()
        .with_checkpointer(saver.clone());

    let outcome = graph.invoke(json!({"log": ["input"]}), config("t1")).await.unwrap();

    assert_eq!(outcome.state["log"], json!(["input", "a", "b", "c"]));
    assert_eq!(outcome.steps_executed, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let history = thread_history(&saver, "t1").await;
    assert_eq!(history.len(), 4);
    assert_eq!(history[0].metadata.next.as_deref(), Some(END));
    assert_eq!(history[0].metadata.node.as_deref(), Some("c"));
    assert_eq!(history[3].metadata.source, Some(CheckpointSource::Input));
    assert_eq!(history[3].metadata.step, Some(-1));
    assert_eq!(history[3].metadata.next.as_deref(), Some("a"));
    assert_eq!(
        outcome.checkpoint.unwrap().checkpoint_id,
        Some(history[0].checkpoint.id.clone())
    );
}

#[tokio::test]
async fn test_only_changed_channels_get_new_versions() {
    let saver = saver();
    let graph = linear(Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)))
        .compile()
        .unwrap()
        .with_checkpointer(saver.clone());
    graph.invoke(json!({"value": "kept"}), config("t1")).await.unwrap();

    let history = thread_history(&saver, "t1").await;
    let input = &history[3].checkpoint;
    let last = &history[0].checkpoint;
    assert_eq!(input.channel_versions["value"], last.channel_versions["value"]);
    assert!(last.channel_versions["log"] > input.channel_versions["log"]);
    assert_eq!(last.updated_channels, vec!["log".to_string()]);
    assert_eq!(last.channel_values["value"], json!("kept"));
}

#[tokio::test]
async fn test_resume_after_crash_skips_completed_steps() {
    let saver = saver();
    let calls = Arc::new(AtomicUsize::new(0));
    let fail_b = Arc::new(AtomicUsize::new(1));
    let graph = linear(calls.clone(), fail_b)
        .compile()
        .unwrap()
        .with_checkpointer(saver.clone());

    let error = graph.invoke(json!({}), config("t1")).await.unwrap_err();
    assert!(matches!(error, GraphError::NodeExecution { ref node, attempts: 1, .. } if node == "b"));
    assert!(error.is_resumable());

    let latest = saver.get(&ThreadRef::new("t1")).await.unwrap();
    assert_eq!(latest.metadata.next.as_deref(), Some("b"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let outcome = graph.resume(config("t1")).await.unwrap();
    assert_eq!(outcome.state["log"], json!(["a", "b", "c"]));
    assert_eq!(outcome.steps_executed, 2);
    // a ran once, b twice, c once
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_resume_finished_thread_is_noop() {
    let saver = saver();
    let calls = Arc::new(AtomicUsize::new(0));
    let graph = linear(calls.clone(), Arc::new(AtomicUsize::new(0)))
        .compile()
        .unwrap()
        .with_checkpointer(saver.clone());

    let first = graph.invoke(json!({}), config("t1")).await.unwrap();
    let again = graph.resume(config("t1")).await.unwrap();

    assert_eq!(again.state, first.state);
    assert_eq!(again.steps_executed, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(thread_history(&saver, "t1").await.len(), 4);
}

#[tokio::test]
async fn test_resume_without_checkpoint() {
    let graph = linear(Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)))
        .compile()
        .unwrap()
        .with_checkpointer(saver());

    let error = graph.resume(config("never-ran")).await.unwrap_err();
    assert!(matches!(error, GraphError::NothingToResume { .. }));

    let unsaved = linear(Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)))
        .compile()
        .unwrap();
    assert!(matches!(
        unsaved.resume(config("t1")).await,
        Err(GraphError::Configuration(_))
    ));
}

#[tokio::test]
async fn test_resume_replays_recorded_writes() {
    let saver = saver();
    let calls = Arc::new(AtomicUsize::new(0));
    let graph = linear(calls.clone(), Arc::new(AtomicUsize::new(1)))
        .compile()
        .unwrap()
        .with_checkpointer(saver.clone());
    graph.invoke(json!({}), config("t1")).await.unwrap_err();
    let calls_before = calls.load(Ordering::SeqCst);

    // Simulate a crash between recording b's output and committing its checkpoint.
    let latest = saver.get(&ThreadRef::new("t1")).await.unwrap();
    let step = latest.metadata.step.unwrap() + 1;
    saver
        .put_writes(
            &latest.thread,
            vec![
                ("log".to_string(), json!(["b-recorded"])),
                ("__route__".to_string(), json!(END)),
            ],
            &format!("{step}:b"),
        )
        .await
        .unwrap();

    let outcome = graph.resume(config("t1")).await.unwrap();
    assert_eq!(outcome.state["log"], json!(["a", "b-recorded"]));
    assert_eq!(outcome.steps_executed, 0);
    assert_eq!(calls.load(Ordering::SeqCst), calls_before);

    let latest = saver.get(&ThreadRef::new("t1")).await.unwrap();
    assert_eq!(latest.metadata.node.as_deref(), Some("b"));
    assert_eq!(latest.metadata.next.as_deref(), Some(END));
}

#[tokio::test]
async fn test_fresh_start_on_new_thread() {
    let saver = saver();
    assert!(saver.get(&ThreadRef::new("fresh")).await.is_none());

    let graph = linear(Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)))
        .compile()
        .unwrap()
        .with_checkpointer(saver.clone());
    let outcome = graph.invoke(json!({"value": 1}), config("fresh")).await.unwrap();

    assert_eq!(outcome.state["value"], json!(1));
    assert_eq!(outcome.state["retry_count"], json!({}));
}

#[tokio::test]
async fn test_second_invoke_on_same_thread_chains_parent() {
    let saver = saver();
    let graph = linear(Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)))
        .compile()
        .unwrap()
        .with_checkpointer(saver.clone());

    let first = graph.invoke(json!({"value": "one"}), config("t1")).await.unwrap();
    graph.invoke(json!({"value": "two"}), config("t1")).await.unwrap();

    let history = thread_history(&saver, "t1").await;
    assert_eq!(history.len(), 8);
    let second_input = &history[3];
    assert_eq!(second_input.metadata.source, Some(CheckpointSource::Input));
    assert_eq!(
        second_input.parent.as_ref().and_then(|p| p.checkpoint_id.clone()),
        first.checkpoint.and_then(|t| t.checkpoint_id)
    );
}

/// a -> b; `b` stamps each execution as `b-<n>`.
fn counting_graph(saver: Arc<InMemoryCheckpointSaver>, runs: Arc<AtomicUsize>) -> CompiledGraph {
    let mut graph = StateGraph::new(schema());
    graph
        .add_node("a", |_, _| async { Ok(StepOutput::update(json!({"value": "a"}))) })
        .add_node("b", move |_, _| {
            let n = runs.fetch_add(1, Ordering::SeqCst);
            async move { Ok(StepOutput::update(json!({"value": format!("b-{n}")}))) }
        })
        .add_edge(START, "a")
        .add_edge("a", "b");
    graph.compile().unwrap().with_checkpointer(saver)
}

#[tokio::test]
async fn test_fork_replays_recorded_step_output() {
    let saver = saver();
    let runs = Arc::new(AtomicUsize::new(0));
    let graph = counting_graph(saver.clone(), runs.clone());

    graph.invoke(json!({}), config("t1")).await.unwrap();
    let history = thread_history(&saver, "t1").await;
    let after_a = history
        .iter()
        .find(|t| t.metadata.node.as_deref() == Some("a"))
        .unwrap();
    assert!(after_a.pending_writes.iter().any(|w| w.task_id == "1:b"));

    let forked = graph
        .resume(config("t1").with_checkpoint_id(after_a.checkpoint.id.clone()))
        .await
        .unwrap();

    // b's output was recorded against the fork point, so it is merged, not re-run.
    assert_eq!(forked.state["value"], json!("b-0"));
    assert_eq!(forked.steps_executed, 0);
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let latest = saver.get(&ThreadRef::new("t1")).await.unwrap();
    assert_eq!(latest.metadata.node.as_deref(), Some("b"));
    assert_eq!(
        latest.parent.and_then(|p| p.checkpoint_id),
        Some(after_a.checkpoint.id.clone())
    );
}

#[tokio::test]
async fn test_diverging_branch_never_reuses_blob_versions() {
    let saver = saver();
    let runs = Arc::new(AtomicUsize::new(0));
    let graph = counting_graph(saver.clone(), runs.clone());

    graph.invoke(json!({}), config("t1")).await.unwrap();
    let history = thread_history(&saver, "t1").await;
    let original_end = history[0].clone();
    let after_a = history
        .iter()
        .find(|t| t.metadata.node.as_deref() == Some("a"))
        .unwrap();
    assert_eq!(original_end.checkpoint.channel_values["value"], json!("b-0"));

    // A new checkpoint on top of the older one has no recorded output for `b`.
    let fork = graph
        .update_state(
            &config("t1").with_checkpoint_id(after_a.checkpoint.id.clone()),
            json!({"log": ["edited"]}),
            None,
        )
        .await
        .unwrap();

    let fork_id = fork.checkpoint_id.clone().unwrap();
    let outcome = graph
        .resume(config("t1").with_checkpoint_id(fork_id))
        .await
        .unwrap();
    assert_eq!(outcome.state["value"], json!("b-1"));
    assert_eq!(outcome.steps_executed, 1);

    let branch_end = saver.get(&ThreadRef::new("t1")).await.unwrap();
    assert!(
        branch_end.checkpoint.channel_versions["value"]
            > original_end.checkpoint.channel_versions["value"]
    );

    let original = saver.get_tuple(&original_end.thread).await.unwrap().unwrap();
    assert_eq!(original.checkpoint.channel_values["value"], json!("b-0"));
}

#[tokio::test]
async fn test_recursion_limit() {
    let mut graph = StateGraph::new(schema());
    graph
        .add_node("spin", |_, _| async { Ok(StepOutput::update(json!({"log": ["spin"]}))) })
        .add_edge(START, "spin")
        .add_edge("spin", "spin");
    let saver = saver();
    let graph = graph.compile().unwrap().with_checkpointer(saver.clone());

    let error = graph
        .invoke(json!({}), config("t1").with_recursion_limit(3))
        .await
        .unwrap_err();
    assert!(matches!(error, GraphError::RecursionLimit { limit: 3, ref node } if node == "spin"));

    // input checkpoint plus three steps
    assert_eq!(thread_history(&saver, "t1").await.len(), 4);
}

#[tokio::test]
async fn test_transient_failures_retry_then_succeed() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let mut graph = StateGraph::new(schema());
    graph
        .add_node("flaky", move |_, ctx| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    return Err(StepError::transient("upstream timeout"));
                }
                Ok(StepOutput::update(json!({"value": ctx.attempt})))
            }
        })
        .add_edge(START, "flaky");
    let graph = graph.compile().unwrap();

    let policy = RetryPolicy::new(3).with_initial_interval(0.0).with_jitter(false);
    let outcome = graph
        .invoke(json!({}), config("t1").with_retry_policy(policy))
        .await
        .unwrap();
    assert_eq!(outcome.state["value"], json!(3));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_retry_budget_exhausted() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let mut graph = StateGraph::new(schema());
    graph
        .add_node("flaky", move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(StepError::transient("upstream timeout")) }
        })
        .add_edge(START, "flaky");
    let graph = graph.compile().unwrap();

    // Non-interactive default: a single attempt
    let error = graph.invoke(json!({}), config("t1")).await.unwrap_err();
    assert!(matches!(error, GraphError::NodeExecution { attempts: 1, .. }));

    let policy = RetryPolicy::new(2).with_initial_interval(0.0).with_jitter(false);
    let error = graph
        .invoke(json!({}), config("t2").with_step_retry_policy("flaky", policy))
        .await
        .unwrap_err();
    assert!(matches!(error, GraphError::NodeExecution { attempts: 2, .. }));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_fatal_errors_are_not_retried() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let mut graph = StateGraph::new(schema());
    graph
        .add_node("broken", move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(StepError::fatal("bad input")) }
        })
        .add_edge(START, "broken");
    let graph = graph.compile().unwrap();

    let error = graph
        .invoke(json!({}), config("t1").with_retry_policy(RetryPolicy::new(5)))
        .await
        .unwrap_err();
    assert!(matches!(error, GraphError::NodeExecution { attempts: 1, .. }));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_tenant_mismatch_is_configuration_error() {
    let graph = linear(Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)))
        .compile()
        .unwrap()
        .with_checkpointer(saver());

    let other = RunConfig::new(TenantId::new("org-2").unwrap(), "t1");
    assert!(matches!(
        graph.invoke(json!({}), other).await,
        Err(GraphError::Configuration(_))
    ));
}

#[tokio::test]
async fn test_goto_overrides_edges() {
    let mut graph = StateGraph::new(schema());
    graph
        .add_node("a", |_, _| async { Ok(StepOutput::update(json!({"log": ["a"]})).goto("c")) })
        .add_node("b", |_, _| async { Ok(StepOutput::update(json!({"log": ["b"]}))) })
        .add_node("c", |_, _| async { Ok(StepOutput::update(json!({"log": ["c"]}))) })
        .add_edge(START, "a")
        .add_edge("a", "b");
    let outcome = graph.compile().unwrap().invoke(json!({}), config("t1")).await.unwrap();
    assert_eq!(outcome.state["log"], json!(["a", "c"]));
}

#[tokio::test]
async fn test_conditional_routing_loop() {
    let mut graph = StateGraph::new(schema());
    graph
        .add_node("count", |state, _| async move {
            let n = state["value"].as_i64().unwrap_or(0);
            Ok(StepOutput::update(json!({"value": n + 1})))
        })
        .add_edge(START, "count")
        .add_conditional_edge(
            "count",
            |state| if state["value"].as_i64() < Some(3) { "again".into() } else { "done".into() },
            HashMap::from([
                ("again".to_string(), "count".to_string()),
                ("done".to_string(), END.to_string()),
            ]),
        );
    let outcome = graph.compile().unwrap().invoke(json!({}), config("t1")).await.unwrap();
    assert_eq!(outcome.state["value"], json!(3));
    assert_eq!(outcome.steps_executed, 3);
}

fn stalled_graph(saver: Arc<InMemoryCheckpointSaver>) -> CompiledGraph {
    let mut graph = StateGraph::new(schema());
    graph
        .add_node("a", |_, _| async { Ok(StepOutput::update(json!({"log": ["a"]}))) })
        .add_node("slow", |_, _| async {
            std::future::pending::<()>().await;
            Ok(StepOutput::empty())
        })
        .add_edge(START, "a")
        .add_edge("a", "slow");
    graph.compile().unwrap().with_checkpointer(saver)
}

#[tokio::test]
async fn test_cancellation_writes_nothing_further() {
    let saver = saver();
    let graph = stalled_graph(saver.clone());

    let mut handle = graph.stream(json!({}), config("t1"));
    while let Some(event) = handle.events.next().await {
        if matches!(event, RunEvent::StepCompleted { ref node, .. } if node == "a") {
            break;
        }
    }
    handle.cancel();

    let error = tokio::time::timeout(Duration::from_secs(5), handle.outcome())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(error, GraphError::Cancelled { ref node } if node == "slow"));

    let history = thread_history(&saver, "t1").await;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].metadata.next.as_deref(), Some("slow"));
    assert!(history[0].pending_writes.is_empty());
    // Only `a`'s output was recorded, against the input checkpoint.
    assert!(history
        .iter()
        .flat_map(|t| &t.pending_writes)
        .all(|w| w.task_id == "0:a"));
    assert_eq!(saver.backend().write_count().await, 1);
}

#[tokio::test]
async fn test_stream_emits_lifecycle_events() {
    let graph = linear(Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)))
        .compile()
        .unwrap()
        .with_checkpointer(saver());

    let mut handle = graph.stream(json!({}), config("t1"));
    let mut events = Vec::new();
    while let Some(event) = handle.events.next().await {
        events.push(event);
    }
    let outcome = handle.outcome().await.unwrap();

    assert!(matches!(events.first(), Some(RunEvent::RunStarted { resumed_from: None, .. })));
    assert!(matches!(events.last(), Some(RunEvent::RunFinished { steps_executed: 3, .. })));
    let completed: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            RunEvent::StepCompleted { node, .. } => Some(node.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(completed, vec!["a", "b", "c"]);
    assert_eq!(outcome.steps_executed, 3);
}

#[tokio::test]
async fn test_subgraph_checkpoints_under_child_namespace() {
    let saver = saver();

    let mut child = StateGraph::new(schema());
    child
        .add_node("inner", |_, _| async { Ok(StepOutput::update(json!({"log": ["inner"]}))) })
        .add_edge(START, "inner");
    let child = child.compile().unwrap().with_checkpointer(saver.clone());

    let mut parent = StateGraph::new(schema());
    parent
        .add_node("before", |_, _| async { Ok(StepOutput::update(json!({"log": ["before"]}))) })
        .add_subgraph("validate", child)
        .add_edge(START, "before")
        .add_edge("before", "validate");
    let parent = parent.compile().unwrap().with_checkpointer(saver.clone());

    let outcome = parent.invoke(json!({}), config("t1")).await.unwrap();
    assert_eq!(outcome.state["log"], json!(["before", "inner"]));

    let child_latest = saver
        .get(&ThreadRef::new("t1").with_namespace("validate"))
        .await
        .unwrap();
    assert_eq!(child_latest.metadata.next.as_deref(), Some(END));
    assert_eq!(child_latest.checkpoint.channel_values["log"], json!(["before", "inner"]));

    let parent_latest = saver.get(&ThreadRef::new("t1")).await.unwrap();
    assert_eq!(parent_latest.metadata.node.as_deref(), Some("validate"));
}

#[tokio::test]
async fn test_update_state_and_history() {
    let saver = saver();
    let graph = linear(Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(1)))
        .compile()
        .unwrap()
        .with_checkpointer(saver.clone());
    graph.invoke(json!({}), config("t1")).await.unwrap_err();

    let updated = graph
        .update_state(&config("t1"), json!({"log": ["manual-b"]}), Some("b"))
        .await
        .unwrap();
    let snapshot = graph.get_state(&updated).await.unwrap().unwrap();
    assert_eq!(snapshot.metadata.source, Some(CheckpointSource::Update));
    assert_eq!(snapshot.next.as_deref(), Some("c"));
    assert_eq!(snapshot.values["log"], json!(["a", "manual-b"]));

    let outcome = graph.resume(config("t1")).await.unwrap();
    assert_eq!(outcome.state["log"], json!(["a", "manual-b", "c"]));

    let history: Vec<_> = graph
        .get_state_history(&ThreadRef::new("t1"), ListOptions::new().with_limit(2))
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].is_finished());
}
