//! Run loop: invoke, resume and the per-step commit protocol
//!
//! One iteration of the loop, for the node scheduled after the last checkpoint:
//!
//! ```text
//! cancelled? ─▶ limit reached? ─▶ execute (retry policy, cancellable)
//!     ─▶ put_writes(step output)          pending, keyed "<step>:<node>"
//!     ─▶ merge through reducers
//!     ─▶ pick next node
//!     ─▶ put(checkpoint, changed blobs)   durable commit point
//! ```
//!
//! A crash after `put_writes` but before `put` leaves the step's output recorded against
//! the previous checkpoint. `resume` replays those writes instead of executing the step
//! again, so a step whose compute call already returned is not paid for twice.
//!
//! Channel versions are drawn from a thread-wide clock carried in every checkpoint. A run
//! forked from an older checkpoint therefore never reuses a `(channel, version)` blob key
//! written on another branch.

use schemaflow_checkpoint::{
    Checkpoint, CheckpointMetadata, CheckpointSaver, CheckpointSource, ChannelVersion,
    ChannelVersions, PendingWrite, ThreadRef,
};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{CompiledGraph, RunOutcome, RunStart};
use crate::config::RunConfig;
use crate::error::{GraphError, Result, StepError};
use crate::events::RunEvent;
use crate::graph::{NodeId, NodeSpec, END};
use crate::retry::RetryState;
use crate::step::{StepContext, StepOutput};

/// Pending-write channel carrying a step's explicit `goto`.
pub(crate) const ROUTE_CHANNEL: &str = "__route__";

pub(crate) fn task_id(step: i64, node: &str) -> String {
    format!("{step}:{node}")
}

#[derive(Clone, Default)]
pub(crate) struct EventEmitter(Option<mpsc::Sender<RunEvent>>);

impl EventEmitter {
    pub(crate) fn new(sender: Option<mpsc::Sender<RunEvent>>) -> Self {
        Self(sender)
    }

    async fn emit(&self, event: RunEvent) {
        if let Some(sender) = &self.0 {
            // A dropped receiver only means nobody is watching.
            let _ = sender.send(event).await;
        }
    }
}

/// Mutable position of a run between steps.
struct RunCursor {
    state: Value,
    versions: ChannelVersions,
    clock: u64,
    /// Pinned to the last checkpoint written or loaded; unpinned before the first one
    thread: ThreadRef,
    next: NodeId,
    step: i64,
    steps_executed: usize,
    resumed_from: Option<String>,
    replay: Option<(NodeId, StepOutput)>,
}

impl RunCursor {
    fn bump(&mut self, channels: &[String]) {
        if channels.is_empty() {
            return;
        }
        self.clock += 1;
        for channel in channels {
            self.versions
                .insert(channel.clone(), ChannelVersion(self.clock));
        }
    }

    fn checkpoint_id(&self) -> Option<String> {
        self.thread.checkpoint_id.clone()
    }
}

impl CompiledGraph {
    /// Run from the entry node with `input` merged over the schema defaults.
    pub async fn invoke(&self, input: Value, config: RunConfig) -> Result<RunOutcome> {
        self.execute(RunStart::Fresh(input), config, CancellationToken::new(), None)
            .await
    }

    /// Continue the thread from its latest checkpoint, or from `config.thread.checkpoint_id`.
    ///
    /// A thread whose last checkpoint is already finished returns its state without
    /// executing anything.
    pub async fn resume(&self, config: RunConfig) -> Result<RunOutcome> {
        self.execute(RunStart::Resume, config, CancellationToken::new(), None)
            .await
    }

    /// Run with an explicit cancellation token and an optional event sink.
    ///
    /// After `cancel` fires, the in-flight step is dropped and nothing further is
    /// written; the run fails with [`GraphError::Cancelled`] and the last checkpoint
    /// stays resumable.
    #[instrument(
        name = "graph.run",
        skip_all,
        fields(
            tenant = %config.tenant_id,
            thread_id = %config.thread.thread_id,
            namespace = %config.thread.namespace,
        )
    )]
    pub async fn execute(
        &self,
        start: RunStart,
        config: RunConfig,
        cancel: CancellationToken,
        events: Option<mpsc::Sender<RunEvent>>,
    ) -> Result<RunOutcome> {
        let emitter = EventEmitter::new(events);
        let result = self.run(start, config, &cancel, &emitter).await;

        match &result {
            Ok(outcome) => {
                info!(steps = outcome.steps_executed, "run finished");
                emitter
                    .emit(RunEvent::RunFinished {
                        steps_executed: outcome.steps_executed,
                        checkpoint_id: outcome
                            .checkpoint
                            .as_ref()
                            .and_then(|thread| thread.checkpoint_id.clone()),
                    })
                    .await;
            }
            Err(error) => {
                warn!(%error, "run failed");
                emitter
                    .emit(RunEvent::RunFailed {
                        error: error.to_string(),
                    })
                    .await;
            }
        }

        result
    }

    async fn run(
        &self,
        start: RunStart,
        config: RunConfig,
        cancel: &CancellationToken,
        emitter: &EventEmitter,
    ) -> Result<RunOutcome> {
        self.check_config(&config)?;
        let config = Arc::new(config);

        let mut cursor = match start {
            RunStart::Fresh(input) => self.start_fresh(input, &config).await?,
            RunStart::Resume => self.start_resume(&config).await?,
        };

        emitter
            .emit(RunEvent::RunStarted {
                thread_id: config.thread.thread_id.clone(),
                namespace: config.thread.namespace.clone(),
                resumed_from: cursor.resumed_from.clone(),
                next: cursor.next.clone(),
            })
            .await;

        if let Some((node, output)) = cursor.replay.take() {
            info!(node = %node, step = cursor.step + 1, "replaying recorded step output");
            self.commit_step(&mut cursor, node, output, true, emitter)
                .await?;
        }

        while cursor.next != END {
            if cancel.is_cancelled() {
                return Err(GraphError::Cancelled {
                    node: cursor.next.clone(),
                });
            }
            if cursor.steps_executed >= config.recursion_limit {
                return Err(GraphError::RecursionLimit {
                    limit: config.recursion_limit,
                    node: cursor.next.clone(),
                });
            }

            let node = self
                .graph
                .nodes
                .get(&cursor.next)
                .ok_or_else(|| GraphError::UnknownRoute {
                    from: cursor
                        .checkpoint_id()
                        .unwrap_or_else(|| "checkpoint".to_string()),
                    to: cursor.next.clone(),
                })?;

            let step = cursor.step + 1;
            let output = self
                .execute_node(node, &cursor.state, step, &config, cancel, emitter)
                .await?;

            if cancel.is_cancelled() {
                return Err(GraphError::Cancelled {
                    node: node.name.clone(),
                });
            }

            self.record_writes(&cursor, step, &node.name, &output)
                .await?;
            self.commit_step(&mut cursor, node.name.clone(), output, false, emitter)
                .await?;
        }

        Ok(RunOutcome {
            checkpoint: cursor.thread.checkpoint_id.is_some().then(|| cursor.thread.clone()),
            state: cursor.state,
            steps_executed: cursor.steps_executed,
        })
    }

    async fn start_fresh(&self, input: Value, config: &RunConfig) -> Result<RunCursor> {
        let entry = self
            .graph
            .entry
            .clone()
            .ok_or_else(|| GraphError::Validation("graph has no entry point".into()))?;

        let state = self.graph.schema.initial_state(&input);
        let mut cursor = RunCursor {
            state,
            versions: HashMap::new(),
            clock: 0,
            thread: config.thread.latest(),
            next: entry,
            step: -1,
            steps_executed: 0,
            resumed_from: None,
            replay: None,
        };

        let Some(saver) = &self.checkpoint_saver else {
            return Ok(cursor);
        };

        // The new input checkpoint hangs off whatever the thread already holds.
        let parent = saver.get(&config.thread).await;
        cursor.clock = version_floor(saver.as_ref(), &config.thread).await;
        if let Some(parent) = parent {
            cursor.clock = cursor.clock.max(parent.checkpoint.max_version());
            cursor.thread = parent.thread;
        }

        let channels: Vec<String> = cursor
            .state
            .as_object()
            .map(|values| values.keys().cloned().collect())
            .unwrap_or_default();
        cursor.bump(&channels);
        self.write_checkpoint(saver.as_ref(), &mut cursor, &channels, CheckpointSource::Input, None)
            .await?;

        debug!(checkpoint_id = ?cursor.checkpoint_id(), "input checkpoint written");
        Ok(cursor)
    }

    async fn start_resume(&self, config: &RunConfig) -> Result<RunCursor> {
        let saver = self.require_checkpointer()?;

        let tuple = saver
            .get(&config.thread)
            .await
            .ok_or_else(|| GraphError::NothingToResume {
                thread_id: config.thread.thread_id.clone(),
            })?;

        let next = tuple.metadata.next.clone().ok_or_else(|| {
            GraphError::Configuration(format!(
                "checkpoint '{}' does not record a scheduled node",
                tuple.checkpoint.id
            ))
        })?;
        let step = tuple.metadata.step.unwrap_or(-1);

        let mut clock = tuple.checkpoint.max_version();
        if config.thread.checkpoint_id.is_some() {
            clock = clock.max(version_floor(saver.as_ref(), &config.thread).await);
        }

        let mut state = self.graph.schema.initial_state(&Value::Null);
        if let Value::Object(values) = &mut state {
            values.extend(tuple.checkpoint.channel_values.clone());
        }

        let replay = if next == END {
            None
        } else {
            recover_output(&tuple.pending_writes, &task_id(step + 1, &next))
                .map(|output| (next.clone(), output))
        };

        info!(
            checkpoint_id = %tuple.checkpoint.id,
            next = %next,
            step,
            replay = replay.is_some(),
            "resuming thread"
        );

        Ok(RunCursor {
            state,
            versions: tuple.checkpoint.channel_versions.clone(),
            clock,
            resumed_from: Some(tuple.checkpoint.id.clone()),
            thread: tuple.thread,
            next,
            step,
            steps_executed: 0,
            replay,
        })
    }

    /// Execute one node under its retry policy, racing the cancellation token.
    async fn execute_node(
        &self,
        node: &NodeSpec,
        state: &Value,
        step: i64,
        config: &Arc<RunConfig>,
        cancel: &CancellationToken,
        emitter: &EventEmitter,
    ) -> Result<StepOutput> {
        let policy = config.retry_policy_for(&node.name, node.retry_policy.as_ref());
        let mut retry = RetryState::new();
        let cancelled = || GraphError::Cancelled {
            node: node.name.clone(),
        };

        loop {
            let ctx = StepContext {
                config: config.clone(),
                node: node.name.clone(),
                step,
                attempt: retry.attempts + 1,
                cancel: cancel.clone(),
            };

            debug!(node = %node.name, kind = node.step.name(), step, attempt = ctx.attempt, "executing step");
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled()),
                result = node.step.execute(state, &ctx) => result,
            };

            let error = match result {
                Ok(output) => return Ok(output),
                Err(error) => error,
            };
            retry.record_attempt(Some(error.to_string()));

            if cancel.is_cancelled() {
                return Err(cancelled());
            }
            if !error.is_retryable() || !policy.should_retry(retry.attempts) {
                return Err(terminal_error(&node.name, retry.attempts, error));
            }

            let delay = policy.calculate_delay(retry.attempts - 1);
            warn!(
                node = %node.name,
                attempt = retry.attempts,
                max_attempts = policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                %error,
                "step failed, retrying"
            );
            emitter
                .emit(RunEvent::StepRetrying {
                    node: node.name.clone(),
                    attempt: retry.attempts,
                    error: error.to_string(),
                    delay_ms: delay.as_millis() as u64,
                })
                .await;

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Record the step's output against the current checkpoint before committing.
    async fn record_writes(
        &self,
        cursor: &RunCursor,
        step: i64,
        node: &str,
        output: &StepOutput,
    ) -> Result<()> {
        let Some(saver) = &self.checkpoint_saver else {
            return Ok(());
        };
        if cursor.thread.checkpoint_id.is_none() {
            return Ok(());
        }

        let mut writes: Vec<(String, Value)> = match &output.update {
            Value::Object(update) => update
                .iter()
                .map(|(channel, value)| (channel.clone(), value.clone()))
                .collect(),
            _ => Vec::new(),
        };
        if let Some(goto) = &output.goto {
            writes.push((ROUTE_CHANNEL.to_string(), Value::String(goto.clone())));
        }
        if writes.is_empty() {
            return Ok(());
        }

        saver
            .put_writes(&cursor.thread, writes, &task_id(step, node))
            .await?;
        Ok(())
    }

    /// Merge, route, version and checkpoint one step's output.
    async fn commit_step(
        &self,
        cursor: &mut RunCursor,
        node: NodeId,
        output: StepOutput,
        replayed: bool,
        emitter: &EventEmitter,
    ) -> Result<()> {
        let step = cursor.step + 1;
        let changed = self.graph.schema.apply(&mut cursor.state, &output.update);
        let next = self
            .graph
            .next_node(&node, &cursor.state, output.goto.as_deref())?;

        cursor.bump(&changed);
        cursor.step = step;
        cursor.next = next.clone();
        if !replayed {
            cursor.steps_executed += 1;
        }

        if let Some(saver) = &self.checkpoint_saver {
            self.write_checkpoint(saver.as_ref(), cursor, &changed, CheckpointSource::Loop, Some(&node))
                .await?;
        }

        info!(
            node = %node,
            step,
            next = %next,
            updated = changed.len(),
            "step completed"
        );
        emitter
            .emit(RunEvent::StepCompleted {
                node,
                step,
                updated_channels: changed,
                next,
                checkpoint_id: cursor.checkpoint_id(),
                recovered: replayed,
            })
            .await;
        Ok(())
    }

    async fn write_checkpoint(
        &self,
        saver: &dyn CheckpointSaver,
        cursor: &mut RunCursor,
        changed: &[String],
        source: CheckpointSource,
        node: Option<&str>,
    ) -> Result<()> {
        let values: HashMap<String, Value> = cursor
            .state
            .as_object()
            .map(|values| values.clone().into_iter().collect())
            .unwrap_or_default();
        let new_versions: ChannelVersions = changed
            .iter()
            .filter_map(|channel| {
                cursor
                    .versions
                    .get(channel)
                    .map(|version| (channel.clone(), *version))
            })
            .collect();

        let checkpoint = Checkpoint::new(values, cursor.versions.clone())
            .with_updated_channels(changed.to_vec())
            .with_version_clock(cursor.clock);
        let mut metadata = CheckpointMetadata::new()
            .with_source(source)
            .with_step(cursor.step)
            .with_next(cursor.next.clone());
        if let Some(node) = node {
            metadata = metadata.with_node(node);
        }

        cursor.thread = saver
            .put(&cursor.thread, checkpoint, metadata, new_versions)
            .await?;
        Ok(())
    }
}

/// Highest version issued on the thread, read from its latest checkpoint.
async fn version_floor(saver: &dyn CheckpointSaver, thread: &ThreadRef) -> u64 {
    saver
        .get(&thread.latest())
        .await
        .map(|latest| latest.checkpoint.max_version())
        .unwrap_or(0)
}

/// Rebuild a step's output from the writes recorded under `task`.
fn recover_output(writes: &[PendingWrite], task: &str) -> Option<StepOutput> {
    let mut recorded: Vec<&PendingWrite> = writes.iter().filter(|w| w.task_id == task).collect();
    if recorded.is_empty() {
        return None;
    }
    recorded.sort_by_key(|w| w.idx);

    let mut update = Map::new();
    let mut goto = None;
    for write in recorded {
        if write.channel == ROUTE_CHANNEL {
            goto = write.value.as_str().map(str::to_string);
        } else {
            update.insert(write.channel.clone(), write.value.clone());
        }
    }

    Some(StepOutput {
        update: Value::Object(update),
        goto,
    })
}

fn terminal_error(node: &str, attempts: usize, error: StepError) -> GraphError {
    match error {
        StepError::Subgraph(inner) if matches!(*inner, GraphError::Cancelled { .. }) => *inner,
        other => GraphError::node_execution(node, attempts, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write(task: &str, idx: i64, channel: &str, value: Value) -> PendingWrite {
        PendingWrite {
            task_id: task.into(),
            idx,
            channel: channel.into(),
            value,
        }
    }

    #[test]
    fn test_recover_output_filters_task_and_orders() {
        let writes = vec![
            write("1:validate", 1, ROUTE_CHANNEL, json!("design")),
            write("1:validate", 0, "status", json!("retrying")),
            write("0:design", 0, "schema", json!({})),
        ];

        let output = recover_output(&writes, "1:validate").unwrap();
        assert_eq!(output.update, json!({"status": "retrying"}));
        assert_eq!(output.goto.as_deref(), Some("design"));

        assert!(recover_output(&writes, "2:finalize").is_none());
    }

    #[test]
    fn test_task_id_format() {
        assert_eq!(task_id(3, "design"), "3:design");
    }

    #[test]
    fn test_cursor_bump_shares_one_clock_tick() {
        let mut cursor = RunCursor {
            state: json!({}),
            versions: HashMap::new(),
            clock: 4,
            thread: ThreadRef::new("t"),
            next: END.into(),
            step: 0,
            steps_executed: 0,
            resumed_from: None,
            replay: None,
        };
        cursor.bump(&["a".to_string(), "b".to_string()]);
        cursor.bump(&[]);
        assert_eq!(cursor.clock, 5);
        assert_eq!(cursor.versions["a"], ChannelVersion(5));
        assert_eq!(cursor.versions["b"], ChannelVersion(5));
    }

    #[test]
    fn test_subgraph_cancellation_stays_cancellation() {
        let error = terminal_error(
            "child",
            1,
            StepError::from(GraphError::Cancelled { node: "inner".into() }),
        );
        assert!(matches!(error, GraphError::Cancelled { .. }));

        let error = terminal_error("design", 3, StepError::transient("timeout"));
        assert!(matches!(error, GraphError::NodeExecution { attempts: 3, .. }));
    }
}
