//! State inspection and external updates (get_state, get_state_history, update_state)

use futures::StreamExt;
use schemaflow_checkpoint::{
    Checkpoint, CheckpointMetadata, CheckpointSource, CheckpointTuple, ChannelVersion,
    ChannelVersions, ListOptions, ThreadRef,
};
use serde_json::Value;
use std::collections::HashMap;

use super::{CompiledGraph, StateSnapshot, StateSnapshotStream};
use crate::config::RunConfig;
use crate::error::{GraphError, Result};

impl CompiledGraph {
    /// State at the checkpoint `thread` points to, or the latest one.
    ///
    /// Unlike the engine's own reads this propagates store errors, so a snapshot that
    /// cannot be rebuilt is reported instead of looking like an empty thread.
    pub async fn get_state(&self, thread: &ThreadRef) -> Result<Option<StateSnapshot>> {
        let Some(saver) = &self.checkpoint_saver else {
            return Ok(None);
        };

        match saver.get_tuple(thread).await {
            Ok(tuple) => Ok(tuple.map(|t| self.snapshot(t))),
            Err(error) if error.is_not_found() => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    /// Snapshots of a thread, newest first.
    pub async fn get_state_history(
        &self,
        thread: &ThreadRef,
        options: ListOptions,
    ) -> Result<StateSnapshotStream> {
        let Some(saver) = &self.checkpoint_saver else {
            return Ok(Box::pin(futures::stream::empty()));
        };

        let graph = self.clone();
        let stream = saver.list(thread, options).await?;
        Ok(Box::pin(stream.map(move |result| {
            result
                .map(|tuple| graph.snapshot(tuple))
                .map_err(GraphError::from)
        })))
    }

    /// Write `values` into the thread as if `as_node` had produced them.
    ///
    /// The update goes through the channel reducers. With `as_node`, the next node is
    /// routed from that node's edges; otherwise the previously scheduled node is kept.
    /// Returns the reference of the new checkpoint.
    pub async fn update_state(
        &self,
        config: &RunConfig,
        values: Value,
        as_node: Option<&str>,
    ) -> Result<ThreadRef> {
        self.check_config(config)?;
        let saver = self.require_checkpointer()?;

        let current = saver.get(&config.thread).await;
        let mut clock = saver
            .get(&config.thread.latest())
            .await
            .map(|latest| latest.checkpoint.max_version())
            .unwrap_or(0);

        let mut state = self.graph.schema.initial_state(&Value::Null);
        let (parent, mut versions, step, previous_next) = match current {
            Some(tuple) => {
                clock = clock.max(tuple.checkpoint.max_version());
                if let Value::Object(values) = &mut state {
                    values.extend(tuple.checkpoint.channel_values.clone());
                }
                (
                    tuple.thread,
                    tuple.checkpoint.channel_versions,
                    tuple.metadata.step.unwrap_or(-1),
                    tuple.metadata.next,
                )
            }
            None => (config.thread.latest(), HashMap::new(), -1, None),
        };

        let changed = self.graph.schema.apply(&mut state, &values);
        let next = match as_node {
            Some(node) => {
                if !self.graph.nodes.contains_key(node) {
                    return Err(GraphError::Configuration(format!(
                        "update_state as unknown node '{node}'"
                    )));
                }
                self.graph.next_node(node, &state, None)?
            }
            None => match previous_next.or_else(|| self.graph.entry.clone()) {
                Some(next) => next,
                None => {
                    return Err(GraphError::Validation("graph has no entry point".into()));
                }
            },
        };

        if !changed.is_empty() {
            clock += 1;
        }
        let mut new_versions = ChannelVersions::new();
        for channel in &changed {
            versions.insert(channel.clone(), ChannelVersion(clock));
            new_versions.insert(channel.clone(), ChannelVersion(clock));
        }

        let values: HashMap<String, Value> = state
            .as_object()
            .map(|values| values.clone().into_iter().collect())
            .unwrap_or_default();
        let checkpoint = Checkpoint::new(values, versions)
            .with_updated_channels(changed)
            .with_version_clock(clock);
        let mut metadata = CheckpointMetadata::new()
            .with_source(CheckpointSource::Update)
            .with_step(step + 1)
            .with_next(next);
        if let Some(node) = as_node {
            metadata = metadata.with_node(node);
        }

        tracing::info!(thread_id = %config.thread.thread_id, as_node = ?as_node, "state updated externally");
        Ok(saver.put(&parent, checkpoint, metadata, new_versions).await?)
    }

    pub(crate) fn snapshot(&self, tuple: CheckpointTuple) -> StateSnapshot {
        let mut values = self.graph.schema.initial_state(&Value::Null);
        if let Value::Object(map) = &mut values {
            map.extend(tuple.checkpoint.channel_values);
        }

        StateSnapshot {
            values,
            next: tuple.metadata.next.clone(),
            created_at: tuple.checkpoint.ts,
            thread: tuple.thread,
            parent: tuple.parent,
            metadata: tuple.metadata,
            pending_writes: tuple.pending_writes,
        }
    }
}
