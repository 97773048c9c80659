//! Nested graphs as steps
//!
//! A [`SubgraphStep`] runs a compiled child graph on the parent's thread, in the
//! namespace `<parent namespace>/<node name>`, under the parent's tenant. The child is
//! checkpointed independently, so a parent that is resumed mid-subgraph picks the child
//! up where it stopped instead of starting it over.
//!
//! The child's final state flows back to the parent as a partial update containing only
//! the channels the child changed. Append channels contribute just the items the child
//! added, so the parent reducer does not duplicate what it already holds.

use async_trait::async_trait;
use schemaflow_checkpoint::ThreadRef;
use serde_json::{Map, Value};

use crate::compiled::{CompiledGraph, RunStart};
use crate::error::StepError;
use crate::graph::END;
use crate::state::AppendReducer;
use crate::state::Reducer;
use crate::step::{Step, StepContext, StepOutput};

pub fn child_namespace(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

pub struct SubgraphStep {
    name: String,
    graph: CompiledGraph,
}

impl SubgraphStep {
    pub fn new(name: impl Into<String>, graph: CompiledGraph) -> Self {
        Self {
            name: name.into(),
            graph,
        }
    }

    /// Channels of `output` that differ from `input`.
    fn delta(&self, input: &Value, output: &Value) -> Value {
        let Value::Object(values) = output else {
            return Value::Object(Map::new());
        };

        let mut update = Map::new();
        for (channel, value) in values {
            let before = input.get(channel);
            if before == Some(value) {
                continue;
            }

            let appends = self
                .graph
                .schema()
                .get(channel)
                .is_some_and(|spec| spec.reducer.name() == AppendReducer.name());
            let added = match (appends, before, value) {
                (true, Some(Value::Array(old)), Value::Array(new)) if new.starts_with(old) => {
                    Value::Array(new[old.len()..].to_vec())
                }
                _ => value.clone(),
            };
            update.insert(channel.clone(), added);
        }
        Value::Object(update)
    }
}

#[async_trait]
impl Step for SubgraphStep {
    async fn execute(&self, state: &Value, ctx: &StepContext) -> Result<StepOutput, StepError> {
        let mut config = (*ctx.config).clone();
        config.thread = ThreadRef::new(ctx.config.thread.thread_id.clone())
            .with_namespace(child_namespace(&ctx.config.thread.namespace, &self.name));

        let unfinished = match self.graph.checkpointer() {
            Some(saver) => saver
                .get(&config.thread)
                .await
                .is_some_and(|tuple| tuple.metadata.next.as_deref().is_some_and(|next| next != END)),
            None => false,
        };
        let start = if unfinished {
            tracing::info!(subgraph = %self.name, namespace = %config.thread.namespace, "resuming unfinished subgraph");
            RunStart::Resume
        } else {
            RunStart::Fresh(state.clone())
        };

        let outcome = self
            .graph
            .execute(start, config, ctx.cancel.child_token(), None)
            .await?;
        Ok(StepOutput::update(self.delta(state, &outcome.state)))
    }

    fn name(&self) -> &str {
        "subgraph"
    }
}
