//! StateGraph builder API
//!
//! [`StateGraph`] is the fluent way to assemble a [`Graph`]: declare the state schema,
//! add steps and edges, then [`compile`](StateGraph::compile) into an executable
//! [`CompiledGraph`].
//!
//! ```rust
//! use schemaflow_core::{StateGraph, StepOutput, END, START};
//! use schemaflow_core::state::{AppendReducer, StateSchema};
//! use serde_json::json;
//!
//! # fn build() -> schemaflow_core::Result<()> {
//! let schema = StateSchema::new().channel("messages", AppendReducer, json!([]));
//!
//! let mut graph = StateGraph::new(schema);
//! graph
//!     .add_node("greet", |_state, _ctx| async move {
//!         Ok(StepOutput::update(json!({"messages": ["hello"]})))
//!     })
//!     .add_edge(START, "greet")
//!     .add_edge("greet", END);
//!
//! let compiled = graph.compile()?;
//! # let _ = compiled;
//! # Ok(())
//! # }
//! ```

use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::compiled::CompiledGraph;
use crate::error::{GraphError, Result, StepError};
use crate::graph::{Graph, NodeId, NodeSpec};
use crate::retry::RetryPolicy;
use crate::state::StateSchema;
use crate::step::{FnStep, Step, StepContext, StepOutput};
use crate::subgraph::SubgraphStep;

pub struct StateGraph {
    graph: Graph,
}

impl StateGraph {
    pub fn new(schema: StateSchema) -> Self {
        Self {
            graph: Graph::new(schema),
        }
    }

    /// Add a step backed by an async closure.
    pub fn add_node<F, Fut>(&mut self, name: impl Into<NodeId>, func: F) -> &mut Self
    where
        F: Fn(Value, StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<StepOutput, StepError>> + Send + 'static,
    {
        self.add_step(name, FnStep::new(func))
    }

    pub fn add_step(&mut self, name: impl Into<NodeId>, step: impl Step + 'static) -> &mut Self {
        self.add_shared_step(name, Arc::new(step), None)
    }

    /// Add a step with a declared retry policy. Run configuration can still override it.
    pub fn add_step_with_retry(
        &mut self,
        name: impl Into<NodeId>,
        step: impl Step + 'static,
        policy: RetryPolicy,
    ) -> &mut Self {
        self.add_shared_step(name, Arc::new(step), Some(policy))
    }

    pub fn add_shared_step(
        &mut self,
        name: impl Into<NodeId>,
        step: Arc<dyn Step>,
        retry_policy: Option<RetryPolicy>,
    ) -> &mut Self {
        self.graph.add_node(NodeSpec {
            name: name.into(),
            step,
            retry_policy,
        });
        self
    }

    /// Embed a compiled graph as a single step. Its checkpoints live in the namespace
    /// `<parent namespace>/<name>` of the parent's thread.
    pub fn add_subgraph(&mut self, name: impl Into<NodeId>, subgraph: CompiledGraph) -> &mut Self {
        let name = name.into();
        let step = SubgraphStep::new(name.clone(), subgraph);
        self.add_step(name, step)
    }

    pub fn add_edge(&mut self, from: impl Into<NodeId>, to: impl Into<NodeId>) -> &mut Self {
        self.graph.add_edge(from, to);
        self
    }

    /// Same as `add_edge(START, node)`.
    pub fn set_entry(&mut self, node: impl Into<NodeId>) -> &mut Self {
        self.graph.entry = Some(node.into());
        self
    }

    /// Declare the retry policy of an already added node.
    pub fn set_retry_policy(&mut self, node: &str, policy: RetryPolicy) -> Result<&mut Self> {
        let spec = self
            .graph
            .nodes
            .get_mut(node)
            .ok_or_else(|| GraphError::Validation(format!("unknown node '{node}'")))?;
        spec.retry_policy = Some(policy);
        Ok(self)
    }

    pub fn add_conditional_edge<R>(
        &mut self,
        from: impl Into<NodeId>,
        router: R,
        branches: HashMap<String, NodeId>,
    ) -> &mut Self
    where
        R: Fn(&Value) -> String + Send + Sync + 'static,
    {
        self.graph
            .add_conditional_edge(from, Arc::new(router), branches);
        self
    }

    pub fn schema(&self) -> &StateSchema {
        &self.graph.schema
    }

    /// Validate and freeze the graph. Attach a store afterwards with
    /// [`CompiledGraph::with_checkpointer`].
    pub fn compile(self) -> Result<CompiledGraph> {
        self.graph.validate()?;
        Ok(CompiledGraph::new(self.graph))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{END, START};
    use serde_json::json;

    #[test]
    fn test_compile_validates() {
        let mut graph = StateGraph::new(StateSchema::new());
        graph.add_node("a", |_, _| async { Ok(StepOutput::empty()) });
        assert!(matches!(graph.compile(), Err(GraphError::Validation(_))));
    }

    #[test]
    fn test_builder_chains() {
        let mut graph = StateGraph::new(StateSchema::new());
        graph
            .add_node("a", |_, _| async { Ok(StepOutput::update(json!({"x": 1}))) })
            .add_step_with_retry(
                "b",
                FnStep::new(|_, _| async { Ok(StepOutput::empty()) }),
                RetryPolicy::new(4),
            )
            .add_edge(START, "a")
            .add_conditional_edge(
                "a",
                |state| if state["x"] == json!(1) { "b".into() } else { END.into() },
                HashMap::new(),
            );

        let compiled = graph.compile().unwrap();
        let node = &compiled.graph().nodes["b"];
        assert_eq!(node.retry_policy.as_ref().map(|p| p.max_attempts), Some(4));
    }

    #[test]
    fn test_set_entry_and_retry_policy() {
        let mut graph = StateGraph::new(StateSchema::new());
        graph
            .add_node("only", |_, _| async { Ok(StepOutput::empty()) })
            .set_entry("only");
        graph.set_retry_policy("only", RetryPolicy::new(2)).unwrap();
        assert!(graph.set_retry_policy("missing", RetryPolicy::new(2)).is_err());

        let compiled = graph.compile().unwrap();
        assert_eq!(compiled.graph().entry.as_deref(), Some("only"));
        assert_eq!(
            compiled.graph().nodes["only"].retry_policy.as_ref().map(|p| p.max_attempts),
            Some(2)
        );
    }
}
