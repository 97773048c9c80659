//! # schemaflow-core - durable step graphs
//!
//! A small workflow engine for multi-step pipelines whose steps call slow, fallible
//! services (model invocations, SQL execution) and must survive process restarts.
//!
//! ## Core Concepts
//!
//! - **State** is a JSON object of named channels, each with a [`Reducer`](state::Reducer)
//!   that folds partial updates in. See [`state`].
//! - **Steps** read state and return a partial update plus an optional explicit next node.
//!   See [`step`].
//! - **Graphs** wire steps together with direct and conditional edges and are compiled
//!   into a [`CompiledGraph`]. Exactly one node runs per step.
//! - **Checkpoints**: with a [`CheckpointSaver`](schemaflow_checkpoint::CheckpointSaver)
//!   attached, every completed step is persisted before the next one starts, and
//!   [`CompiledGraph::resume`] continues a thread from the store alone.
//! - **Retries** are bounded per step by a [`RetryPolicy`]; exhausting the budget ends the
//!   run with a [`GraphError`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use schemaflow_checkpoint::{InMemoryCheckpointSaver, TenantId};
//! use schemaflow_core::state::{MergeMapReducer, StateSchema};
//! use schemaflow_core::{RunConfig, StateGraph, StepOutput, END, START};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let schema = StateSchema::new().channel("retry_count", MergeMapReducer, json!({}));
//!
//! let mut graph = StateGraph::new(schema);
//! graph
//!     .add_node("design", |_state, _ctx| async move {
//!         Ok(StepOutput::update(json!({"schema": {"tables": {}}})))
//!     })
//!     .add_edge(START, "design")
//!     .add_edge("design", END);
//!
//! let saver = Arc::new(InMemoryCheckpointSaver::new("org-1")?);
//! let compiled = graph.compile()?.with_checkpointer(saver);
//!
//! let config = RunConfig::new(TenantId::new("org-1")?, "thread-1");
//! let outcome = compiled.invoke(json!({}), config.clone()).await?;
//! assert_eq!(outcome.steps_executed, 1);
//!
//! // A finished thread resumes to its final state without running anything.
//! let again = compiled.resume(config).await?;
//! assert_eq!(again.state, outcome.state);
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod compiled;
pub mod compute;
pub mod config;
pub mod error;
pub mod events;
pub mod graph;
pub mod retry;
pub mod state;
pub mod step;
pub mod subgraph;

pub use builder::StateGraph;
pub use compiled::{
    CompiledGraph, EventStream, RunHandle, RunOutcome, RunStart, StateSnapshot,
    StateSnapshotStream,
};
pub use compute::{ComputeError, ComputeStep};
pub use config::{RunConfig, DEFAULT_RECURSION_LIMIT};
pub use error::{GraphError, Result, StepError};
pub use events::RunEvent;
pub use graph::{Edge, Graph, NodeId, NodeSpec, END, START};
pub use retry::{RetryPolicy, RetryState};
pub use state::{ChannelSpec, Reducer, StateSchema};
pub use step::{FnStep, Step, StepContext, StepOutput};
pub use subgraph::SubgraphStep;

pub use schemaflow_checkpoint as checkpoint;
