//! CompiledGraph struct and builder methods

use schemaflow_checkpoint::CheckpointSaver;
use std::sync::Arc;

use crate::config::RunConfig;
use crate::error::{GraphError, Result};
use crate::graph::Graph;
use crate::state::StateSchema;

/// Validated graph ready for execution. Cloning is cheap.
#[derive(Clone)]
pub struct CompiledGraph {
    pub(crate) graph: Arc<Graph>,
    pub(crate) checkpoint_saver: Option<Arc<dyn CheckpointSaver>>,
}

impl CompiledGraph {
    pub(crate) fn new(graph: Graph) -> Self {
        Self {
            graph: Arc::new(graph),
            checkpoint_saver: None,
        }
    }

    /// Persist a checkpoint after every step to `saver`.
    pub fn with_checkpointer(mut self, saver: Arc<dyn CheckpointSaver>) -> Self {
        self.checkpoint_saver = Some(saver);
        self
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn schema(&self) -> &StateSchema {
        &self.graph.schema
    }

    pub fn checkpointer(&self) -> Option<&Arc<dyn CheckpointSaver>> {
        self.checkpoint_saver.as_ref()
    }

    /// Reject a run configuration before anything is read or written.
    pub(crate) fn check_config(&self, config: &RunConfig) -> Result<()> {
        config.validate()?;
        if let Some(saver) = &self.checkpoint_saver {
            if saver.tenant() != &config.tenant_id {
                return Err(GraphError::Configuration(format!(
                    "run tenant '{}' does not match checkpointer tenant '{}'",
                    config.tenant_id,
                    saver.tenant()
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn require_checkpointer(&self) -> Result<&Arc<dyn CheckpointSaver>> {
        self.checkpoint_saver
            .as_ref()
            .ok_or_else(|| GraphError::Configuration("no checkpointer attached to the graph".into()))
    }
}
