//! Type definitions for compiled graph execution

use chrono::{DateTime, Utc};
use futures::stream::Stream;
use schemaflow_checkpoint::{CheckpointMetadata, PendingWrite, ThreadRef};
use serde::Serialize;
use serde_json::Value;
use std::pin::Pin;

use crate::error::Result;
use crate::events::RunEvent;
use crate::graph::NodeId;

/// How a run begins.
#[derive(Debug, Clone, PartialEq)]
pub enum RunStart {
    /// Start at the entry node with caller-supplied input merged over the defaults
    Fresh(Value),
    /// Continue from the checkpoint named by the run configuration, or the latest one
    Resume,
}

/// Result of a run that reached `END`.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub state: Value,

    /// Last checkpoint written, `None` without a checkpointer
    pub checkpoint: Option<ThreadRef>,

    /// Steps executed by this invocation, not counting replayed ones
    pub steps_executed: usize,
}

/// Point-in-time view of a checkpoint, for inspection and history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateSnapshot {
    pub values: Value,

    /// Node scheduled after this checkpoint; `None` when the metadata does not say
    pub next: Option<NodeId>,

    pub thread: ThreadRef,
    pub parent: Option<ThreadRef>,
    pub metadata: CheckpointMetadata,
    pub created_at: DateTime<Utc>,
    pub pending_writes: Vec<PendingWrite>,
}

impl StateSnapshot {
    pub fn is_finished(&self) -> bool {
        self.next.as_deref() == Some(crate::graph::END)
    }
}

pub type StateSnapshotStream = Pin<Box<dyn Stream<Item = Result<StateSnapshot>> + Send>>;

pub type EventStream = Pin<Box<dyn Stream<Item = RunEvent> + Send>>;
