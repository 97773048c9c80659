//! Run progress events
//!
//! Emitted on the side channel of [`CompiledGraph::stream`](crate::CompiledGraph::stream).
//! Events are informational; the durable record is always the checkpoint store.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        thread_id: String,
        namespace: String,
        /// Checkpoint the run continues from, if it is a resume
        resumed_from: Option<String>,
        next: String,
    },

    StepRetrying {
        node: String,
        attempt: usize,
        error: String,
        delay_ms: u64,
    },

    StepCompleted {
        node: String,
        step: i64,
        updated_channels: Vec<String>,
        next: String,
        checkpoint_id: Option<String>,
        /// Output was replayed from pending writes instead of executing the step
        recovered: bool,
    },

    RunFinished {
        steps_executed: usize,
        checkpoint_id: Option<String>,
    },

    RunFailed {
        error: String,
    },
}

impl RunEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RunFinished { .. } | Self::RunFailed { .. })
    }
}
