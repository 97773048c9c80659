//! Streaming execution
//!
//! [`CompiledGraph::stream`] runs the graph on a spawned task and hands back a
//! [`RunHandle`]: a stream of [`RunEvent`]s, a cancel switch, and the final outcome.

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{CompiledGraph, EventStream, RunOutcome, RunStart};
use crate::config::RunConfig;
use crate::error::{GraphError, Result};

/// A run executing in the background.
pub struct RunHandle {
    /// Progress events; ends after `RunFinished` or `RunFailed`
    pub events: EventStream,
    cancel: CancellationToken,
    outcome: JoinHandle<Result<RunOutcome>>,
}

impl RunHandle {
    /// Request cancellation. The current step is dropped and no further checkpoint is
    /// written.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the run to end.
    pub async fn outcome(self) -> Result<RunOutcome> {
        self.outcome
            .await
            .map_err(|error| GraphError::Aborted(error.to_string()))?
    }
}

impl CompiledGraph {
    /// Start a fresh run in the background.
    pub fn stream(&self, input: Value, config: RunConfig) -> RunHandle {
        self.stream_run(RunStart::Fresh(input), config)
    }

    /// Resume a thread in the background.
    pub fn stream_resume(&self, config: RunConfig) -> RunHandle {
        self.stream_run(RunStart::Resume, config)
    }

    pub fn stream_run(&self, start: RunStart, config: RunConfig) -> RunHandle {
        // Bounded; the run waits on a slow consumer.
        let (tx, mut rx) = mpsc::channel(100);
        let cancel = CancellationToken::new();

        let graph = self.clone();
        let token = cancel.clone();
        let outcome =
            tokio::spawn(async move { graph.execute(start, config, token, Some(tx)).await });

        let events = Box::pin(async_stream::stream! {
            while let Some(event) = rx.recv().await {
                yield event;
            }
        });

        RunHandle {
            events,
            cancel,
            outcome,
        }
    }
}
