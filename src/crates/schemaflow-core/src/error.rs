//! Error types for graph construction and runs
//!
//! Two layers:
//!
//! - [`StepError`] is what a step returns. The engine consults the step's retry policy
//!   for retryable errors and gives up on the rest.
//! - [`GraphError`] is terminal. Whatever reaches the caller of a run as an `Err` ended
//!   that run; the last durable checkpoint stays resumable.
//!
//! Expected validation rejections are neither: they are recorded in state by the
//! validation loop and only show up as an exhausted flag.

use thiserror::Error;

use crate::compute::ComputeError;

/// Result type for graph operations
pub type Result<T> = std::result::Result<T, GraphError>;

/// Terminal failures of graph construction or a run.
#[derive(Error, Debug)]
pub enum GraphError {
    /// Graph structure is invalid
    #[error("Graph validation failed: {0}")]
    Validation(String),

    /// Missing or inconsistent run configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A step failed and its retry budget is spent (or the failure was not retryable)
    #[error("Node '{node}' failed after {attempts} attempt(s): {error}")]
    NodeExecution {
        node: String,
        attempts: usize,
        error: String,
    },

    /// The run executed more steps than its recursion limit allows
    #[error("Recursion limit of {limit} steps exceeded (next node '{node}')")]
    RecursionLimit { limit: usize, node: String },

    /// The cancellation token fired; no further checkpoint was written
    #[error("Run cancelled before node '{node}' completed")]
    Cancelled { node: String },

    /// `resume` found no checkpoint for the thread
    #[error("No checkpoint to resume for thread '{thread_id}'")]
    NothingToResume { thread_id: String },

    /// Routing produced a node the graph does not contain
    #[error("Node '{from}' routed to unknown node '{to}'")]
    UnknownRoute { from: String, to: String },

    /// The background task running the graph panicked or was aborted
    #[error("Run task aborted: {0}")]
    Aborted(String),

    /// Store write failed
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] schemaflow_checkpoint::CheckpointError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GraphError {
    pub fn node_execution(node: impl Into<String>, attempts: usize, error: impl Into<String>) -> Self {
        Self::NodeExecution {
            node: node.into(),
            attempts,
            error: error.into(),
        }
    }

    /// True when the run can be resumed later from its last checkpoint as-is.
    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::Cancelled { .. } | Self::NodeExecution { .. })
    }
}

/// Failure returned by a single step execution.
#[derive(Error, Debug)]
pub enum StepError {
    /// Worth another attempt under the step's retry policy
    #[error("{0}")]
    Transient(String),

    /// Never retried
    #[error("{0}")]
    Fatal(String),

    /// The opaque compute call failed
    #[error("Compute call failed: {0}")]
    Compute(#[from] ComputeError),

    /// A nested graph failed
    #[error("Subgraph failed: {0}")]
    Subgraph(Box<GraphError>),
}

impl StepError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transient(_) => true,
            Self::Compute(error) => error.is_retryable(),
            Self::Fatal(_) | Self::Subgraph(_) => false,
        }
    }
}

impl From<serde_json::Error> for StepError {
    fn from(error: serde_json::Error) -> Self {
        Self::Fatal(format!("state decoding failed: {error}"))
    }
}

impl From<GraphError> for StepError {
    fn from(error: GraphError) -> Self {
        Self::Subgraph(Box::new(error))
    }
}
