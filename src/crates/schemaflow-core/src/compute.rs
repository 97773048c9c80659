//! Opaque compute step
//!
//! Model invocations and external SQL execution are both awaited black boxes from the
//! engine's point of view: a request goes in, an output or an error comes out. Steps
//! hold their collaborators as `Arc<dyn ComputeStep<Req, Out>>`, injected at graph
//! construction.
//!
//! A compute call is the point where a run suspends. When the run's cancellation
//! token fires, the engine drops the in-flight future, which aborts the call.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ComputeError {
    #[error("{0}")]
    Failed(String),

    #[error("timed out after {0}ms")]
    Timeout(u64),

    #[error("cancelled")]
    Cancelled,

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ComputeError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Timeout(_))
    }
}

#[async_trait]
pub trait ComputeStep<Req, Out>: Send + Sync
where
    Req: Send + 'static,
    Out: Send + 'static,
{
    async fn invoke(&self, request: Req) -> Result<Out, ComputeError>;
}
