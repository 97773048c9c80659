//! Steps - the units of work a graph schedules
//!
//! A step reads the current state and returns a **partial update**: a JSON object with
//! only the channels it wants to change. The engine folds the update into state through
//! the channel reducers, so a step never mutates state directly and may be re-executed
//! under its retry policy without double-applying anything.
//!
//! A step may also name the next node explicitly with [`StepOutput::goto`]. That
//! overrides the graph's conditional and static edges for this transition.
//!
//! ```rust
//! use schemaflow_core::step::{FnStep, StepOutput};
//! use serde_json::json;
//!
//! let step = FnStep::new(|state, _ctx| async move {
//!     let count = state["count"].as_i64().unwrap_or(0);
//!     Ok(StepOutput::update(json!({"count": count + 1})))
//! });
//! # let _ = step;
//! ```

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::RunConfig;
use crate::error::StepError;

/// What a step hands back to the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    /// Partial state, folded in by the channel reducers
    pub update: Value,

    /// Explicit next node, taking precedence over edges
    pub goto: Option<String>,
}

impl StepOutput {
    pub fn update(update: Value) -> Self {
        Self { update, goto: None }
    }

    /// No state change.
    pub fn empty() -> Self {
        Self::update(Value::Object(Map::new()))
    }

    pub fn goto(mut self, node: impl Into<String>) -> Self {
        self.goto = Some(node.into());
        self
    }
}

impl Default for StepOutput {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<Value> for StepOutput {
    fn from(update: Value) -> Self {
        Self::update(update)
    }
}

/// Run-scoped information available to a step execution.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub config: Arc<RunConfig>,

    /// Name of the node being executed
    pub node: String,

    /// Step index within the thread; the input checkpoint is step `-1`
    pub step: i64,

    /// 1-based attempt number under the node's retry policy
    pub attempt: usize,

    /// Fires when the run is cancelled. Long-running steps may poll it; the engine also
    /// drops the step future when it fires.
    pub cancel: CancellationToken,
}

impl StepContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[async_trait]
pub trait Step: Send + Sync {
    async fn execute(&self, state: &Value, ctx: &StepContext) -> Result<StepOutput, StepError>;

    /// Label used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

type StepFuture = Pin<Box<dyn Future<Output = Result<StepOutput, StepError>> + Send>>;

/// Adapts an async closure into a [`Step`]. The closure gets an owned copy of the state.
#[derive(Clone)]
pub struct FnStep {
    func: Arc<dyn Fn(Value, StepContext) -> StepFuture + Send + Sync>,
}

impl FnStep {
    pub fn new<F, Fut>(func: F) -> Self
    where
        F: Fn(Value, StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StepOutput, StepError>> + Send + 'static,
    {
        Self {
            func: Arc::new(move |state, ctx| Box::pin(func(state, ctx))),
        }
    }
}

#[async_trait]
impl Step for FnStep {
    async fn execute(&self, state: &Value, ctx: &StepContext) -> Result<StepOutput, StepError> {
        (self.func)(state.clone(), ctx.clone()).await
    }

    fn name(&self) -> &str {
        "fn"
    }
}
