//! Per-run configuration
//!
//! A [`RunConfig`] is fixed for the life of one invocation and handed to every step
//! through its [`StepContext`](crate::StepContext); nothing in the engine reads ambient
//! process state.

use schemaflow_checkpoint::{TenantId, ThreadRef};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{GraphError, Result};
use crate::retry::RetryPolicy;

pub const DEFAULT_RECURSION_LIMIT: usize = 100;

fn default_recursion_limit() -> usize {
    DEFAULT_RECURSION_LIMIT
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub tenant_id: TenantId,

    /// Thread and namespace; `checkpoint_id` pins the checkpoint `resume` starts from
    pub thread: ThreadRef,

    /// Maximum steps executed by one invocation
    #[serde(default = "default_recursion_limit")]
    pub recursion_limit: usize,

    /// Selects the default retry budget (3 attempts when interactive, 1 otherwise)
    #[serde(default)]
    pub interactive: bool,

    /// Overrides every step's policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,

    /// Overrides for individual steps, taking precedence over `retry_policy`
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub step_retry_policies: HashMap<String, RetryPolicy>,
}

impl RunConfig {
    pub fn new(tenant_id: TenantId, thread_id: impl Into<String>) -> Self {
        Self {
            tenant_id,
            thread: ThreadRef::new(thread_id),
            recursion_limit: DEFAULT_RECURSION_LIMIT,
            interactive: false,
            retry_policy: None,
            step_retry_policies: HashMap::new(),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.thread.namespace = namespace.into();
        self
    }

    pub fn with_checkpoint_id(mut self, checkpoint_id: impl Into<String>) -> Self {
        self.thread.checkpoint_id = Some(checkpoint_id.into());
        self
    }

    pub fn with_recursion_limit(mut self, limit: usize) -> Self {
        self.recursion_limit = limit;
        self
    }

    pub fn with_interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_step_retry_policy(mut self, node: impl Into<String>, policy: RetryPolicy) -> Self {
        self.step_retry_policies.insert(node.into(), policy);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.thread.thread_id.trim().is_empty() {
            return Err(GraphError::Configuration("thread_id is required".into()));
        }
        if self.recursion_limit == 0 {
            return Err(GraphError::Configuration(
                "recursion_limit must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Effective policy for `node`: per-step override, then run-wide override, then the
    /// policy the graph declared for the node, then the environment default.
    pub fn retry_policy_for(&self, node: &str, declared: Option<&RetryPolicy>) -> RetryPolicy {
        self.step_retry_policies
            .get(node)
            .or(self.retry_policy.as_ref())
            .or(declared)
            .cloned()
            .unwrap_or_else(|| RetryPolicy::for_environment(self.interactive))
    }
}
