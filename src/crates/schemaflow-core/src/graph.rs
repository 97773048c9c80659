//! Core graph structure: nodes, edges and routing
//!
//! A [`Graph`] is a set of named steps plus the edges between them. Execution is
//! sequential: exactly one node runs per step, and after it completes the engine picks
//! the next node with [`Graph::next_node`]:
//!
//! 1. an explicit `goto` returned by the step,
//! 2. otherwise the node's conditional edge, evaluated against the merged state,
//! 3. otherwise the node's direct edge,
//! 4. otherwise [`END`].
//!
//! ```text
//!  START ──▶ design ──▶ validate ──┬─ "retry" ───▶ design
//!                                  ├─ "success" ─▶ finalize ──▶ END
//!                                  └─ "exhausted" ▶ END
//! ```
//!
//! Graphs are normally assembled with [`StateGraph`](crate::StateGraph), which calls
//! [`Graph::validate`] on compile.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{GraphError, Result};
use crate::retry::RetryPolicy;
use crate::state::StateSchema;
use crate::step::Step;

pub type NodeId = String;

/// Virtual entry node. `add_edge(START, x)` makes `x` the entry point.
pub const START: &str = "__start__";

/// Virtual terminal node. A run whose next node is `END` is finished.
pub const END: &str = "__end__";

/// Maps state to a branch key.
pub type RouterFn = Arc<dyn Fn(&Value) -> String + Send + Sync>;

#[derive(Clone)]
pub enum Edge {
    /// Always proceed to this node
    Direct(NodeId),

    /// Evaluate `router` against the merged state and look the key up in `branches`.
    ///
    /// With an empty branch map the key itself is the target node.
    Conditional {
        router: RouterFn,
        branches: HashMap<String, NodeId>,
    },
}

impl fmt::Debug for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Edge::Direct(node_id) => f.debug_tuple("Direct").field(node_id).finish(),
            Edge::Conditional { branches, .. } => f
                .debug_struct("Conditional")
                .field("router", &"<function>")
                .field("branches", branches)
                .finish(),
        }
    }
}

/// A named step and the retry policy it was declared with.
#[derive(Clone)]
pub struct NodeSpec {
    pub name: NodeId,
    pub step: Arc<dyn Step>,
    pub retry_policy: Option<RetryPolicy>,
}

impl fmt::Debug for NodeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSpec")
            .field("name", &self.name)
            .field("step", &"<step>")
            .field("retry_policy", &self.retry_policy)
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Graph {
    pub nodes: HashMap<NodeId, NodeSpec>,

    /// Outgoing edges by source node. At most one direct and one conditional edge each.
    pub edges: HashMap<NodeId, Vec<Edge>>,

    /// First node to run; set by an edge from [`START`]
    pub entry: Option<NodeId>,

    pub schema: StateSchema,
}

impl Graph {
    pub fn new(schema: StateSchema) -> Self {
        Self {
            schema,
            ..Self::default()
        }
    }

    pub fn add_node(&mut self, spec: NodeSpec) {
        self.nodes.insert(spec.name.clone(), spec);
    }

    pub fn add_edge(&mut self, from: impl Into<NodeId>, to: impl Into<NodeId>) {
        let from = from.into();
        let to = to.into();
        if from == START {
            self.entry = Some(to);
            return;
        }
        self.edges.entry(from).or_default().push(Edge::Direct(to));
    }

    pub fn add_conditional_edge(
        &mut self,
        from: impl Into<NodeId>,
        router: RouterFn,
        branches: HashMap<String, NodeId>,
    ) {
        self.edges
            .entry(from.into())
            .or_default()
            .push(Edge::Conditional { router, branches });
    }

    /// Check structural soundness before anything runs.
    ///
    /// # Errors
    ///
    /// [`GraphError::Validation`] when:
    /// - there is no entry point, or it does not exist
    /// - a node uses a reserved `__` name
    /// - an edge starts at an unknown node or targets one
    /// - a node has more than one direct or more than one conditional edge
    pub fn validate(&self) -> Result<()> {
        let entry = self
            .entry
            .as_ref()
            .ok_or_else(|| GraphError::Validation("no entry point: add an edge from START".into()))?;
        if !self.nodes.contains_key(entry) {
            return Err(GraphError::Validation(format!(
                "entry point '{entry}' does not exist"
            )));
        }

        for name in self.nodes.keys() {
            if name.starts_with("__") {
                return Err(GraphError::Validation(format!(
                    "node name '{name}' is reserved"
                )));
            }
        }

        for (from, edges) in &self.edges {
            if !self.nodes.contains_key(from) {
                return Err(GraphError::Validation(format!(
                    "edge source '{from}' does not exist"
                )));
            }

            let direct = edges.iter().filter(|e| matches!(e, Edge::Direct(_))).count();
            if direct > 1 {
                return Err(GraphError::Validation(format!(
                    "node '{from}' has {direct} direct edges; use a conditional edge to branch"
                )));
            }
            if edges.len() - direct > 1 {
                return Err(GraphError::Validation(format!(
                    "node '{from}' has more than one conditional edge"
                )));
            }

            for edge in edges {
                match edge {
                    Edge::Direct(to) => self.require_target(from, to)?,
                    Edge::Conditional { branches, .. } => {
                        for to in branches.values() {
                            self.require_target(from, to)?;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn require_target(&self, from: &str, to: &str) -> Result<()> {
        if to == END || self.nodes.contains_key(to) {
            Ok(())
        } else {
            Err(GraphError::Validation(format!(
                "edge '{from}' -> '{to}' targets a node that does not exist"
            )))
        }
    }

    /// Resolve the node that runs after `from`, given the merged state and the step's
    /// optional `goto`.
    pub fn next_node(&self, from: &str, state: &Value, goto: Option<&str>) -> Result<NodeId> {
        let target = match goto {
            Some(node) => node.to_string(),
            None => self.follow_edges(from, state)?,
        };

        if target == END || self.nodes.contains_key(&target) {
            Ok(target)
        } else {
            Err(GraphError::UnknownRoute {
                from: from.to_string(),
                to: target,
            })
        }
    }

    fn follow_edges(&self, from: &str, state: &Value) -> Result<NodeId> {
        let edges = self.edges.get(from).map(Vec::as_slice).unwrap_or_default();

        for edge in edges {
            if let Edge::Conditional { router, branches } = edge {
                let key = router(state);
                if branches.is_empty() {
                    return Ok(key);
                }
                return branches.get(&key).cloned().ok_or(GraphError::UnknownRoute {
                    from: from.to_string(),
                    to: key,
                });
            }
        }

        Ok(edges
            .iter()
            .find_map(|edge| match edge {
                Edge::Direct(to) => Some(to.clone()),
                Edge::Conditional { .. } => None,
            })
            .unwrap_or_else(|| END.to_string()))
    }
}
