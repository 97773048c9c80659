//! CompiledGraph execution engine
//!
//! Once a [`StateGraph`](crate::StateGraph) is compiled it becomes a [`CompiledGraph`]:
//! an immutable, cheaply cloneable graph that can run any number of threads.
//!
//! # Execution Modes
//!
//! - [`invoke`](CompiledGraph::invoke) runs a fresh thread to completion
//! - [`resume`](CompiledGraph::resume) continues a thread from its last checkpoint
//! - [`stream`](CompiledGraph::stream) runs in the background and yields [`RunEvent`](crate::RunEvent)s
//! - [`execute`](CompiledGraph::execute) takes an explicit cancellation token and event sink
//!
//! # Durability
//!
//! With a checkpointer attached, every completed step produces exactly one checkpoint
//! whose metadata records the next scheduled node. A process that dies mid-run can be
//! resumed from the store alone.

mod execution;
mod graph;
mod state;
mod streaming;
mod types;
#[cfg(test)]
mod tests;

pub use graph::CompiledGraph;
pub use streaming::RunHandle;
pub use types::{EventStream, RunOutcome, RunStart, StateSnapshot, StateSnapshotStream};
