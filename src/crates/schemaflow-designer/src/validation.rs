//! Bounded validate-and-retry loops kept in state
//!
//! A validation rejection is not an error. The validating step records it through a
//! [`ValidationLoop`]: the counter in the shared `retry_count` map goes up, the reason
//! is stored for the next proposal, and the router sends the run back to the proposing
//! node until the attempt budget is spent. Because all of this lives in checkpointed
//! channels, a resumed run continues with the same count and the same last failure.
//!
//! ```text
//!            ┌──── retry ────┐
//!            ▼               │
//!        propose ──▶ validate ──── success ──▶ on_success
//!                            └──── exhausted ─▶ on_exhausted
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use schemaflow_core::state::{MergeMapReducer, OverwriteReducer, StateSchema};
use schemaflow_core::NodeId;

/// Shared by every loop; one key per loop.
pub const RETRY_COUNT_CHANNEL: &str = "retry_count";

pub const ROUTE_RETRY: &str = "retry";
pub const ROUTE_SUCCESS: &str = "success";
pub const ROUTE_EXHAUSTED: &str = "exhausted";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStatus {
    #[default]
    Pending,
    Retrying,
    Passed,
    Exhausted,
}

/// What a recorded failure means for the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Retry,
    Exhausted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationLoop {
    pub key: String,
    pub max_attempts: u32,
    pub propose: NodeId,
    pub on_success: NodeId,
    pub on_exhausted: NodeId,
}

impl ValidationLoop {
    pub fn new(
        key: impl Into<String>,
        max_attempts: u32,
        propose: impl Into<NodeId>,
        on_success: impl Into<NodeId>,
        on_exhausted: impl Into<NodeId>,
    ) -> Self {
        Self {
            key: key.into(),
            max_attempts,
            propose: propose.into(),
            on_success: on_success.into(),
            on_exhausted: on_exhausted.into(),
        }
    }

    pub fn failure_channel(&self) -> String {
        format!("{}_failure", self.key)
    }

    pub fn status_channel(&self) -> String {
        format!("{}_status", self.key)
    }

    pub fn exhausted_channel(&self) -> String {
        format!("{}_exhausted", self.key)
    }

    /// Channels this loop reads and writes.
    pub fn channels(&self) -> StateSchema {
        StateSchema::new()
            .channel(RETRY_COUNT_CHANNEL, MergeMapReducer, Value::Object(Map::new()))
            .channel(self.failure_channel(), OverwriteReducer, Value::Null)
            .channel(self.status_channel(), OverwriteReducer, Value::from("pending"))
            .channel(self.exhausted_channel(), OverwriteReducer, Value::Bool(false))
    }

    pub fn retry_count(&self, state: &Value) -> u32 {
        state[RETRY_COUNT_CHANNEL][&self.key]
            .as_u64()
            .and_then(|count| u32::try_from(count).ok())
            .unwrap_or(0)
    }

    pub fn status(&self, state: &Value) -> LoopStatus {
        serde_json::from_value(state[self.status_channel()].clone()).unwrap_or_default()
    }

    pub fn is_exhausted(&self, state: &Value) -> bool {
        state[self.exhausted_channel()].as_bool().unwrap_or(false)
    }

    /// Reason recorded by the latest failure, while the loop is retrying.
    pub fn pending_failure(&self, state: &Value) -> Option<Value> {
        match self.status(state) {
            LoopStatus::Retrying => state
                .get(self.failure_channel())
                .filter(|reason| !reason.is_null())
                .cloned(),
            _ => None,
        }
    }

    /// Count a failure and decide whether another attempt is allowed.
    pub fn record_failure(&self, state: &Value, reason: Value) -> (Value, Verdict) {
        let count = self.retry_count(state) + 1;
        let verdict = if count < self.max_attempts {
            Verdict::Retry
        } else {
            Verdict::Exhausted
        };

        let mut counts = Map::new();
        counts.insert(self.key.clone(), Value::from(count));

        let mut update = Map::new();
        update.insert(RETRY_COUNT_CHANNEL.to_string(), Value::Object(counts));
        update.insert(self.failure_channel(), reason);
        match verdict {
            Verdict::Retry => {
                update.insert(self.status_channel(), Value::from("retrying"));
            }
            Verdict::Exhausted => {
                update.insert(self.status_channel(), Value::from("exhausted"));
                update.insert(self.exhausted_channel(), Value::Bool(true));
            }
        }
        (Value::Object(update), verdict)
    }

    /// The counter is left as is, so it still tells how many attempts failed.
    pub fn record_success(&self, _state: &Value) -> Value {
        let mut update = Map::new();
        update.insert(self.status_channel(), Value::from("passed"));
        Value::Object(update)
    }

    pub fn route(&self, state: &Value) -> String {
        let route = if self.is_exhausted(state) {
            ROUTE_EXHAUSTED
        } else if self.status(state) == LoopStatus::Passed {
            ROUTE_SUCCESS
        } else {
            ROUTE_RETRY
        };
        route.to_string()
    }

    pub fn branches(&self) -> HashMap<String, NodeId> {
        HashMap::from([
            (ROUTE_RETRY.to_string(), self.propose.clone()),
            (ROUTE_SUCCESS.to_string(), self.on_success.clone()),
            (ROUTE_EXHAUSTED.to_string(), self.on_exhausted.clone()),
        ])
    }
}
