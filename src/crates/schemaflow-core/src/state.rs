//! Shared state model - channels and their reducers
//!
//! Run state is a JSON object. Each top-level key is a **channel** with a reducer that
//! folds a step's partial output into the running value, and a default used while the
//! channel has never been written.
//!
//! Reducers are total: there is no error path. An update a reducer cannot interpret
//! (wrong shape, `null`) leaves the previous value untouched, so a step that is
//! retried can always submit a superseding value without wedging the run. Reducers
//! are also pure, which makes replaying them during crash recovery safe.
//!
//! | Reducer | `null` update | matching update | other update |
//! |---|---|---|---|
//! | [`OverwriteReducer`] | keep previous | replace | replace |
//! | [`AppendReducer`] | keep previous | concatenate arrays | keep previous |
//! | [`MergeMapReducer`] | keep previous | merge objects key by key | keep previous |
//!
//! ```rust
//! use schemaflow_core::state::{AppendReducer, MergeMapReducer, StateSchema};
//! use serde_json::json;
//!
//! let schema = StateSchema::new()
//!     .channel("messages", AppendReducer, json!([]))
//!     .channel("retry_count", MergeMapReducer, json!({}));
//!
//! let mut state = schema.initial_state(&json!({"messages": ["hello"]}));
//! schema.apply(&mut state, &json!({"messages": ["again"], "retry_count": {"validate": 1}}));
//!
//! assert_eq!(state["messages"], json!(["hello", "again"]));
//! assert_eq!(state["retry_count"], json!({"validate": 1}));
//! ```

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Pure, total merge of a channel update into its previous value.
pub trait Reducer: Send + Sync {
    fn reduce(&self, previous: &Value, update: &Value) -> Value;

    fn name(&self) -> &'static str;
}

/// Last write wins; `null` leaves the previous value.
#[derive(Debug, Clone, Copy, Default)]
pub struct OverwriteReducer;

impl Reducer for OverwriteReducer {
    fn reduce(&self, previous: &Value, update: &Value) -> Value {
        if update.is_null() {
            previous.clone()
        } else {
            update.clone()
        }
    }

    fn name(&self) -> &'static str {
        "overwrite"
    }
}

/// Concatenation of arrays. Nothing is ever removed.
#[derive(Debug, Clone, Copy, Default)]
pub struct AppendReducer;

impl Reducer for AppendReducer {
    fn reduce(&self, previous: &Value, update: &Value) -> Value {
        let Value::Array(items) = update else {
            return previous.clone();
        };
        let mut merged = match previous {
            Value::Array(existing) => existing.clone(),
            _ => Vec::with_capacity(items.len()),
        };
        merged.extend(items.iter().cloned());
        Value::Array(merged)
    }

    fn name(&self) -> &'static str {
        "append"
    }
}

/// Key-by-key object merge, update wins. Used for counters keyed by step name.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeMapReducer;

impl Reducer for MergeMapReducer {
    fn reduce(&self, previous: &Value, update: &Value) -> Value {
        let Value::Object(entries) = update else {
            return previous.clone();
        };
        let mut merged = match previous {
            Value::Object(existing) => existing.clone(),
            _ => Map::new(),
        };
        for (key, value) in entries {
            merged.insert(key.clone(), value.clone());
        }
        Value::Object(merged)
    }

    fn name(&self) -> &'static str {
        "merge_map"
    }
}

/// One declared channel.
#[derive(Clone)]
pub struct ChannelSpec {
    pub name: String,
    pub reducer: Arc<dyn Reducer>,
    pub default: Value,
}

impl fmt::Debug for ChannelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSpec")
            .field("name", &self.name)
            .field("reducer", &self.reducer.name())
            .field("default", &self.default)
            .finish()
    }
}

/// The set of channels a graph's state is made of.
///
/// Keys that were never declared are still accepted and use overwrite semantics with a
/// `null` default.
#[derive(Debug, Clone, Default)]
pub struct StateSchema {
    channels: BTreeMap<String, ChannelSpec>,
}

impl StateSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel(
        mut self,
        name: impl Into<String>,
        reducer: impl Reducer + 'static,
        default: Value,
    ) -> Self {
        self.add_channel(name, reducer, default);
        self
    }

    pub fn add_channel(
        &mut self,
        name: impl Into<String>,
        reducer: impl Reducer + 'static,
        default: Value,
    ) -> &mut Self {
        let name = name.into();
        self.channels.insert(
            name.clone(),
            ChannelSpec {
                name,
                reducer: Arc::new(reducer),
                default,
            },
        );
        self
    }

    /// Add every channel of `other` that is not declared here yet.
    pub fn extend(&mut self, other: &StateSchema) {
        for (name, spec) in &other.channels {
            self.channels
                .entry(name.clone())
                .or_insert_with(|| spec.clone());
        }
    }

    pub fn get(&self, channel: &str) -> Option<&ChannelSpec> {
        self.channels.get(channel)
    }

    pub fn channel_names(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
    }

    pub fn default_value(&self, channel: &str) -> Value {
        self.channels
            .get(channel)
            .map(|spec| spec.default.clone())
            .unwrap_or(Value::Null)
    }

    pub fn merge(&self, channel: &str, previous: &Value, update: &Value) -> Value {
        match self.channels.get(channel) {
            Some(spec) => spec.reducer.reduce(previous, update),
            None => OverwriteReducer.reduce(previous, update),
        }
    }

    /// Every declared default, with `input` applied on top through the reducers.
    pub fn initial_state(&self, input: &Value) -> Value {
        let defaults: Map<String, Value> = self
            .channels
            .values()
            .map(|spec| (spec.name.clone(), spec.default.clone()))
            .collect();
        let mut state = Value::Object(defaults);
        self.apply(&mut state, input);
        state
    }

    /// Fold `partial` into `state`. Returns the channels whose value changed, sorted.
    ///
    /// A non-object `partial` is a no-op. A non-object `state` is replaced by the
    /// defaults first.
    pub fn apply(&self, state: &mut Value, partial: &Value) -> Vec<String> {
        let Value::Object(updates) = partial else {
            return Vec::new();
        };
        if !state.is_object() {
            *state = self.initial_state(&Value::Null);
        }
        let Some(values) = state.as_object_mut() else {
            return Vec::new();
        };

        let mut changed = Vec::new();
        for (channel, update) in updates {
            let previous = values
                .get(channel)
                .cloned()
                .unwrap_or_else(|| self.default_value(channel));
            let merged = self.merge(channel, &previous, update);
            if values.get(channel) != Some(&merged) {
                changed.push(channel.clone());
                values.insert(channel.clone(), merged);
            }
        }
        changed.sort();
        changed
    }
}
