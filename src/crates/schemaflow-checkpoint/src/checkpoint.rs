//! Core checkpoint data structures for durable run state
//!
//! This module defines the value types every store speaks: **[`Checkpoint`]**,
//! **[`ThreadRef`]**, **[`CheckpointMetadata`]**, **[`PendingWrite`]** and
//! **[`CheckpointTuple`]**.
//!
//! # Overview
//!
//! A checkpoint is an immutable snapshot taken after a step completes. Stores do not
//! persist `channel_values` inline: each changed channel is written once as a blob keyed
//! by `(tenant, thread, namespace, channel, version)` and the checkpoint row only keeps the
//! `channel_versions` map. Reading a checkpoint dereferences every version back into a value.
//!
//! ```text
//! ┌──────────────────────────────┐      ┌────────────────────────────────┐
//! │ checkpoint #3                │      │ blobs                          │
//! │  channel_versions:           │      │  (schema,   1) -> {...}        │
//! │    schema     -> 2  ─────────┼────▶ │  (schema,   2) -> {...}        │
//! │    messages   -> 1  ─────────┼────▶ │  (messages, 1) -> [...]        │
//! │  parent: checkpoint #2       │      └────────────────────────────────┘
//! └──────────────────────────────┘
//! ```
//!
//! Unchanged channels keep pointing at the version an earlier checkpoint wrote, so a run
//! that touches one channel per step writes one blob per step.
//!
//! # Thread references
//!
//! ```rust
//! use schemaflow_checkpoint::ThreadRef;
//!
//! // Latest checkpoint of a thread
//! let latest = ThreadRef::new("design-42");
//!
//! // A specific checkpoint inside a nested namespace
//! let pinned = ThreadRef::new("design-42")
//!     .with_namespace("validation")
//!     .with_checkpoint_id("7f0c...");
//! assert_eq!(pinned.namespace, "validation");
//! assert!(latest.checkpoint_id.is_none());
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::error::{CheckpointError, Result};

pub type CheckpointId = String;

/// Monotonic per-channel version. The first write of a channel is version 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelVersion(pub u64);

impl ChannelVersion {
    pub const INITIAL: ChannelVersion = ChannelVersion(1);

    pub fn next(self) -> Self {
        ChannelVersion(self.0 + 1)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub type ChannelVersions = HashMap<String, ChannelVersion>;

/// Identity of the organization that owns a set of threads.
///
/// Construction trims the input and rejects blank values, so a store holding a
/// `TenantId` can never issue an unscoped statement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl AsRef<str>) -> Result<Self> {
        let trimmed = id.as_ref().trim();
        if trimmed.is_empty() {
            return Err(CheckpointError::MissingTenant);
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TenantId {
    type Error = CheckpointError;

    fn try_from(value: String) -> Result<Self> {
        TenantId::new(value)
    }
}

impl From<TenantId> for String {
    fn from(tenant: TenantId) -> Self {
        tenant.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a checkpoint came to exist.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointSource {
    /// Written from caller-supplied input before the first step
    Input,
    /// Written by the engine after a step completed
    Loop,
    /// Written by an external state update
    Update,
    /// Copied from another checkpoint
    Fork,
}

/// Free-form metadata stored beside each checkpoint.
///
/// `extra` is flattened on the wire, so `list` filters can match both the named
/// fields and any custom key with the same equality test.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CheckpointMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<CheckpointSource>,

    /// Step index, `-1` for input checkpoints
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<i64>,

    /// Step whose output produced this checkpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,

    /// Step scheduled to run after this checkpoint (`__end__` once finished)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CheckpointMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, source: CheckpointSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_step(mut self, step: i64) -> Self {
        self.step = Some(step);
        self
    }

    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    pub fn with_next(mut self, next: impl Into<String>) -> Self {
        self.next = Some(next.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Equality match of every filter key against the serialized metadata.
    pub fn matches(&self, filter: &Map<String, Value>) -> bool {
        let Ok(Value::Object(fields)) = serde_json::to_value(self) else {
            return false;
        };
        filter
            .iter()
            .all(|(key, expected)| fields.get(key) == Some(expected))
    }
}

/// Immutable snapshot of run state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    /// Format version
    pub v: i32,

    pub id: CheckpointId,

    pub ts: DateTime<Utc>,

    /// Materialized values; stores rebuild this from blobs and never persist it inline
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub channel_values: HashMap<String, Value>,

    pub channel_versions: ChannelVersions,

    /// Channels whose version changed in the step that produced this checkpoint
    #[serde(default)]
    pub updated_channels: Vec<String>,

    /// Highest channel version ever issued on this thread when the checkpoint was taken.
    /// New versions are drawn above it so forked branches never reuse a blob key.
    #[serde(default)]
    pub version_clock: u64,
}

impl Checkpoint {
    pub const CURRENT_VERSION: i32 = 1;

    pub fn new(channel_values: HashMap<String, Value>, channel_versions: ChannelVersions) -> Self {
        Self {
            v: Self::CURRENT_VERSION,
            id: Uuid::new_v4().to_string(),
            ts: Utc::now(),
            channel_values,
            channel_versions,
            updated_channels: Vec::new(),
            version_clock: 0,
        }
    }

    pub fn empty() -> Self {
        Self::new(HashMap::new(), HashMap::new())
    }

    pub fn with_updated_channels(mut self, channels: Vec<String>) -> Self {
        self.updated_channels = channels;
        self
    }

    pub fn with_version_clock(mut self, clock: u64) -> Self {
        self.version_clock = clock;
        self
    }

    /// Highest version this checkpoint knows about, from its clock or its own channels.
    pub fn max_version(&self) -> u64 {
        self.channel_versions
            .values()
            .map(|version| version.get())
            .max()
            .unwrap_or(0)
            .max(self.version_clock)
    }

    /// Copy without channel values, the shape persisted in checkpoint rows.
    pub fn without_values(&self) -> Self {
        Self {
            channel_values: HashMap::new(),
            ..self.clone()
        }
    }
}

/// Addresses a thread, optionally pinned to one checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ThreadRef {
    pub thread_id: String,

    #[serde(default)]
    pub namespace: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<CheckpointId>,
}

impl ThreadRef {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            namespace: String::new(),
            checkpoint_id: None,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_checkpoint_id(mut self, checkpoint_id: impl Into<CheckpointId>) -> Self {
        self.checkpoint_id = Some(checkpoint_id.into());
        self
    }

    /// Same thread and namespace, no checkpoint pin.
    pub fn latest(&self) -> Self {
        Self {
            checkpoint_id: None,
            ..self.clone()
        }
    }

    pub(crate) fn require_thread(&self) -> Result<()> {
        if self.thread_id.trim().is_empty() {
            return Err(CheckpointError::InvalidThread("thread_id is required".into()));
        }
        Ok(())
    }

    pub(crate) fn require_checkpoint(&self) -> Result<&str> {
        self.checkpoint_id.as_deref().ok_or_else(|| {
            CheckpointError::InvalidThread("checkpoint_id is required for pending writes".into())
        })
    }
}

/// One channel update recorded for a task before the next checkpoint is committed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingWrite {
    pub task_id: String,
    pub idx: i64,
    pub channel: String,
    pub value: Value,
}

/// Options for [`CheckpointSaver::list`](crate::CheckpointSaver::list).
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub limit: Option<usize>,
    /// Only checkpoints older than this one
    pub before: Option<CheckpointId>,
    /// Metadata equality filter
    pub filter: Option<Map<String, Value>>,
}

impl ListOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_before(mut self, checkpoint_id: impl Into<CheckpointId>) -> Self {
        self.before = Some(checkpoint_id.into());
        self
    }

    pub fn with_filter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.filter
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }
}

/// A checkpoint with everything needed to resume from it.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointTuple {
    /// Reference pinned to this checkpoint
    pub thread: ThreadRef,
    pub checkpoint: Checkpoint,
    pub metadata: CheckpointMetadata,
    pub parent: Option<ThreadRef>,
    /// Writes recorded against this checkpoint, ordered by task then index
    pub pending_writes: Vec<PendingWrite>,
}

/// Retention applied after each `put` when enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupPolicy {
    pub enabled: bool,
    pub max_checkpoints_per_thread: usize,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            max_checkpoints_per_thread: 50,
        }
    }
}

impl CleanupPolicy {
    /// Keep the newest `max_checkpoints_per_thread` checkpoints, never fewer than one.
    pub fn keep_latest(max_checkpoints_per_thread: usize) -> Self {
        Self {
            enabled: true,
            max_checkpoints_per_thread: max_checkpoints_per_thread.max(1),
        }
    }

    /// Checkpoints kept per thread. The latest checkpoint always survives, even when
    /// the policy was deserialized with a zero limit.
    pub fn retained(&self) -> usize {
        self.max_checkpoints_per_thread.max(1)
    }
}
