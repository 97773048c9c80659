//! # schemaflow-checkpoint - Durable, tenant-scoped run state
//!
//! Persistence for the schemaflow engine. A run writes one checkpoint after every step;
//! a crashed, restarted or paused run resumes from the newest one without re-executing
//! the work it already recorded.
//!
//! ## Core Concepts
//!
//! - [`CheckpointSaver`] - async storage contract (`get`, `put`, `put_writes`, `list`,
//!   `delete_thread`, `prune`)
//! - [`Checkpoint`] - immutable snapshot: channel versions plus materialized values
//! - [`ThreadRef`] - thread id, namespace and optional checkpoint pin
//! - [`TenantId`] - validated owner id every saver is bound to
//! - [`PendingWrite`] - step output recorded before the next checkpoint is committed
//! - [`TypedBlob`] - `(type, base64 payload)` encoding of one channel value
//!
//! ## Backends
//!
//! - [`InMemoryCheckpointSaver`] over a shared [`MemoryBackend`] - tests and embedding
//! - [`SqliteCheckpointSaver`] - `sqlx` SQLite with embedded migrations
//!
//! Both order checkpoints by a per-thread sequence number assigned at write time, not
//! by wall clock, so `list` is strictly newest-first even when timestamps collide.
//!
//! ## Example
//!
//! ```rust,no_run
//! use schemaflow_checkpoint::{
//!     Checkpoint, CheckpointMetadata, CheckpointSaver, InMemoryCheckpointSaver, ThreadRef,
//! };
//! use std::collections::HashMap;
//!
//! # async fn example() -> schemaflow_checkpoint::Result<()> {
//! let saver = InMemoryCheckpointSaver::new("org-1")?;
//! let thread = ThreadRef::new("design-session-1");
//!
//! let pinned = saver
//!     .put(&thread, Checkpoint::empty(), CheckpointMetadata::new(), HashMap::new())
//!     .await?;
//! assert!(saver.get(&pinned).await.is_some());
//! # Ok(())
//! # }
//! ```

pub mod checkpoint;
pub mod error;
pub mod memory;
pub mod serializer;
pub mod sqlite;
pub mod traits;

pub use checkpoint::{
    ChannelVersion, ChannelVersions, Checkpoint, CheckpointId, CheckpointMetadata,
    CheckpointSource, CheckpointTuple, CleanupPolicy, ListOptions, PendingWrite, TenantId,
    ThreadRef,
};
pub use error::{CheckpointError, Result};
pub use memory::{InMemoryCheckpointSaver, MemoryBackend};
pub use serializer::{JsonSerializer, SerializerProtocol, TypedBlob};
pub use sqlite::SqliteCheckpointSaver;
pub use traits::{CheckpointSaver, CheckpointStream};
