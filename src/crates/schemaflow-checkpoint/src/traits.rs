//! The storage contract every checkpoint backend implements
//!
//! # Tenancy
//!
//! A saver is bound to exactly one [`TenantId`] at construction. Nothing in this trait
//! takes a tenant parameter: every read and write is scoped by the saver's own tenant,
//! so two savers for different tenants over the same backing store never observe each
//! other's threads, even when thread ids collide.
//!
//! # Read semantics
//!
//! [`get_tuple`](CheckpointSaver::get_tuple) reports backend failures as errors, which is
//! what diagnostics and tests want. The engine calls [`get`](CheckpointSaver::get)
//! instead, which fails closed: any error, including a checkpoint whose blobs are
//! missing, is logged and reported as "not found".
//!
//! # Write semantics
//!
//! ```text
//!   step N finishes
//!        │
//!        ├── put_writes(thread@cp_{N-1}, writes, "N:node")   pending, recoverable
//!        │
//!        └── put(thread@cp_{N-1}, cp_N, metadata, new_versions)
//!               ├── upsert blobs for new_versions only
//!               └── append checkpoint row, parent = cp_{N-1}
//! ```

use async_trait::async_trait;
use futures::stream::Stream;
use serde_json::Value;
use std::pin::Pin;

use crate::{
    checkpoint::{
        ChannelVersions, Checkpoint, CheckpointMetadata, CheckpointTuple, ListOptions, TenantId,
        ThreadRef,
    },
    error::Result,
};

/// Lazy, finite, newest-first sequence of checkpoints.
pub type CheckpointStream = Pin<Box<dyn Stream<Item = Result<CheckpointTuple>> + Send + 'static>>;

#[async_trait]
pub trait CheckpointSaver: Send + Sync {
    /// Tenant every operation of this saver is scoped to.
    fn tenant(&self) -> &TenantId;

    /// Fail-closed read used by the engine.
    ///
    /// Returns the checkpoint pinned by `thread.checkpoint_id`, or the thread's newest
    /// checkpoint when no id is given. Store errors are logged and mapped to `None`.
    async fn get(&self, thread: &ThreadRef) -> Option<CheckpointTuple> {
        match self.get_tuple(thread).await {
            Ok(found) => found,
            Err(error) => {
                tracing::warn!(
                    tenant = %self.tenant(),
                    thread_id = %thread.thread_id,
                    namespace = %thread.namespace,
                    %error,
                    "checkpoint read failed; treating as not found"
                );
                None
            }
        }
    }

    /// Fetch a checkpoint with its channel values and pending writes.
    async fn get_tuple(&self, thread: &ThreadRef) -> Result<Option<CheckpointTuple>>;

    /// Newest-first history of a thread namespace.
    ///
    /// `options.before` bounds the sequence to checkpoints older than the given id,
    /// `options.filter` keeps only checkpoints whose metadata matches every key.
    async fn list(&self, thread: &ThreadRef, options: ListOptions) -> Result<CheckpointStream>;

    /// Append a checkpoint.
    ///
    /// Only channels named in `new_versions` get a blob written; the rest of
    /// `checkpoint.channel_versions` must reference blobs written by earlier puts.
    /// The parent pointer is `thread.checkpoint_id`. Returns a reference pinned to
    /// the new checkpoint.
    async fn put(
        &self,
        thread: &ThreadRef,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
        new_versions: ChannelVersions,
    ) -> Result<ThreadRef>;

    /// Record a task's output against `thread.checkpoint_id` before the next commit.
    ///
    /// `idx` is each write's position in `writes`. Re-submitting the same
    /// `(checkpoint, task, channel, idx)` overwrites; an empty list does nothing.
    async fn put_writes(
        &self,
        thread: &ThreadRef,
        writes: Vec<(String, Value)>,
        task_id: &str,
    ) -> Result<()>;

    /// Remove every namespace of a thread: writes, then blobs, then checkpoints.
    async fn delete_thread(&self, thread_id: &str) -> Result<()>;

    /// Keep the newest `keep` checkpoints of a thread namespace and drop the rest,
    /// including their writes and any blob no remaining checkpoint references.
    /// Returns the number of checkpoints removed.
    async fn prune(&self, thread: &ThreadRef, keep: usize) -> Result<usize>;
}
