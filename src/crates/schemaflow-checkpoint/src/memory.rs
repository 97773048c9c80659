//! In-memory checkpoint store
//!
//! [`MemoryBackend`] holds the same three relations the SQLite store persists
//! (checkpoints, blobs, writes) behind one `tokio::sync::RwLock`. Each tenant gets its
//! own [`InMemoryCheckpointSaver`] view over a shared backend, which makes tenant
//! isolation observable in tests without a database.
//!
//! ```rust
//! use schemaflow_checkpoint::{CheckpointSaver, MemoryBackend, TenantId};
//!
//! let backend = MemoryBackend::new();
//! let acme = backend.saver(TenantId::new("acme").unwrap());
//! let globex = backend.saver(TenantId::new("globex").unwrap());
//! assert_ne!(acme.tenant(), globex.tenant());
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::{
    checkpoint::{
        ChannelVersions, Checkpoint, CheckpointMetadata, CheckpointTuple, CleanupPolicy,
        ListOptions, PendingWrite, TenantId, ThreadRef,
    },
    error::{CheckpointError, Result},
    serializer::{JsonSerializer, SerializerProtocol, TypedBlob},
    traits::{CheckpointSaver, CheckpointStream},
};

/// (tenant, thread, namespace)
type ThreadKey = (String, String, String);

/// (tenant, thread, namespace, channel, version)
type BlobKey = (String, String, String, String, u64);

/// (tenant, thread, namespace, checkpoint, task, idx, channel); ordering yields task then idx
type WriteKey = (String, String, String, String, String, i64, String);

#[derive(Debug, Clone)]
struct CheckpointRow {
    seq: u64,
    checkpoint: Checkpoint,
    metadata: CheckpointMetadata,
    parent_id: Option<String>,
    #[allow(dead_code)]
    created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Tables {
    /// Rows per thread namespace, ascending by `seq`
    checkpoints: HashMap<ThreadKey, Vec<CheckpointRow>>,
    blobs: HashMap<BlobKey, TypedBlob>,
    writes: BTreeMap<WriteKey, TypedBlob>,
}

/// Shared storage for any number of tenant-scoped savers.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A saver scoped to `tenant` over this backend.
    pub fn saver(&self, tenant: TenantId) -> InMemoryCheckpointSaver {
        InMemoryCheckpointSaver {
            backend: self.clone(),
            tenant,
            serde: JsonSerializer::new(),
            cleanup: CleanupPolicy::default(),
        }
    }

    pub async fn checkpoint_count(&self) -> usize {
        self.tables
            .read()
            .await
            .checkpoints
            .values()
            .map(Vec::len)
            .sum()
    }

    pub async fn blob_count(&self) -> usize {
        self.tables.read().await.blobs.len()
    }

    pub async fn write_count(&self) -> usize {
        self.tables.read().await.writes.len()
    }
}

/// Tenant-scoped view of a [`MemoryBackend`].
#[derive(Debug, Clone)]
pub struct InMemoryCheckpointSaver {
    backend: MemoryBackend,
    tenant: TenantId,
    serde: JsonSerializer,
    cleanup: CleanupPolicy,
}

impl InMemoryCheckpointSaver {
    /// Saver over a private backend. Fails with `MissingTenant` for a blank tenant.
    pub fn new(tenant: impl AsRef<str>) -> Result<Self> {
        Ok(MemoryBackend::new().saver(TenantId::new(tenant)?))
    }

    pub fn with_cleanup(mut self, cleanup: CleanupPolicy) -> Self {
        self.cleanup = cleanup;
        self
    }

    pub fn backend(&self) -> &MemoryBackend {
        &self.backend
    }

    fn thread_key(&self, thread: &ThreadRef) -> ThreadKey {
        (
            self.tenant.as_str().to_string(),
            thread.thread_id.clone(),
            thread.namespace.clone(),
        )
    }

    fn blob_key(&self, thread: &ThreadRef, channel: &str, version: u64) -> BlobKey {
        (
            self.tenant.as_str().to_string(),
            thread.thread_id.clone(),
            thread.namespace.clone(),
            channel.to_string(),
            version,
        )
    }

    /// Rebuild a tuple from a row: dereference blobs and attach writes.
    async fn materialize(&self, thread: &ThreadRef, row: CheckpointRow) -> Result<CheckpointTuple> {
        let tables = self.backend.tables.read().await;

        let mut checkpoint = row.checkpoint;
        let mut channel_values = HashMap::new();
        for (channel, version) in &checkpoint.channel_versions {
            let blob = tables
                .blobs
                .get(&self.blob_key(thread, channel, version.get()))
                .ok_or_else(|| CheckpointError::MissingBlob {
                    channel: channel.clone(),
                    version: version.get(),
                })?;
            if !blob.is_empty() {
                channel_values.insert(channel.clone(), self.serde.loads_typed(blob)?);
            }
        }
        checkpoint.channel_values = channel_values;

        let (tenant, thread_id, namespace) = self.thread_key(thread);
        let mut pending_writes = Vec::new();
        for ((t, th, ns, cp, task_id, idx, channel), blob) in tables.writes.iter() {
            if t == &tenant && th == &thread_id && ns == &namespace && cp == &checkpoint.id {
                pending_writes.push(PendingWrite {
                    task_id: task_id.clone(),
                    idx: *idx,
                    channel: channel.clone(),
                    value: self.serde.loads_typed(blob)?,
                });
            }
        }

        let pinned = thread.latest().with_checkpoint_id(checkpoint.id.clone());
        Ok(CheckpointTuple {
            thread: pinned,
            parent: row
                .parent_id
                .map(|parent_id| thread.latest().with_checkpoint_id(parent_id)),
            checkpoint,
            metadata: row.metadata,
            pending_writes,
        })
    }
}

#[async_trait]
impl CheckpointSaver for InMemoryCheckpointSaver {
    fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    async fn get_tuple(&self, thread: &ThreadRef) -> Result<Option<CheckpointTuple>> {
        thread.require_thread()?;
        let row = {
            let tables = self.backend.tables.read().await;
            let Some(rows) = tables.checkpoints.get(&self.thread_key(thread)) else {
                return Ok(None);
            };
            match &thread.checkpoint_id {
                Some(id) => rows.iter().find(|row| &row.checkpoint.id == id).cloned(),
                None => rows.last().cloned(),
            }
        };

        match row {
            Some(row) => Ok(Some(self.materialize(thread, row).await?)),
            None => Ok(None),
        }
    }

    async fn list(&self, thread: &ThreadRef, options: ListOptions) -> Result<CheckpointStream> {
        thread.require_thread()?;
        let rows: Vec<CheckpointRow> = {
            let tables = self.backend.tables.read().await;
            let rows = tables
                .checkpoints
                .get(&self.thread_key(thread))
                .cloned()
                .unwrap_or_default();

            let bound = match &options.before {
                Some(before) => Some(
                    rows.iter()
                        .find(|row| &row.checkpoint.id == before)
                        .map(|row| row.seq)
                        .ok_or_else(|| CheckpointError::NotFound(before.clone()))?,
                ),
                None => None,
            };

            rows.into_iter()
                .rev()
                .filter(|row| bound.map_or(true, |seq| row.seq < seq))
                .filter(|row| {
                    options
                        .filter
                        .as_ref()
                        .map_or(true, |filter| row.metadata.matches(filter))
                })
                .take(options.limit.unwrap_or(usize::MAX))
                .collect()
        };

        let saver = self.clone();
        let thread = thread.latest();
        let stream = stream::iter(rows).then(move |row| {
            let saver = saver.clone();
            let thread = thread.clone();
            async move { saver.materialize(&thread, row).await }
        });
        Ok(Box::pin(stream))
    }

    #[tracing::instrument(skip(self, checkpoint, metadata, new_versions), fields(tenant = %self.tenant, thread_id = %thread.thread_id))]
    async fn put(
        &self,
        thread: &ThreadRef,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
        new_versions: ChannelVersions,
    ) -> Result<ThreadRef> {
        thread.require_thread()?;

        let mut blobs = Vec::with_capacity(new_versions.len());
        for (channel, version) in &new_versions {
            let value = checkpoint
                .channel_values
                .get(channel)
                .cloned()
                .unwrap_or(Value::Null);
            blobs.push((
                self.blob_key(thread, channel, version.get()),
                self.serde.dumps_typed(&value)?,
            ));
        }

        {
            let mut tables = self.backend.tables.write().await;

            // Validate every blob before mutating anything so a conflict leaves no trace.
            for (key, blob) in &blobs {
                if let Some(existing) = tables.blobs.get(key) {
                    if existing != blob {
                        return Err(CheckpointError::BlobConflict {
                            channel: key.3.clone(),
                            version: key.4,
                        });
                    }
                }
            }
            for (key, blob) in blobs {
                tables.blobs.entry(key).or_insert(blob);
            }

            let rows = tables
                .checkpoints
                .entry(self.thread_key(thread))
                .or_default();
            let seq = rows.last().map_or(1, |row| row.seq + 1);
            rows.push(CheckpointRow {
                seq,
                checkpoint: checkpoint.without_values(),
                metadata,
                parent_id: thread.checkpoint_id.clone(),
                created_at: Utc::now(),
            });
            tracing::debug!(checkpoint_id = %checkpoint.id, seq, "checkpoint stored");
        }

        // The checkpoint is committed; a failed prune only delays retention.
        if self.cleanup.enabled {
            if let Err(error) = self.prune(thread, self.cleanup.retained()).await {
                tracing::warn!(
                    thread_id = %thread.thread_id,
                    checkpoint_id = %checkpoint.id,
                    %error,
                    "checkpoint cleanup failed"
                );
            }
        }

        Ok(thread.latest().with_checkpoint_id(checkpoint.id))
    }

    async fn put_writes(
        &self,
        thread: &ThreadRef,
        writes: Vec<(String, Value)>,
        task_id: &str,
    ) -> Result<()> {
        thread.require_thread()?;
        if writes.is_empty() {
            return Ok(());
        }
        let checkpoint_id = thread.require_checkpoint()?.to_string();

        let mut encoded = Vec::with_capacity(writes.len());
        for (idx, (channel, value)) in writes.into_iter().enumerate() {
            let key: WriteKey = (
                self.tenant.as_str().to_string(),
                thread.thread_id.clone(),
                thread.namespace.clone(),
                checkpoint_id.clone(),
                task_id.to_string(),
                idx as i64,
                channel,
            );
            encoded.push((key, self.serde.dumps_typed(&value)?));
        }

        let mut tables = self.backend.tables.write().await;
        for (key, blob) in encoded {
            tables.writes.insert(key, blob);
        }
        Ok(())
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        if thread_id.trim().is_empty() {
            return Err(CheckpointError::InvalidThread("thread_id is required".into()));
        }
        let tenant = self.tenant.as_str();
        let mut tables = self.backend.tables.write().await;
        tables
            .writes
            .retain(|key, _| !(key.0 == tenant && key.1 == thread_id));
        tables
            .blobs
            .retain(|key, _| !(key.0 == tenant && key.1 == thread_id));
        tables
            .checkpoints
            .retain(|key, _| !(key.0 == tenant && key.1 == thread_id));
        tracing::info!(tenant, thread_id, "thread deleted");
        Ok(())
    }

    async fn prune(&self, thread: &ThreadRef, keep: usize) -> Result<usize> {
        thread.require_thread()?;
        let key = self.thread_key(thread);
        let mut tables = self.backend.tables.write().await;

        let Some(rows) = tables.checkpoints.get_mut(&key) else {
            return Ok(0);
        };
        if rows.len() <= keep {
            return Ok(0);
        }
        let removed: Vec<CheckpointRow> = rows.drain(..rows.len() - keep).collect();
        let referenced: HashSet<(String, u64)> = rows
            .iter()
            .flat_map(|row| {
                row.checkpoint
                    .channel_versions
                    .iter()
                    .map(|(channel, version)| (channel.clone(), version.get()))
            })
            .collect();
        let removed_ids: HashSet<String> = removed
            .iter()
            .map(|row| row.checkpoint.id.clone())
            .collect();

        let (tenant, thread_id, namespace) = key;
        tables.writes.retain(|k, _| {
            !(k.0 == tenant && k.1 == thread_id && k.2 == namespace && removed_ids.contains(&k.3))
        });
        tables.blobs.retain(|k, _| {
            !(k.0 == tenant
                && k.1 == thread_id
                && k.2 == namespace
                && !referenced.contains(&(k.3.clone(), k.4)))
        });

        tracing::debug!(thread_id = %thread_id, removed = removed.len(), "pruned checkpoints");
        Ok(removed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{ChannelVersion, CheckpointSource};
    use futures::TryStreamExt;
    use serde_json::json;

    fn checkpoint_with(values: &[(&str, Value, u64)]) -> (Checkpoint, ChannelVersions) {
        let mut channel_values = HashMap::new();
        let mut versions = HashMap::new();
        for (channel, value, version) in values {
            channel_values.insert(channel.to_string(), value.clone());
            versions.insert(channel.to_string(), ChannelVersion(*version));
        }
        (Checkpoint::new(channel_values, versions.clone()), versions)
    }

    #[test]
    fn test_new_rejects_blank_tenant() {
        assert!(matches!(
            InMemoryCheckpointSaver::new(" "),
            Err(CheckpointError::MissingTenant)
        ));
    }

    #[tokio::test]
    async fn test_put_and_get_round_trip() {
        let saver = InMemoryCheckpointSaver::new("org-1").unwrap();
        let thread = ThreadRef::new("thread-1");
        let (checkpoint, versions) =
            checkpoint_with(&[("schema", json!({"tables": {}}), 1), ("messages", json!(["hi"]), 1)]);

        let saved = saver
            .put(&thread, checkpoint.clone(), CheckpointMetadata::new(), versions)
            .await
            .unwrap();
        assert_eq!(saved.checkpoint_id.as_deref(), Some(checkpoint.id.as_str()));

        let tuple = saver.get_tuple(&thread).await.unwrap().unwrap();
        assert_eq!(tuple.checkpoint.channel_values, checkpoint.channel_values);
        assert!(tuple.parent.is_none());
    }

    #[tokio::test]
    async fn test_unchanged_channels_reuse_blobs() {
        let saver = InMemoryCheckpointSaver::new("org-1").unwrap();
        let thread = ThreadRef::new("thread-1");

        let (first, versions) =
            checkpoint_with(&[("schema", json!({"v": 1}), 1), ("messages", json!([]), 1)]);
        let pinned = saver
            .put(&thread, first, CheckpointMetadata::new(), versions)
            .await
            .unwrap();

        let (second, _) =
            checkpoint_with(&[("schema", json!({"v": 2}), 2), ("messages", json!([]), 1)]);
        let mut changed = HashMap::new();
        changed.insert("schema".to_string(), ChannelVersion(2));
        saver
            .put(&pinned, second, CheckpointMetadata::new(), changed)
            .await
            .unwrap();

        assert_eq!(saver.backend().blob_count().await, 3);
        let latest = saver.get_tuple(&thread).await.unwrap().unwrap();
        assert_eq!(latest.checkpoint.channel_values["schema"], json!({"v": 2}));
        assert_eq!(latest.checkpoint.channel_values["messages"], json!([]));
        assert_eq!(latest.parent, Some(pinned));
    }

    #[tokio::test]
    async fn test_identical_blob_rewrite_is_noop_and_conflict_rejected() {
        let saver = InMemoryCheckpointSaver::new("org-1").unwrap();
        let thread = ThreadRef::new("thread-1");

        let (first, versions) = checkpoint_with(&[("schema", json!({"v": 1}), 1)]);
        saver
            .put(&thread, first, CheckpointMetadata::new(), versions.clone())
            .await
            .unwrap();

        let (again, _) = checkpoint_with(&[("schema", json!({"v": 1}), 1)]);
        saver
            .put(&thread, again, CheckpointMetadata::new(), versions.clone())
            .await
            .unwrap();
        assert_eq!(saver.backend().blob_count().await, 1);

        let (conflicting, _) = checkpoint_with(&[("schema", json!({"v": "other"}), 1)]);
        let err = saver
            .put(&thread, conflicting, CheckpointMetadata::new(), versions)
            .await
            .unwrap_err();
        assert!(matches!(err, CheckpointError::BlobConflict { version: 1, .. }));
        assert_eq!(saver.backend().checkpoint_count().await, 2);
    }

    #[tokio::test]
    async fn test_missing_blob_reads_as_not_found() {
        let saver = InMemoryCheckpointSaver::new("org-1").unwrap();
        let thread = ThreadRef::new("thread-1");
        let (checkpoint, _) = checkpoint_with(&[("schema", json!({"v": 1}), 7)]);

        saver
            .put(&thread, checkpoint, CheckpointMetadata::new(), HashMap::new())
            .await
            .unwrap();

        let err = saver.get_tuple(&thread).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(saver.get(&thread).await.is_none());
    }

    #[tokio::test]
    async fn test_list_is_newest_first_with_parent_chain() {
        let saver = InMemoryCheckpointSaver::new("org-1").unwrap();
        let mut thread = ThreadRef::new("thread-1");
        let mut ids = Vec::new();
        for step in 0..4 {
            let (checkpoint, versions) = checkpoint_with(&[("n", json!(step), step as u64 + 1)]);
            ids.push(checkpoint.id.clone());
            let metadata = CheckpointMetadata::new()
                .with_source(CheckpointSource::Loop)
                .with_step(step);
            thread = saver.put(&thread, checkpoint, metadata, versions).await.unwrap();
        }

        let listed: Vec<CheckpointTuple> = saver
            .list(&ThreadRef::new("thread-1"), ListOptions::new())
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        let listed_ids: Vec<String> = listed.iter().map(|t| t.checkpoint.id.clone()).collect();
        let mut expected = ids.clone();
        expected.reverse();
        assert_eq!(listed_ids, expected);
        for pair in listed.windows(2) {
            assert_eq!(
                pair[0].parent.as_ref().and_then(|p| p.checkpoint_id.clone()),
                Some(pair[1].checkpoint.id.clone())
            );
        }

        let page: Vec<CheckpointTuple> = saver
            .list(
                &ThreadRef::new("thread-1"),
                ListOptions::new().with_before(ids[2].clone()).with_limit(1),
            )
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].checkpoint.id, ids[1]);

        let filtered: Vec<CheckpointTuple> = saver
            .list(
                &ThreadRef::new("thread-1"),
                ListOptions::new().with_filter("step", json!(3)),
            )
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].checkpoint.id, ids[3]);
    }

    #[tokio::test]
    async fn test_pending_writes_are_idempotent_per_index() {
        let saver = InMemoryCheckpointSaver::new("org-1").unwrap();
        let thread = ThreadRef::new("thread-1");
        let (checkpoint, versions) = checkpoint_with(&[("n", json!(0), 1)]);
        let pinned = saver
            .put(&thread, checkpoint, CheckpointMetadata::new(), versions)
            .await
            .unwrap();

        let writes = vec![("schema".to_string(), json!({"v": 1})), ("messages".to_string(), json!(["a"]))];
        saver.put_writes(&pinned, writes.clone(), "1:design").await.unwrap();
        saver.put_writes(&pinned, writes, "1:design").await.unwrap();
        saver.put_writes(&pinned, Vec::new(), "1:design").await.unwrap();
        assert_eq!(saver.backend().write_count().await, 2);

        let tuple = saver.get_tuple(&pinned).await.unwrap().unwrap();
        let channels: Vec<&str> = tuple.pending_writes.iter().map(|w| w.channel.as_str()).collect();
        assert_eq!(channels, vec!["schema", "messages"]);

        let unpinned = saver
            .put_writes(&thread, vec![("x".to_string(), json!(1))], "t")
            .await;
        assert!(matches!(unpinned, Err(CheckpointError::InvalidThread(_))));
    }

    #[tokio::test]
    async fn test_tenants_are_isolated() {
        let backend = MemoryBackend::new();
        let acme = backend.saver(TenantId::new("acme").unwrap());
        let globex = backend.saver(TenantId::new("globex").unwrap());
        let thread = ThreadRef::new("shared-thread-id");

        let (checkpoint, versions) = checkpoint_with(&[("secret", json!("acme-only"), 1)]);
        acme.put(&thread, checkpoint, CheckpointMetadata::new(), versions)
            .await
            .unwrap();

        assert!(globex.get_tuple(&thread).await.unwrap().is_none());
        let listed: Vec<CheckpointTuple> = globex
            .list(&thread, ListOptions::new())
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert!(listed.is_empty());

        globex.delete_thread("shared-thread-id").await.unwrap();
        assert!(acme.get_tuple(&thread).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_thread_cascades_all_namespaces() {
        let saver = InMemoryCheckpointSaver::new("org-1").unwrap();
        for namespace in ["", "validation"] {
            let thread = ThreadRef::new("thread-1").with_namespace(namespace);
            let (checkpoint, versions) = checkpoint_with(&[("n", json!(1), 1)]);
            let pinned = saver
                .put(&thread, checkpoint, CheckpointMetadata::new(), versions)
                .await
                .unwrap();
            saver
                .put_writes(&pinned, vec![("n".to_string(), json!(2))], "t")
                .await
                .unwrap();
        }

        saver.delete_thread("thread-1").await.unwrap();
        assert_eq!(saver.backend().checkpoint_count().await, 0);
        assert_eq!(saver.backend().blob_count().await, 0);
        assert_eq!(saver.backend().write_count().await, 0);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_latest_and_referenced_blobs() {
        let saver = InMemoryCheckpointSaver::new("org-1")
            .unwrap()
            .with_cleanup(CleanupPolicy::keep_latest(2));
        let mut thread = ThreadRef::new("thread-1");
        for step in 1..=4u64 {
            let (checkpoint, mut versions) =
                checkpoint_with(&[("constant", json!("same"), 1), ("n", json!(step), step)]);
            if step > 1 {
                versions.remove("constant");
            }
            thread = saver
                .put(&thread, checkpoint, CheckpointMetadata::new(), versions)
                .await
                .unwrap();
        }

        assert_eq!(saver.backend().checkpoint_count().await, 2);
        // "constant"@1 is still referenced, "n"@1 and "n"@2 are not
        assert_eq!(saver.backend().blob_count().await, 3);
        let latest = saver.get_tuple(&thread.latest()).await.unwrap().unwrap();
        assert_eq!(latest.checkpoint.channel_values["constant"], json!("same"));
        assert_eq!(latest.checkpoint.channel_values["n"], json!(4));
    }

    #[tokio::test]
    async fn test_zero_retention_keeps_the_latest_checkpoint() {
        let saver = InMemoryCheckpointSaver::new("org-1")
            .unwrap()
            .with_cleanup(CleanupPolicy {
                enabled: true,
                max_checkpoints_per_thread: 0,
            });
        let mut thread = ThreadRef::new("thread-1");
        for step in 1..=3u64 {
            let (checkpoint, versions) = checkpoint_with(&[("n", json!(step), step)]);
            thread = saver
                .put(&thread, checkpoint, CheckpointMetadata::new(), versions)
                .await
                .unwrap();
        }

        assert_eq!(saver.backend().checkpoint_count().await, 1);
        let latest = saver.get(&thread.latest()).await.unwrap();
        assert_eq!(latest.thread.checkpoint_id, thread.checkpoint_id);
        assert_eq!(latest.checkpoint.channel_values["n"], json!(3));
    }
}
