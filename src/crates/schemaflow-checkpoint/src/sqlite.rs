//! SQLite checkpoint store
//!
//! Persists the three relations from `migrations/`:
//!
//! | table | key |
//! |---|---|
//! | `checkpoints` | `(tenant_id, thread_id, checkpoint_ns, checkpoint_id)`, unique `seq` per thread namespace |
//! | `checkpoint_blobs` | `(tenant_id, thread_id, checkpoint_ns, channel, version)` |
//! | `checkpoint_writes` | `(tenant_id, thread_id, checkpoint_ns, checkpoint_id, task_id, channel, idx)` |
//!
//! Every statement binds the saver's tenant. `put` runs in one transaction (blobs,
//! then the checkpoint row), so a checkpoint is never visible without its blobs. Two
//! writers racing on the same thread cannot both claim a `seq`: the unique index
//! rejects the loser, whose step then fails with a store error.

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use crate::{
    checkpoint::{
        ChannelVersions, Checkpoint, CheckpointMetadata, CheckpointTuple, CleanupPolicy,
        ListOptions, PendingWrite, TenantId, ThreadRef,
    },
    error::{CheckpointError, Result},
    serializer::{JsonSerializer, SerializerProtocol, TypedBlob},
    traits::{CheckpointSaver, CheckpointStream},
};

/// Row of `checkpoints` without its blobs.
#[derive(Debug, Clone)]
struct CheckpointHeader {
    checkpoint_id: String,
    parent_checkpoint_id: Option<String>,
    checkpoint: String,
    metadata: String,
}

impl CheckpointHeader {
    fn from_row(row: &SqliteRow) -> Result<Self> {
        Ok(Self {
            checkpoint_id: row.try_get("checkpoint_id")?,
            parent_checkpoint_id: row.try_get("parent_checkpoint_id")?,
            checkpoint: row.try_get("checkpoint")?,
            metadata: row.try_get("metadata")?,
        })
    }
}

fn typed_blob(row: &SqliteRow) -> Result<TypedBlob> {
    Ok(TypedBlob {
        type_tag: row.try_get("type")?,
        payload: row.try_get("blob")?,
    })
}

#[derive(Debug, Clone)]
pub struct SqliteCheckpointSaver {
    pool: SqlitePool,
    tenant: TenantId,
    serde: JsonSerializer,
    cleanup: CleanupPolicy,
}

impl SqliteCheckpointSaver {
    /// Open (creating if missing) the database at `database_url` and apply migrations.
    ///
    /// # Arguments
    /// * `database_url` - SQLite connection string (e.g. "sqlite://runs.db")
    /// * `tenant` - Tenant every statement of this saver is scoped to
    pub async fn connect(database_url: &str, tenant: TenantId) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::migrate(&pool).await?;
        Ok(Self::from_pool(pool, tenant))
    }

    /// Wrap an existing pool. Migrations are the caller's responsibility.
    pub fn from_pool(pool: SqlitePool, tenant: TenantId) -> Self {
        Self {
            pool,
            tenant,
            serde: JsonSerializer::new(),
            cleanup: CleanupPolicy::default(),
        }
    }

    /// Another tenant's view of the same database.
    pub fn for_tenant(&self, tenant: TenantId) -> Self {
        Self {
            tenant,
            ..self.clone()
        }
    }

    pub async fn migrate(pool: &SqlitePool) -> Result<()> {
        sqlx::migrate!("./migrations").run(pool).await?;
        Ok(())
    }

    pub fn with_cleanup(mut self, cleanup: CleanupPolicy) -> Self {
        self.cleanup = cleanup;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn header(&self, thread: &ThreadRef) -> Result<Option<CheckpointHeader>> {
        let row = match &thread.checkpoint_id {
            Some(checkpoint_id) => {
                sqlx::query(
                    "SELECT checkpoint_id, parent_checkpoint_id, checkpoint, metadata
                     FROM checkpoints
                     WHERE tenant_id = ? AND thread_id = ? AND checkpoint_ns = ? AND checkpoint_id = ?",
                )
                .bind(self.tenant.as_str())
                .bind(&thread.thread_id)
                .bind(&thread.namespace)
                .bind(checkpoint_id)
                .fetch_optional(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT checkpoint_id, parent_checkpoint_id, checkpoint, metadata
                     FROM checkpoints
                     WHERE tenant_id = ? AND thread_id = ? AND checkpoint_ns = ?
                     ORDER BY seq DESC
                     LIMIT 1",
                )
                .bind(self.tenant.as_str())
                .bind(&thread.thread_id)
                .bind(&thread.namespace)
                .fetch_optional(&self.pool)
                .await?
            }
        };
        row.as_ref().map(CheckpointHeader::from_row).transpose()
    }

    async fn materialize(&self, thread: &ThreadRef, header: CheckpointHeader) -> Result<CheckpointTuple> {
        let mut checkpoint: Checkpoint = serde_json::from_str(&header.checkpoint)?;
        let metadata: CheckpointMetadata = serde_json::from_str(&header.metadata)?;

        let mut channel_values = HashMap::new();
        for (channel, version) in &checkpoint.channel_versions {
            let row = sqlx::query(
                "SELECT type, blob FROM checkpoint_blobs
                 WHERE tenant_id = ? AND thread_id = ? AND checkpoint_ns = ? AND channel = ? AND version = ?",
            )
            .bind(self.tenant.as_str())
            .bind(&thread.thread_id)
            .bind(&thread.namespace)
            .bind(channel)
            .bind(version.get() as i64)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CheckpointError::MissingBlob {
                channel: channel.clone(),
                version: version.get(),
            })?;
            let blob = typed_blob(&row)?;
            if !blob.is_empty() {
                channel_values.insert(channel.clone(), self.serde.loads_typed(&blob)?);
            }
        }
        checkpoint.channel_values = channel_values;

        let rows = sqlx::query(
            "SELECT task_id, idx, channel, type, blob FROM checkpoint_writes
             WHERE tenant_id = ? AND thread_id = ? AND checkpoint_ns = ? AND checkpoint_id = ?
             ORDER BY task_id, idx",
        )
        .bind(self.tenant.as_str())
        .bind(&thread.thread_id)
        .bind(&thread.namespace)
        .bind(&header.checkpoint_id)
        .fetch_all(&self.pool)
        .await?;
        let mut pending_writes = Vec::with_capacity(rows.len());
        for row in &rows {
            pending_writes.push(PendingWrite {
                task_id: row.try_get("task_id")?,
                idx: row.try_get("idx")?,
                channel: row.try_get("channel")?,
                value: self.serde.loads_typed(&typed_blob(row)?)?,
            });
        }

        Ok(CheckpointTuple {
            thread: thread.latest().with_checkpoint_id(header.checkpoint_id),
            parent: header
                .parent_checkpoint_id
                .map(|parent| thread.latest().with_checkpoint_id(parent)),
            checkpoint,
            metadata,
            pending_writes,
        })
    }
}

#[async_trait]
impl CheckpointSaver for SqliteCheckpointSaver {
    fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    async fn get_tuple(&self, thread: &ThreadRef) -> Result<Option<CheckpointTuple>> {
        thread.require_thread()?;
        match self.header(thread).await? {
            Some(header) => Ok(Some(self.materialize(thread, header).await?)),
            None => Ok(None),
        }
    }

    async fn list(&self, thread: &ThreadRef, options: ListOptions) -> Result<CheckpointStream> {
        thread.require_thread()?;

        let bound: Option<i64> = match &options.before {
            Some(before) => {
                let row = sqlx::query(
                    "SELECT seq FROM checkpoints
                     WHERE tenant_id = ? AND thread_id = ? AND checkpoint_ns = ? AND checkpoint_id = ?",
                )
                .bind(self.tenant.as_str())
                .bind(&thread.thread_id)
                .bind(&thread.namespace)
                .bind(before)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| CheckpointError::NotFound(before.clone()))?;
                Some(row.try_get("seq")?)
            }
            None => None,
        };

        // Metadata filters are matched in Rust, so the limit only goes into SQL without
        // one. `LIMIT -1` is unbounded.
        let sql_limit = match (&options.filter, options.limit) {
            (None, Some(limit)) => i64::try_from(limit).unwrap_or(i64::MAX),
            _ => -1,
        };
        let mut rows = sqlx::query(
            "SELECT checkpoint_id, parent_checkpoint_id, checkpoint, metadata
             FROM checkpoints
             WHERE tenant_id = ? AND thread_id = ? AND checkpoint_ns = ? AND seq < ?
             ORDER BY seq DESC
             LIMIT ?",
        )
        .bind(self.tenant.as_str())
        .bind(&thread.thread_id)
        .bind(&thread.namespace)
        .bind(bound.unwrap_or(i64::MAX))
        .bind(sql_limit)
        .fetch(&self.pool);

        let mut headers = Vec::new();
        while let Some(row) = rows.try_next().await? {
            if options.limit.is_some_and(|limit| headers.len() >= limit) {
                break;
            }
            let header = CheckpointHeader::from_row(&row)?;
            if let Some(filter) = &options.filter {
                let metadata: CheckpointMetadata = serde_json::from_str(&header.metadata)?;
                if !metadata.matches(filter) {
                    continue;
                }
            }
            headers.push(header);
        }

        let saver = self.clone();
        let thread = thread.latest();
        let stream = stream::iter(headers).then(move |header| {
            let saver = saver.clone();
            let thread = thread.clone();
            async move { saver.materialize(&thread, header).await }
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
        let stored = serde_json::to_string(&checkpoint.without_values())?;
        let metadata = serde_json::to_string(&metadata)?;

        let mut tx = self.pool.begin().await?;

        for (channel, version) in &new_versions {
            let value = checkpoint
                .channel_values
                .get(channel)
                .cloned()
                .unwrap_or(Value::Null);
            let blob = self.serde.dumps_typed(&value)?;
            let inserted = sqlx::query(
                "INSERT INTO checkpoint_blobs
                     (tenant_id, thread_id, checkpoint_ns, channel, version, type, blob)
                 VALUES (?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT (tenant_id, thread_id, checkpoint_ns, channel, version) DO NOTHING",
            )
            .bind(self.tenant.as_str())
            .bind(&thread.thread_id)
            .bind(&thread.namespace)
            .bind(channel)
            .bind(version.get() as i64)
            .bind(&blob.type_tag)
            .bind(&blob.payload)
            .execute(&mut *tx)
            .await?;

            if inserted.rows_affected() == 0 {
                let existing = sqlx::query(
                    "SELECT type, blob FROM checkpoint_blobs
                     WHERE tenant_id = ? AND thread_id = ? AND checkpoint_ns = ? AND channel = ? AND version = ?",
                )
                .bind(self.tenant.as_str())
                .bind(&thread.thread_id)
                .bind(&thread.namespace)
                .bind(channel)
                .bind(version.get() as i64)
                .fetch_one(&mut *tx)
                .await?;
                if typed_blob(&existing)? != blob {
                    return Err(CheckpointError::BlobConflict {
                        channel: channel.clone(),
                        version: version.get(),
                    });
                }
            }
        }

        let next_seq: i64 = sqlx::query(
            "SELECT COALESCE(MAX(seq), 0) + 1 AS next_seq FROM checkpoints
             WHERE tenant_id = ? AND thread_id = ? AND checkpoint_ns = ?",
        )
        .bind(self.tenant.as_str())
        .bind(&thread.thread_id)
        .bind(&thread.namespace)
        .fetch_one(&mut *tx)
        .await?
        .try_get("next_seq")?;

        sqlx::query(
            "INSERT INTO checkpoints
                 (tenant_id, thread_id, checkpoint_ns, checkpoint_id, seq,
                  parent_checkpoint_id, checkpoint, metadata, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(self.tenant.as_str())
        .bind(&thread.thread_id)
        .bind(&thread.namespace)
        .bind(&checkpoint.id)
        .bind(next_seq)
        .bind(&thread.checkpoint_id)
        .bind(&stored)
        .bind(&metadata)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::debug!(checkpoint_id = %checkpoint.id, seq = next_seq, "checkpoint stored");

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
        let checkpoint_id = thread.require_checkpoint()?;

        let mut tx = self.pool.begin().await?;
        for (idx, (channel, value)) in writes.iter().enumerate() {
            let blob = self.serde.dumps_typed(value)?;
            sqlx::query(
                "INSERT INTO checkpoint_writes
                     (tenant_id, thread_id, checkpoint_ns, checkpoint_id, task_id, idx, channel, type, blob)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT (tenant_id, thread_id, checkpoint_ns, checkpoint_id, task_id, channel, idx)
                 DO UPDATE SET type = excluded.type, blob = excluded.blob",
            )
            .bind(self.tenant.as_str())
            .bind(&thread.thread_id)
            .bind(&thread.namespace)
            .bind(checkpoint_id)
            .bind(task_id)
            .bind(idx as i64)
            .bind(channel)
            .bind(&blob.type_tag)
            .bind(&blob.payload)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        if thread_id.trim().is_empty() {
            return Err(CheckpointError::InvalidThread("thread_id is required".into()));
        }
        for table in ["checkpoint_writes", "checkpoint_blobs", "checkpoints"] {
            sqlx::query(&format!(
                "DELETE FROM {table} WHERE tenant_id = ? AND thread_id = ?"
            ))
            .bind(self.tenant.as_str())
            .bind(thread_id)
            .execute(&self.pool)
            .await
            .map_err(|e| CheckpointError::Storage(format!("failed to delete from {table}: {e}")))?;
        }
        tracing::info!(tenant = %self.tenant, thread_id, "thread deleted");
        Ok(())
    }

    async fn prune(&self, thread: &ThreadRef, keep: usize) -> Result<usize> {
        thread.require_thread()?;
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            "SELECT checkpoint_id, seq, checkpoint FROM checkpoints
             WHERE tenant_id = ? AND thread_id = ? AND checkpoint_ns = ?
             ORDER BY seq DESC",
        )
        .bind(self.tenant.as_str())
        .bind(&thread.thread_id)
        .bind(&thread.namespace)
        .fetch_all(&mut *tx)
        .await?;
        if rows.len() <= keep {
            return Ok(0);
        }

        let mut referenced = HashSet::new();
        for row in &rows[..keep] {
            let checkpoint: Checkpoint = serde_json::from_str(&row.try_get::<String, _>("checkpoint")?)?;
            for (channel, version) in checkpoint.channel_versions {
                referenced.insert((channel, version.get() as i64));
            }
        }

        let removed = &rows[keep..];
        let cutoff: i64 = removed[0].try_get("seq")?;
        for row in removed {
            let checkpoint_id: String = row.try_get("checkpoint_id")?;
            sqlx::query(
                "DELETE FROM checkpoint_writes
                 WHERE tenant_id = ? AND thread_id = ? AND checkpoint_ns = ? AND checkpoint_id = ?",
            )
            .bind(self.tenant.as_str())
            .bind(&thread.thread_id)
            .bind(&thread.namespace)
            .bind(&checkpoint_id)
            .execute(&mut *tx)
            .await?;
        }

        let blobs = sqlx::query(
            "SELECT channel, version FROM checkpoint_blobs
             WHERE tenant_id = ? AND thread_id = ? AND checkpoint_ns = ?",
        )
        .bind(self.tenant.as_str())
        .bind(&thread.thread_id)
        .bind(&thread.namespace)
        .fetch_all(&mut *tx)
        .await?;
        for blob in &blobs {
            let key: (String, i64) = (blob.try_get("channel")?, blob.try_get("version")?);
            if referenced.contains(&key) {
                continue;
            }
            sqlx::query(
                "DELETE FROM checkpoint_blobs
                 WHERE tenant_id = ? AND thread_id = ? AND checkpoint_ns = ? AND channel = ? AND version = ?",
            )
            .bind(self.tenant.as_str())
            .bind(&thread.thread_id)
            .bind(&thread.namespace)
            .bind(&key.0)
            .bind(key.1)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "DELETE FROM checkpoints
             WHERE tenant_id = ? AND thread_id = ? AND checkpoint_ns = ? AND seq <= ?",
        )
        .bind(self.tenant.as_str())
        .bind(&thread.thread_id)
        .bind(&thread.namespace)
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::debug!(thread_id = %thread.thread_id, removed = removed.len(), "pruned checkpoints");
        Ok(removed.len())
    }
}
