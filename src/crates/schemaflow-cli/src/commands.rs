//! Subcommand implementations
//!
//! Each command writes JSON lines to `out`: one per run event for `run` and `resume`,
//! one per checkpoint for `history`. Logs go to stderr, so stdout stays parseable.

use anyhow::{Context, Result};
use futures::StreamExt;
use schemaflow_checkpoint::{CheckpointSaver, ListOptions, SqliteCheckpointSaver, ThreadRef};
use schemaflow_core::{CompiledGraph, RunHandle, RunOutcome};
use schemaflow_designer::{design_workflow, DesignerDeps, ScriptedGenerator, ScriptedProposer};
use serde_json::json;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::settings::Settings;

/// Fixture files the scripted collaborators replay.
#[derive(Debug, Clone)]
pub struct Fixtures {
    pub proposals: PathBuf,
    pub testcases: PathBuf,
}

pub async fn open_store(settings: &Settings) -> Result<Arc<SqliteCheckpointSaver>> {
    let tenant = settings.tenant()?;
    let saver = SqliteCheckpointSaver::connect(&settings.store.url, tenant)
        .await
        .with_context(|| format!("opening checkpoint store '{}'", settings.store.url))?
        .with_cleanup(settings.cleanup_policy());
    Ok(Arc::new(saver))
}

fn build_graph(
    settings: &Settings,
    fixtures: &Fixtures,
    saver: Arc<SqliteCheckpointSaver>,
) -> Result<CompiledGraph> {
    let proposer = ScriptedProposer::from_file(&fixtures.proposals)
        .with_context(|| format!("loading proposals from {}", fixtures.proposals.display()))?;
    let generator = ScriptedGenerator::from_file(&fixtures.testcases)
        .with_context(|| format!("loading test cases from {}", fixtures.testcases.display()))?;

    let deps = DesignerDeps::new(Arc::new(proposer), Arc::new(generator));
    Ok(design_workflow(deps, &settings.designer_config())?.with_checkpointer(saver))
}

/// Start a fresh design run on `thread`.
pub async fn start_run(
    settings: &Settings,
    thread: &str,
    request: &str,
    fixtures: &Fixtures,
) -> Result<RunHandle> {
    let graph = build_graph(settings, fixtures, open_store(settings).await?)?;
    let config = settings.run_config(thread)?;
    info!(thread_id = thread, "starting design run");
    Ok(graph.stream(json!({ "request": request }), config))
}

/// Continue `thread` from its latest checkpoint, or from `checkpoint`.
pub async fn start_resume(
    settings: &Settings,
    thread: &str,
    checkpoint: Option<String>,
    fixtures: &Fixtures,
) -> Result<RunHandle> {
    let graph = build_graph(settings, fixtures, open_store(settings).await?)?;
    let mut config = settings.run_config(thread)?;
    if let Some(checkpoint) = checkpoint {
        config = config.with_checkpoint_id(checkpoint);
    }
    info!(thread_id = thread, checkpoint_id = ?config.thread.checkpoint_id, "resuming design run");
    Ok(graph.stream_resume(config))
}

/// Print every event, then a summary line. A failed run is returned as an error after
/// its `run_failed` event was printed.
pub async fn drive<W: Write>(mut handle: RunHandle, out: &mut W) -> Result<RunOutcome> {
    while let Some(event) = handle.events.next().await {
        writeln!(out, "{}", serde_json::to_string(&event)?)?;
    }

    let outcome = handle.outcome().await?;
    let summary = json!({
        "outcome": outcome.state["outcome"],
        "steps_executed": outcome.steps_executed,
        "checkpoint_id": outcome.checkpoint.as_ref().and_then(|t| t.checkpoint_id.clone()),
        "schema_version": outcome.state["document"]["version"],
    });
    writeln!(out, "{summary}")?;
    Ok(outcome)
}

/// List checkpoints of `thread`, newest first. Returns how many were printed.
pub async fn history<W: Write>(
    settings: &Settings,
    thread: &str,
    limit: usize,
    before: Option<String>,
    out: &mut W,
) -> Result<usize> {
    let saver = open_store(settings).await?;
    let mut options = ListOptions::new().with_limit(limit);
    if let Some(before) = before {
        options = options.with_before(before);
    }

    let mut stream = saver.list(&ThreadRef::new(thread), options).await?;
    let mut count = 0;
    while let Some(tuple) = stream.next().await {
        let tuple = tuple?;
        let line = json!({
            "checkpoint_id": tuple.checkpoint.id,
            "created_at": tuple.checkpoint.ts,
            "step": tuple.metadata.step,
            "source": tuple.metadata.source,
            "node": tuple.metadata.node,
            "next": tuple.metadata.next,
            "parent_id": tuple.parent.and_then(|parent| parent.checkpoint_id),
        });
        writeln!(out, "{line}")?;
        count += 1;
    }
    Ok(count)
}

pub async fn delete<W: Write>(settings: &Settings, thread: &str, out: &mut W) -> Result<()> {
    let saver = open_store(settings).await?;
    saver
        .delete_thread(thread)
        .await
        .with_context(|| format!("deleting thread '{thread}'"))?;
    info!(thread_id = thread, "thread deleted");
    writeln!(out, "{}", json!({ "deleted": thread }))?;
    Ok(())
}

pub fn show_config<W: Write>(settings: &Settings, out: &mut W) -> Result<()> {
    write!(out, "{}", toml::to_string_pretty(settings)?)?;
    Ok(())
}
