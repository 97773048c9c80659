//! Fixture-driven proposer and generator
//!
//! A script is a list of responses, one per attempt: attempt `n` gets entry `n - 1`,
//! and attempts past the end repeat the last entry. Selection is by the attempt number
//! carried in the request, which comes from checkpointed state, so a resumed run
//! replays the same script position as the original process would have.
//!
//! Fixtures are JSON or YAML (by file extension):
//!
//! ```yaml
//! # proposals.yaml: one SchemaPatch per attempt
//! - ops:
//!     - op: add_table
//!       table: { name: users, columns: [{ name: id, data_type: integer }] }
//! ```

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use schemaflow_core::{ComputeError, ComputeStep};

use crate::error::{DesignerError, Result};
use crate::patch::SchemaPatch;
use crate::workflow::{DesignRequest, Testcase, TestcaseRequest};

fn load<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let text = std::fs::read_to_string(path)?;
    let entries: Vec<T> = match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml" | "yml") => serde_yaml::from_str(&text)?,
        _ => serde_json::from_str(&text)?,
    };
    if entries.is_empty() {
        return Err(DesignerError::Fixture {
            path: path.display().to_string(),
            reason: "script has no entries".into(),
        });
    }
    Ok(entries)
}

fn pick<T: Clone>(script: &[T], attempt: u32) -> std::result::Result<T, ComputeError> {
    let index = (attempt.max(1) - 1) as usize;
    script
        .get(index)
        .or_else(|| script.last())
        .cloned()
        .ok_or_else(|| ComputeError::InvalidRequest("script has no entries".into()))
}

/// Replays schema patches.
#[derive(Debug, Default)]
pub struct ScriptedProposer {
    patches: Vec<SchemaPatch>,
    calls: AtomicUsize,
}

impl ScriptedProposer {
    pub fn new(patches: Vec<SchemaPatch>) -> Self {
        Self {
            patches,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(load(path.as_ref())?))
    }

    /// Number of proposals handed out by this instance.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ComputeStep<DesignRequest, SchemaPatch> for ScriptedProposer {
    async fn invoke(&self, request: DesignRequest) -> std::result::Result<SchemaPatch, ComputeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        pick(&self.patches, request.attempt)
    }
}

/// Replays batches of test cases.
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    batches: Vec<Vec<Testcase>>,
    calls: AtomicUsize,
}

impl ScriptedGenerator {
    pub fn new(batches: Vec<Vec<Testcase>>) -> Self {
        Self {
            batches,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(load(path.as_ref())?))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ComputeStep<TestcaseRequest, Vec<Testcase>> for ScriptedGenerator {
    async fn invoke(&self, request: TestcaseRequest) -> std::result::Result<Vec<Testcase>, ComputeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        pick(&self.batches, request.attempt)
    }
}
