//! # schemaflow-designer - schema design on durable step graphs
//!
//! The design pipeline as a [`schemaflow_core`] graph: record a request, propose a
//! schema patch, validate it against a real database, generate DML test cases and run
//! them against the committed DDL. Both validation stages are bounded retry loops kept
//! in state, so a crashed run resumes with its counters and last failure intact.
//!
//! ## Modules
//!
//! - [`schema`] - table/column/constraint/index arena and DDL rendering
//! - [`patch`] - patch operations, `preview` and versioned commits
//! - [`sql`] - batch splitting, per-statement results, the SQLite executor
//! - [`validation`] - the retry/validation loop over state channels
//! - [`workflow`] - the step set and [`design_workflow`]
//! - [`scripted`] - fixture-driven proposer and generator
//!
//! ## Example
//!
//! ```rust,no_run
//! use schemaflow_checkpoint::{InMemoryCheckpointSaver, TenantId};
//! use schemaflow_core::RunConfig;
//! use schemaflow_designer::{
//!     design_workflow, DesignerConfig, DesignerDeps, ScriptedGenerator, ScriptedProposer,
//! };
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let deps = DesignerDeps::new(
//!     Arc::new(ScriptedProposer::from_file("proposals.yaml")?),
//!     Arc::new(ScriptedGenerator::from_file("testcases.yaml")?),
//! );
//! let graph = design_workflow(deps, &DesignerConfig::default())?
//!     .with_checkpointer(Arc::new(InMemoryCheckpointSaver::new("org-1")?));
//!
//! let config = RunConfig::new(TenantId::new("org-1")?, "session-1");
//! let outcome = graph.invoke(json!({"request": "a blog with users and posts"}), config).await?;
//! println!("{}", outcome.state["outcome"]);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod patch;
pub mod schema;
pub mod scripted;
pub mod sql;
pub mod validation;
pub mod workflow;

pub use error::{DesignerError, PatchError, Result};
pub use patch::{preview, CommitReceipt, DesignDocument, PatchOp, SchemaPatch};
pub use schema::{Column, Constraint, ForeignKeyAction, Index, Schema, Table};
pub use scripted::{ScriptedGenerator, ScriptedProposer};
pub use sql::{
    split_statements, BatchReport, FailureCategory, SqlBatch, SqliteStatementExecutor,
    StatementFailure, StatementResult,
};
pub use validation::{LoopStatus, ValidationLoop, Verdict, RETRY_COUNT_CHANNEL};
pub use workflow::{
    design_workflow, workflow_schema, DesignRequest, DesignStep, DesignerConfig, DesignerDeps,
    SchemaProposer, StatementExecutor, Testcase, TestcaseGenerator, TestcaseRequest,
};
