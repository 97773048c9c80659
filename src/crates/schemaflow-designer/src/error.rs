//! Error types for the design workflow

use schemaflow_core::GraphError;
use thiserror::Error;

/// Result type for designer operations
pub type Result<T> = std::result::Result<T, DesignerError>;

/// A schema patch that cannot be applied.
///
/// These are expected outcomes of a proposal, not faults: the workflow records them in
/// state and feeds them back to the next proposal.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PatchError {
    #[error("table '{0}' already exists")]
    DuplicateTable(String),

    #[error("table '{0}' does not exist")]
    UnknownTable(String),

    #[error("column '{table}.{column}' already exists")]
    DuplicateColumn { table: String, column: String },

    #[error("column '{table}.{column}' does not exist")]
    UnknownColumn { table: String, column: String },

    #[error("constraint '{name}' already exists on table '{table}'")]
    DuplicateConstraint { table: String, name: String },

    #[error("constraint '{name}' does not exist on table '{table}'")]
    UnknownConstraint { table: String, name: String },

    #[error("index '{name}' already exists on table '{table}'")]
    DuplicateIndex { table: String, name: String },

    #[error("index '{name}' does not exist on table '{table}'")]
    UnknownIndex { table: String, name: String },

    #[error("'{name}' on table '{table}' lists no columns")]
    EmptyColumnList { table: String, name: String },

    #[error("foreign key '{name}' on table '{table}' is invalid: {reason}")]
    InvalidForeignKey {
        table: String,
        name: String,
        reason: String,
    },
}

/// Failures of building or driving the design workflow.
#[derive(Error, Debug)]
pub enum DesignerError {
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Patch rejected: {0}")]
    Patch(#[from] PatchError),

    #[error("Invalid fixture '{path}': {reason}")]
    Fixture { path: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
