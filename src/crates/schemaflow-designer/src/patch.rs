//! Schema patches: preview, then commit
//!
//! A [`SchemaPatch`] is an ordered list of add/replace/remove operations against a
//! [`Schema`]. [`preview`] applies it to a copy and checks referential consistency of
//! the result without touching the original; a rejected patch leaves no trace.
//! [`DesignDocument::commit`] applies a patch that previews cleanly and bumps the
//! document version. The document is stored in a checkpointed state channel, so a
//! commit is durable once the step that made it is checkpointed.

use serde::{Deserialize, Serialize};

use crate::error::PatchError;
use crate::schema::{Column, Constraint, Index, Schema, Table};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PatchOp {
    AddTable {
        table: Table,
    },
    ReplaceTable {
        table: Table,
    },
    RemoveTable {
        name: String,
    },
    AddColumn {
        table: String,
        column: Column,
    },
    ReplaceColumn {
        table: String,
        column: Column,
    },
    RemoveColumn {
        table: String,
        name: String,
    },
    AddConstraint {
        table: String,
        name: String,
        constraint: Constraint,
    },
    ReplaceConstraint {
        table: String,
        name: String,
        constraint: Constraint,
    },
    RemoveConstraint {
        table: String,
        name: String,
    },
    AddIndex {
        table: String,
        index: Index,
    },
    ReplaceIndex {
        table: String,
        index: Index,
    },
    RemoveIndex {
        table: String,
        name: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaPatch {
    pub ops: Vec<PatchOp>,
}

impl SchemaPatch {
    pub fn new(ops: Vec<PatchOp>) -> Self {
        Self { ops }
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Apply `patch` to a copy of `schema` and validate the result.
pub fn preview(schema: &Schema, patch: &SchemaPatch) -> Result<Schema, PatchError> {
    let mut next = schema.clone();
    for op in &patch.ops {
        apply(&mut next, op)?;
    }
    check_references(&next)?;
    Ok(next)
}

fn apply(schema: &mut Schema, op: &PatchOp) -> Result<(), PatchError> {
    match op {
        PatchOp::AddTable { table } => {
            if schema.tables.contains_key(&table.name) {
                return Err(PatchError::DuplicateTable(table.name.clone()));
            }
            check_unique_columns(table)?;
            schema.tables.insert(table.name.clone(), table.clone());
        }
        PatchOp::ReplaceTable { table } => {
            table_mut(schema, &table.name)?;
            check_unique_columns(table)?;
            schema.tables.insert(table.name.clone(), table.clone());
        }
        PatchOp::RemoveTable { name } => {
            schema
                .tables
                .remove(name)
                .ok_or_else(|| PatchError::UnknownTable(name.clone()))?;
        }
        PatchOp::AddColumn { table, column } => {
            let target = table_mut(schema, table)?;
            if target.has_column(&column.name) {
                return Err(PatchError::DuplicateColumn {
                    table: table.clone(),
                    column: column.name.clone(),
                });
            }
            target.columns.push(column.clone());
        }
        PatchOp::ReplaceColumn { table, column } => {
            let target = table_mut(schema, table)?;
            let slot = target
                .columns
                .iter_mut()
                .find(|existing| existing.name == column.name)
                .ok_or_else(|| PatchError::UnknownColumn {
                    table: table.clone(),
                    column: column.name.clone(),
                })?;
            *slot = column.clone();
        }
        PatchOp::RemoveColumn { table, name } => {
            let target = table_mut(schema, table)?;
            let position = target
                .columns
                .iter()
                .position(|existing| &existing.name == name)
                .ok_or_else(|| PatchError::UnknownColumn {
                    table: table.clone(),
                    column: name.clone(),
                })?;
            target.columns.remove(position);
        }
        PatchOp::AddConstraint {
            table,
            name,
            constraint,
        } => {
            let target = table_mut(schema, table)?;
            if target.constraints.contains_key(name) {
                return Err(PatchError::DuplicateConstraint {
                    table: table.clone(),
                    name: name.clone(),
                });
            }
            target.constraints.insert(name.clone(), constraint.clone());
        }
        PatchOp::ReplaceConstraint {
            table,
            name,
            constraint,
        } => {
            let target = table_mut(schema, table)?;
            let slot = target
                .constraints
                .get_mut(name)
                .ok_or_else(|| PatchError::UnknownConstraint {
                    table: table.clone(),
                    name: name.clone(),
                })?;
            *slot = constraint.clone();
        }
        PatchOp::RemoveConstraint { table, name } => {
            table_mut(schema, table)?
                .constraints
                .remove(name)
                .ok_or_else(|| PatchError::UnknownConstraint {
                    table: table.clone(),
                    name: name.clone(),
                })?;
        }
        PatchOp::AddIndex { table, index } => {
            let target = table_mut(schema, table)?;
            if target.indexes.contains_key(&index.name) {
                return Err(PatchError::DuplicateIndex {
                    table: table.clone(),
                    name: index.name.clone(),
                });
            }
            target.indexes.insert(index.name.clone(), index.clone());
        }
        PatchOp::ReplaceIndex { table, index } => {
            let target = table_mut(schema, table)?;
            let slot = target
                .indexes
                .get_mut(&index.name)
                .ok_or_else(|| PatchError::UnknownIndex {
                    table: table.clone(),
                    name: index.name.clone(),
                })?;
            *slot = index.clone();
        }
        PatchOp::RemoveIndex { table, name } => {
            table_mut(schema, table)?
                .indexes
                .remove(name)
                .ok_or_else(|| PatchError::UnknownIndex {
                    table: table.clone(),
                    name: name.clone(),
                })?;
        }
    }
    Ok(())
}

fn table_mut<'a>(schema: &'a mut Schema, name: &str) -> Result<&'a mut Table, PatchError> {
    schema
        .tables
        .get_mut(name)
        .ok_or_else(|| PatchError::UnknownTable(name.to_string()))
}

fn check_unique_columns(table: &Table) -> Result<(), PatchError> {
    for (i, column) in table.columns.iter().enumerate() {
        if table.columns[..i].iter().any(|c| c.name == column.name) {
            return Err(PatchError::DuplicateColumn {
                table: table.name.clone(),
                column: column.name.clone(),
            });
        }
    }
    Ok(())
}

fn check_columns(table: &Table, owner: &str, columns: &[String]) -> Result<(), PatchError> {
    if columns.is_empty() {
        return Err(PatchError::EmptyColumnList {
            table: table.name.clone(),
            name: owner.to_string(),
        });
    }
    match columns.iter().find(|column| !table.has_column(column)) {
        Some(column) => Err(PatchError::UnknownColumn {
            table: table.name.clone(),
            column: column.clone(),
        }),
        None => Ok(()),
    }
}

/// Every constraint and index must name existing columns; foreign keys must target an
/// existing table and columns of matching arity.
fn check_references(schema: &Schema) -> Result<(), PatchError> {
    for table in schema.tables.values() {
        for (name, constraint) in &table.constraints {
            if matches!(constraint, Constraint::Check { .. }) {
                continue;
            }
            check_columns(table, name, constraint.columns())?;

            let Constraint::ForeignKey {
                columns,
                target_table,
                target_columns,
                ..
            } = constraint
            else {
                continue;
            };
            let invalid = |reason: String| PatchError::InvalidForeignKey {
                table: table.name.clone(),
                name: name.clone(),
                reason,
            };
            let target = schema
                .tables
                .get(target_table)
                .ok_or_else(|| invalid(format!("target table '{target_table}' does not exist")))?;
            if let Some(missing) = target_columns.iter().find(|c| !target.has_column(c)) {
                return Err(invalid(format!(
                    "target column '{target_table}.{missing}' does not exist"
                )));
            }
            if target_columns.len() != columns.len() {
                return Err(invalid(format!(
                    "{} column(s) reference {} target column(s)",
                    columns.len(),
                    target_columns.len()
                )));
            }
        }

        for index in table.indexes.values() {
            check_columns(table, &index.name, &index.columns)?;
        }
    }
    Ok(())
}

/// Receipt of a committed patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitReceipt {
    pub version: u64,
    pub ops_applied: usize,
}

/// The schema under design plus a version bumped on every commit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DesignDocument {
    pub schema: Schema,
    pub version: u64,
}

impl DesignDocument {
    pub fn new(schema: Schema) -> Self {
        Self { schema, version: 0 }
    }

    pub fn preview(&self, patch: &SchemaPatch) -> Result<Schema, PatchError> {
        preview(&self.schema, patch)
    }

    /// Apply `patch` if it previews cleanly. A rejected patch leaves the document as is.
    pub fn commit(&mut self, patch: &SchemaPatch) -> Result<CommitReceipt, PatchError> {
        self.schema = self.preview(patch)?;
        self.version += 1;
        Ok(CommitReceipt {
            version: self.version,
            ops_applied: patch.ops.len(),
        })
    }
}
