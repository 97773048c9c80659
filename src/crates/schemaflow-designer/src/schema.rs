//! Relational schema arena
//!
//! Tables are keyed by name, which doubles as their stable identifier in patches.
//! Constraints and indexes are keyed by name within their table. Everything is plain
//! serde data so a whole [`Schema`] can live in a state channel and be checkpointed.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Schema {
    pub tables: BTreeMap<String, Table>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Table {
    pub name: String,
    pub comment: Option<String>,
    /// Declaration order is rendering order
    pub columns: Vec<Column>,
    pub constraints: BTreeMap<String, Constraint>,
    pub indexes: BTreeMap<String, Index>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Column {
    pub name: String,
    pub data_type: String,
    pub not_null: bool,
    /// Raw SQL expression
    pub default: Option<String>,
    /// Raw SQL expression
    pub check: Option<String>,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForeignKeyAction {
    #[default]
    NoAction,
    Restrict,
    Cascade,
    SetNull,
    SetDefault,
}

impl ForeignKeyAction {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::NoAction => "NO ACTION",
            Self::Restrict => "RESTRICT",
            Self::Cascade => "CASCADE",
            Self::SetNull => "SET NULL",
            Self::SetDefault => "SET DEFAULT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Constraint {
    PrimaryKey {
        columns: Vec<String>,
    },
    ForeignKey {
        columns: Vec<String>,
        target_table: String,
        target_columns: Vec<String>,
        #[serde(default)]
        on_update: ForeignKeyAction,
        #[serde(default)]
        on_delete: ForeignKeyAction,
    },
    Unique {
        columns: Vec<String>,
    },
    Check {
        expression: String,
    },
}

impl Constraint {
    /// Local columns the constraint refers to. Empty for `CHECK`.
    pub fn columns(&self) -> &[String] {
        match self {
            Self::PrimaryKey { columns }
            | Self::ForeignKey { columns, .. }
            | Self::Unique { columns } => columns,
            Self::Check { .. } => &[],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Index {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    pub fn constraint(mut self, name: impl Into<String>, constraint: Constraint) -> Self {
        self.constraints.insert(name.into(), constraint);
        self
    }

    pub fn index(mut self, index: Index) -> Self {
        self.indexes.insert(index.name.clone(), index);
        self
    }

    pub fn get_column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|column| column.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.get_column(name).is_some()
    }

    /// `CREATE TABLE` followed by this table's `CREATE INDEX` statements.
    pub fn to_ddl(&self) -> String {
        let mut lines: Vec<String> = self.columns.iter().map(Column::to_sql).collect();
        lines.extend(
            self.constraints
                .iter()
                .map(|(name, constraint)| constraint_sql(name, constraint)),
        );

        let mut ddl = format!(
            "CREATE TABLE {} (\n  {}\n);",
            quote(&self.name),
            lines.join(",\n  ")
        );
        for index in self.indexes.values() {
            ddl.push('\n');
            ddl.push_str(&index.to_sql(&self.name));
        }
        ddl
    }
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            ..Self::default()
        }
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    pub fn with_default(mut self, expression: impl Into<String>) -> Self {
        self.default = Some(expression.into());
        self
    }

    pub fn with_check(mut self, expression: impl Into<String>) -> Self {
        self.check = Some(expression.into());
        self
    }

    fn to_sql(&self) -> String {
        let mut sql = format!("{} {}", quote(&self.name), self.data_type);
        if self.not_null {
            sql.push_str(" NOT NULL");
        }
        if let Some(default) = &self.default {
            sql.push_str(&format!(" DEFAULT {default}"));
        }
        if let Some(check) = &self.check {
            sql.push_str(&format!(" CHECK ({check})"));
        }
        sql
    }
}

impl Index {
    pub fn new(name: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            name: name.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    fn to_sql(&self, table: &str) -> String {
        format!(
            "CREATE {}INDEX {} ON {} ({});",
            if self.unique { "UNIQUE " } else { "" },
            quote(&self.name),
            quote(table),
            quote_list(&self.columns)
        )
    }
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, table: Table) -> Self {
        self.tables.insert(table.name.clone(), table);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// DDL for the whole schema, in table-name order.
    ///
    /// Foreign keys may point at tables rendered later; SQLite resolves them lazily.
    pub fn to_ddl(&self) -> String {
        self.tables
            .values()
            .map(Table::to_ddl)
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

fn constraint_sql(name: &str, constraint: &Constraint) -> String {
    let body = match constraint {
        Constraint::PrimaryKey { columns } => format!("PRIMARY KEY ({})", quote_list(columns)),
        Constraint::Unique { columns } => format!("UNIQUE ({})", quote_list(columns)),
        Constraint::Check { expression } => format!("CHECK ({expression})"),
        Constraint::ForeignKey {
            columns,
            target_table,
            target_columns,
            on_update,
            on_delete,
        } => format!(
            "FOREIGN KEY ({}) REFERENCES {} ({}) ON UPDATE {} ON DELETE {}",
            quote_list(columns),
            quote(target_table),
            quote_list(target_columns),
            on_update.as_sql(),
            on_delete.as_sql()
        ),
    };
    format!("CONSTRAINT {} {body}", quote(name))
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

fn quote_list(identifiers: &[String]) -> String {
    identifiers
        .iter()
        .map(|identifier| quote(identifier))
        .collect::<Vec<_>>()
        .join(", ")
}
