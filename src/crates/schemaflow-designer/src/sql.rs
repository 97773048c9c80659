//! SQL batches and their execution
//!
//! DDL and DML are validated together: [`SqlBatch::combine`] puts the DDL first, and
//! the executor runs every statement in order on a throwaway database, reporting each
//! one. A failing statement does not stop the batch, so one run surfaces every problem.

use async_trait::async_trait;
use schemaflow_core::{ComputeError, ComputeStep};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlBatch {
    pub sql: String,
}

impl SqlBatch {
    pub fn new(sql: impl Into<String>) -> Self {
        Self { sql: sql.into() }
    }

    /// DDL, a blank line, then DML. An empty side is left out.
    pub fn combine(ddl: &str, dml: &str) -> Self {
        let (ddl, dml) = (ddl.trim(), dml.trim());
        let sql = match (ddl.is_empty(), dml.is_empty()) {
            (false, false) => format!("{ddl}\n\n{dml}"),
            (false, true) => ddl.to_string(),
            (true, _) => dml.to_string(),
        };
        Self { sql }
    }

    pub fn statements(&self) -> Vec<String> {
        split_statements(&self.sql)
    }

    pub fn is_empty(&self) -> bool {
        self.sql.trim().is_empty()
    }
}

/// Split on `;` outside quoted text and comments. Terminators are dropped, `--` and
/// `/* */` comments are removed, and statements left blank are skipped.
pub fn split_statements(text: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        if let Some(open) = quote {
            if ch == open {
                quote = None;
            }
            current.push(ch);
            continue;
        }

        match ch {
            ';' => {
                push_statement(&mut statements, &current);
                current.clear();
            }
            '\'' | '"' => {
                quote = Some(ch);
                current.push(ch);
            }
            '-' if chars.peek() == Some(&'-') => {
                // The newline itself is kept as the separator.
                while chars.next_if(|&next| next != '\n').is_some() {}
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut previous = '\0';
                for next in chars.by_ref() {
                    if previous == '*' && next == '/' {
                        break;
                    }
                    previous = next;
                }
                current.push(' ');
            }
            _ => current.push(ch),
        }
    }
    push_statement(&mut statements, &current);
    statements
}

fn push_statement(statements: &mut Vec<String>, text: &str) {
    let statement = text.trim();
    if !statement.is_empty() {
        statements.push(statement.to_string());
    }
}

/// Outcome of one statement. `payload` carries `rows_affected` or `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementResult {
    pub statement: String,
    pub success: bool,
    pub payload: Value,
}

impl StatementResult {
    pub fn ok(statement: impl Into<String>, rows_affected: u64) -> Self {
        Self {
            statement: statement.into(),
            success: true,
            payload: json!({ "rows_affected": rows_affected }),
        }
    }

    pub fn failed(statement: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            statement: statement.into(),
            success: false,
            payload: json!({ "error": error.into() }),
        }
    }

    pub fn error(&self) -> Option<&str> {
        self.payload.get("error").and_then(Value::as_str)
    }
}

/// Who is expected to fix a failed statement: the schema designer or the author of the
/// test statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Schema,
    SqlQuality,
    Unknown,
}

const SCHEMA_PATTERNS: &[&str] = &[
    "no such table",
    "no such column",
    "has no column named",
    "constraint failed",
    "already exists",
    "foreign key mismatch",
];

const SQL_QUALITY_PATTERNS: &[&str] = &[
    "syntax error",
    "incomplete input",
    "no such function",
    "wrong number of arguments",
    "ambiguous column name",
    "values were supplied",
    "misuse of",
];

impl FailureCategory {
    /// Classify a database error message.
    pub fn classify(message: &str) -> Self {
        let message = message.to_lowercase();
        if SCHEMA_PATTERNS.iter().any(|p| message.contains(p)) {
            Self::Schema
        } else if SQL_QUALITY_PATTERNS.iter().any(|p| message.contains(p)) {
            Self::SqlQuality
        } else {
            Self::Unknown
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Schema => "schema",
            Self::SqlQuality => "sql_quality",
            Self::Unknown => "unknown",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementFailure {
    pub statement: String,
    pub error: String,
    pub category: FailureCategory,
}

/// All statement results of one batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub results: Vec<StatementResult>,
    pub failed: bool,
}

impl BatchReport {
    pub fn from_results(results: Vec<StatementResult>) -> Self {
        let failed = results.iter().any(|result| !result.success);
        Self { results, failed }
    }

    pub fn failures(&self) -> Vec<StatementFailure> {
        self.results
            .iter()
            .filter(|result| !result.success)
            .map(|result| {
                let error = result.error().unwrap_or("unknown error").to_string();
                StatementFailure {
                    statement: result.statement.clone(),
                    category: FailureCategory::classify(&error),
                    error,
                }
            })
            .collect()
    }

    /// One line per failed statement.
    pub fn summary(&self) -> String {
        self.failures()
            .iter()
            .map(|failure| format!("[{}] {}: {}", failure.category, failure.statement, failure.error))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Runs each batch on a fresh in-memory SQLite database.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteStatementExecutor;

impl SqliteStatementExecutor {
    pub fn new() -> Self {
        Self
    }

    pub async fn run(&self, batch: &SqlBatch) -> Result<Vec<StatementResult>, sqlx::Error> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        // One connection: every `sqlite::memory:` connection is its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let mut conn = pool.acquire().await?;

        let statements = batch.statements();
        debug!(statements = statements.len(), "executing sql batch");

        let mut results = Vec::with_capacity(statements.len());
        for statement in statements {
            let outcome = sqlx::query(&statement).execute(&mut *conn).await;
            let result = match outcome {
                Ok(done) => StatementResult::ok(statement, done.rows_affected()),
                Err(error) => {
                    let message = error
                        .as_database_error()
                        .map(|db| db.message().to_string())
                        .unwrap_or_else(|| error.to_string());
                    debug!(%message, "statement failed");
                    StatementResult::failed(statement, message)
                }
            };
            results.push(result);
        }

        drop(conn);
        pool.close().await;
        Ok(results)
    }
}

#[async_trait]
impl ComputeStep<SqlBatch, Vec<StatementResult>> for SqliteStatementExecutor {
    async fn invoke(&self, request: SqlBatch) -> Result<Vec<StatementResult>, ComputeError> {
        self.run(&request)
            .await
            .map_err(|error| ComputeError::failed(format!("sqlite unavailable: {error}")))
    }
}
