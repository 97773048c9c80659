//! The schema design workflow
//!
//! ```text
//! START ─▶ record_request ─▶ design_schema ─▶ validate_schema
//! validate_schema     ─retry─▶ design_schema       ─success─▶ generate_testcases  ─exhausted─▶ finalize
//! generate_testcases  ─▶ validate_statements
//! validate_statements ─retry─▶ generate_testcases  ─success─▶ finalize            ─exhausted─▶ finalize
//! finalize ─▶ END
//! ```
//!
//! Each validating step records its verdict through a [`ValidationLoop`]; the loops use
//! the keys [`DESIGN_LOOP`] and [`STATEMENT_LOOP`] in the shared `retry_count` map.
//! Proposal, generation and SQL execution are opaque [`ComputeStep`]s injected through
//! [`DesignerDeps`].

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{info, warn};

use schemaflow_core::state::{AppendReducer, OverwriteReducer, StateSchema};
use schemaflow_core::{
    CompiledGraph, ComputeStep, RetryPolicy, StateGraph, Step, StepContext, StepError, StepOutput,
    END, START,
};

use crate::error::Result;
use crate::patch::{DesignDocument, SchemaPatch};
use crate::schema::Schema;
use crate::sql::{BatchReport, FailureCategory, SqlBatch, SqliteStatementExecutor, StatementResult};
use crate::validation::{ValidationLoop, Verdict};

pub const RECORD_REQUEST: &str = "record_request";
pub const DESIGN_SCHEMA: &str = "design_schema";
pub const VALIDATE_SCHEMA: &str = "validate_schema";
pub const GENERATE_TESTCASES: &str = "generate_testcases";
pub const VALIDATE_STATEMENTS: &str = "validate_statements";
pub const FINALIZE: &str = "finalize";

/// Retry-loop key of schema proposals.
pub const DESIGN_LOOP: &str = "design_schema";
/// Retry-loop key of test statement generation.
pub const STATEMENT_LOOP: &str = "validate_statements";

pub const OUTCOME_COMPLETED: &str = "completed";
pub const OUTCOME_DESIGN_EXHAUSTED: &str = "design_exhausted";
pub const OUTCOME_STATEMENTS_EXHAUSTED: &str = "statements_exhausted";

/// Input of a schema proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignRequest {
    pub request: String,
    pub schema: Schema,
    /// 1-based
    pub attempt: u32,
    /// Reason the previous proposal was rejected
    pub last_failure: Option<Value>,
}

/// Input of test case generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestcaseRequest {
    pub request: String,
    pub schema: Schema,
    pub ddl: String,
    /// 1-based
    pub attempt: u32,
    pub last_failure: Option<Value>,
}

/// A named DML statement exercising the schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Testcase {
    pub title: String,
    pub sql: String,
}

pub type SchemaProposer = dyn ComputeStep<DesignRequest, SchemaPatch>;
pub type TestcaseGenerator = dyn ComputeStep<TestcaseRequest, Vec<Testcase>>;
pub type StatementExecutor = dyn ComputeStep<SqlBatch, Vec<StatementResult>>;

/// Collaborators of the workflow.
#[derive(Clone)]
pub struct DesignerDeps {
    pub proposer: Arc<SchemaProposer>,
    pub generator: Arc<TestcaseGenerator>,
    pub executor: Arc<StatementExecutor>,
}

impl DesignerDeps {
    /// Statements run on [`SqliteStatementExecutor`].
    pub fn new(proposer: Arc<SchemaProposer>, generator: Arc<TestcaseGenerator>) -> Self {
        Self {
            proposer,
            generator,
            executor: Arc::new(SqliteStatementExecutor::new()),
        }
    }

    pub fn with_executor(mut self, executor: Arc<StatementExecutor>) -> Self {
        self.executor = executor;
        self
    }
}

fn default_attempts() -> u32 {
    3
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignerConfig {
    #[serde(default = "default_attempts")]
    pub max_design_attempts: u32,

    #[serde(default = "default_attempts")]
    pub max_statement_attempts: u32,

    /// Picks the per-step retry policy for compute failures
    #[serde(default)]
    pub interactive: bool,
}

impl Default for DesignerConfig {
    fn default() -> Self {
        Self {
            max_design_attempts: default_attempts(),
            max_statement_attempts: default_attempts(),
            interactive: false,
        }
    }
}

impl DesignerConfig {
    pub fn design_loop(&self) -> ValidationLoop {
        ValidationLoop::new(
            DESIGN_LOOP,
            self.max_design_attempts,
            DESIGN_SCHEMA,
            GENERATE_TESTCASES,
            FINALIZE,
        )
    }

    pub fn statement_loop(&self) -> ValidationLoop {
        ValidationLoop::new(
            STATEMENT_LOOP,
            self.max_statement_attempts,
            GENERATE_TESTCASES,
            FINALIZE,
            FINALIZE,
        )
    }
}

/// Channels of the design state, loop channels included.
pub fn workflow_schema(config: &DesignerConfig) -> StateSchema {
    let mut schema = StateSchema::new()
        .channel("request", OverwriteReducer, json!(""))
        .channel("messages", AppendReducer, json!([]))
        .channel("patch", OverwriteReducer, Value::Null)
        .channel("document", OverwriteReducer, json!({"schema": {"tables": {}}, "version": 0}))
        .channel("ddl", OverwriteReducer, json!(""))
        .channel("testcases", AppendReducer, json!([]))
        .channel("current_testcases", OverwriteReducer, json!([]))
        .channel("validation_report", OverwriteReducer, Value::Null)
        .channel("outcome", OverwriteReducer, Value::Null);
    schema.extend(&config.design_loop().channels());
    schema.extend(&config.statement_loop().channels());
    schema
}

/// Collaborators and loops shared by the steps of one graph.
pub struct Pipeline {
    deps: DesignerDeps,
    design: ValidationLoop,
    statements: ValidationLoop,
}

/// The closed set of steps the design graph is made of.
#[derive(Clone)]
pub enum DesignStep {
    RecordRequest,
    DesignSchema(Arc<Pipeline>),
    ValidateSchema(Arc<Pipeline>),
    GenerateTestcases(Arc<Pipeline>),
    ValidateStatements(Arc<Pipeline>),
    Finalize(Arc<Pipeline>),
}

impl DesignStep {
    pub fn node(&self) -> &'static str {
        match self {
            Self::RecordRequest => RECORD_REQUEST,
            Self::DesignSchema(_) => DESIGN_SCHEMA,
            Self::ValidateSchema(_) => VALIDATE_SCHEMA,
            Self::GenerateTestcases(_) => GENERATE_TESTCASES,
            Self::ValidateStatements(_) => VALIDATE_STATEMENTS,
            Self::Finalize(_) => FINALIZE,
        }
    }
}

#[async_trait]
impl Step for DesignStep {
    async fn execute(&self, state: &Value, ctx: &StepContext) -> std::result::Result<StepOutput, StepError> {
        let update = match self {
            Self::RecordRequest => record_request(state)?,
            Self::DesignSchema(pipeline) => pipeline.design_schema(state).await?,
            Self::ValidateSchema(pipeline) => pipeline.validate_schema(state, ctx).await?,
            Self::GenerateTestcases(pipeline) => pipeline.generate_testcases(state).await?,
            Self::ValidateStatements(pipeline) => pipeline.validate_statements(state, ctx).await?,
            Self::Finalize(pipeline) => pipeline.finalize(state),
        };
        Ok(StepOutput::update(update))
    }

    fn name(&self) -> &str {
        self.node()
    }
}

fn read<T: DeserializeOwned + Default>(state: &Value, channel: &str) -> std::result::Result<T, StepError> {
    match state.get(channel) {
        None | Some(Value::Null) => Ok(T::default()),
        Some(value) => Ok(serde_json::from_value(value.clone())?),
    }
}

fn request_text(state: &Value) -> String {
    state["request"].as_str().unwrap_or_default().to_string()
}

fn message(role: &str, content: impl Into<String>) -> Value {
    json!([{ "role": role, "content": content.into() }])
}

/// Shallow merge of two partial updates; `extra` wins on shared keys.
fn merge(base: Value, extra: Value) -> Value {
    let (Value::Object(mut base), Value::Object(extra)) = (base, extra) else {
        return Value::Object(Map::new());
    };
    base.extend(extra);
    Value::Object(base)
}

fn record_request(state: &Value) -> std::result::Result<Value, StepError> {
    let request = request_text(state);
    if request.trim().is_empty() {
        return Err(StepError::fatal("design request is empty"));
    }
    Ok(json!({ "messages": message("user", request) }))
}

impl Pipeline {
    async fn design_schema(&self, state: &Value) -> std::result::Result<Value, StepError> {
        let document: DesignDocument = read(state, "document")?;
        let request = DesignRequest {
            request: request_text(state),
            schema: document.schema,
            attempt: self.design.retry_count(state) + 1,
            last_failure: self.design.pending_failure(state),
        };
        let attempt = request.attempt;

        let patch = self.deps.proposer.invoke(request).await?;
        info!(attempt, ops = patch.ops.len(), "schema patch proposed");

        Ok(json!({
            "patch": serde_json::to_value(&patch)?,
            "messages": message("assistant", format!("Proposed {} schema change(s)", patch.ops.len())),
        }))
    }

    async fn validate_schema(
        &self,
        state: &Value,
        ctx: &StepContext,
    ) -> std::result::Result<Value, StepError> {
        let mut document: DesignDocument = read(state, "document")?;
        let Some(patch) = state
            .get("patch")
            .filter(|patch| !patch.is_null())
            .map(|patch| serde_json::from_value::<SchemaPatch>(patch.clone()))
            .transpose()?
        else {
            return Ok(self.design_failure(state, json!({
                "stage": "patch",
                "category": FailureCategory::Schema,
                "message": "no schema patch was proposed",
            })));
        };

        let schema = match document.preview(&patch) {
            Ok(schema) => schema,
            Err(error) => {
                return Ok(self.design_failure(state, json!({
                    "stage": "patch",
                    "category": FailureCategory::Schema,
                    "message": error.to_string(),
                })));
            }
        };

        let ddl = schema.to_ddl();
        let results = self.deps.executor.invoke(SqlBatch::new(ddl.clone())).await?;
        let report = BatchReport::from_results(results);
        if report.failed {
            let failure = self.design_failure(state, json!({
                "stage": "ddl",
                "category": report.failures().first().map(|f| f.category),
                "message": report.summary(),
                "failures": serde_json::to_value(report.failures())?,
            }));
            return Ok(merge(failure, json!({ "validation_report": serde_json::to_value(&report)? })));
        }

        // Preview already succeeded on this document, so the commit cannot be rejected.
        let receipt = document
            .commit(&patch)
            .map_err(|error| StepError::fatal(error.to_string()))?;
        info!(
            thread_id = %ctx.config.thread.thread_id,
            version = receipt.version,
            ops = receipt.ops_applied,
            "schema committed"
        );

        let committed = json!({
            "document": serde_json::to_value(&document)?,
            "ddl": ddl,
            "validation_report": serde_json::to_value(&report)?,
            "messages": message(
                "assistant",
                format!("Schema version {} committed ({} change(s))", receipt.version, receipt.ops_applied),
            ),
        });
        Ok(merge(committed, self.design.record_success(state)))
    }

    fn design_failure(&self, state: &Value, reason: Value) -> Value {
        let summary = reason["message"].as_str().unwrap_or_default().to_string();
        let (update, verdict) = self.design.record_failure(state, reason);
        log_verdict(&self.design, verdict, &summary);
        merge(
            update,
            json!({ "messages": message("assistant", format!("Schema rejected: {summary}")) }),
        )
    }

    async fn generate_testcases(&self, state: &Value) -> std::result::Result<Value, StepError> {
        let document: DesignDocument = read(state, "document")?;
        let request = TestcaseRequest {
            request: request_text(state),
            schema: document.schema,
            ddl: state["ddl"].as_str().unwrap_or_default().to_string(),
            attempt: self.statements.retry_count(state) + 1,
            last_failure: self.statements.pending_failure(state),
        };
        let attempt = request.attempt;

        let testcases = self.deps.generator.invoke(request).await?;
        info!(attempt, testcases = testcases.len(), "test cases generated");

        let testcases = serde_json::to_value(&testcases)?;
        Ok(json!({
            "testcases": testcases.clone(),
            "current_testcases": testcases,
        }))
    }

    async fn validate_statements(
        &self,
        state: &Value,
        ctx: &StepContext,
    ) -> std::result::Result<Value, StepError> {
        let testcases: Vec<Testcase> = read(state, "current_testcases")?;
        if testcases.is_empty() {
            return Ok(self.statement_failure(state, json!({
                "stage": "testcases",
                "category": FailureCategory::SqlQuality,
                "message": "no test cases were generated",
            })));
        }

        let dml = testcases
            .iter()
            .map(|testcase| {
                let sql = testcase.sql.trim();
                if sql.ends_with(';') {
                    sql.to_string()
                } else {
                    format!("{sql};")
                }
            })
            .collect::<Vec<_>>()
            .join("\n");
        let batch = SqlBatch::combine(state["ddl"].as_str().unwrap_or_default(), &dml);

        let results = self.deps.executor.invoke(batch).await?;
        let report = BatchReport::from_results(results);
        let report_value = json!({ "validation_report": serde_json::to_value(&report)? });

        if report.failed {
            let failures = report.failures();
            let failure = self.statement_failure(state, json!({
                "stage": "statements",
                "category": failures.first().map(|f| f.category),
                "message": report.summary(),
                "failures": serde_json::to_value(&failures)?,
            }));
            return Ok(merge(failure, report_value));
        }

        info!(
            thread_id = %ctx.config.thread.thread_id,
            statements = report.results.len(),
            "test statements passed"
        );
        let passed = merge(
            report_value,
            json!({ "messages": message("assistant", format!("{} test case(s) passed", testcases.len())) }),
        );
        Ok(merge(passed, self.statements.record_success(state)))
    }

    fn statement_failure(&self, state: &Value, reason: Value) -> Value {
        let summary = reason["message"].as_str().unwrap_or_default().to_string();
        let (update, verdict) = self.statements.record_failure(state, reason);
        log_verdict(&self.statements, verdict, &summary);
        merge(
            update,
            json!({ "messages": message("assistant", format!("Test statements failed: {summary}")) }),
        )
    }

    fn finalize(&self, state: &Value) -> Value {
        let outcome = if self.design.is_exhausted(state) {
            OUTCOME_DESIGN_EXHAUSTED
        } else if self.statements.is_exhausted(state) {
            OUTCOME_STATEMENTS_EXHAUSTED
        } else {
            OUTCOME_COMPLETED
        };
        info!(outcome, "design workflow finished");
        json!({
            "outcome": outcome,
            "messages": message("assistant", format!("Design workflow {outcome}")),
        })
    }
}

fn log_verdict(loop_: &ValidationLoop, verdict: Verdict, summary: &str) {
    match verdict {
        Verdict::Retry => info!(loop_key = %loop_.key, %summary, "validation failed, retrying"),
        Verdict::Exhausted => warn!(
            loop_key = %loop_.key,
            max_attempts = loop_.max_attempts,
            %summary,
            "validation attempts exhausted"
        ),
    }
}

/// Build the design graph. Attach a checkpointer to the result to make runs durable.
pub fn design_workflow(deps: DesignerDeps, config: &DesignerConfig) -> Result<CompiledGraph> {
    let design = config.design_loop();
    let statements = config.statement_loop();
    let pipeline = Arc::new(Pipeline {
        deps,
        design: design.clone(),
        statements: statements.clone(),
    });
    let policy = RetryPolicy::for_environment(config.interactive);

    let mut graph = StateGraph::new(workflow_schema(config));
    graph
        .add_step(RECORD_REQUEST, DesignStep::RecordRequest)
        .add_step_with_retry(DESIGN_SCHEMA, DesignStep::DesignSchema(pipeline.clone()), policy.clone())
        .add_step_with_retry(VALIDATE_SCHEMA, DesignStep::ValidateSchema(pipeline.clone()), policy.clone())
        .add_step_with_retry(
            GENERATE_TESTCASES,
            DesignStep::GenerateTestcases(pipeline.clone()),
            policy.clone(),
        )
        .add_step_with_retry(
            VALIDATE_STATEMENTS,
            DesignStep::ValidateStatements(pipeline.clone()),
            policy,
        )
        .add_step(FINALIZE, DesignStep::Finalize(pipeline))
        .add_edge(START, RECORD_REQUEST)
        .add_edge(RECORD_REQUEST, DESIGN_SCHEMA)
        .add_edge(DESIGN_SCHEMA, VALIDATE_SCHEMA)
        .add_edge(GENERATE_TESTCASES, VALIDATE_STATEMENTS)
        .add_edge(FINALIZE, END);

    let branches = design.branches();
    graph.add_conditional_edge(VALIDATE_SCHEMA, move |state| design.route(state), branches);
    let branches = statements.branches();
    graph.add_conditional_edge(VALIDATE_STATEMENTS, move |state| statements.route(state), branches);

    Ok(graph.compile()?)
}
