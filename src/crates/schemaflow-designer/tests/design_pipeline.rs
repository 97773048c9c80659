//! End-to-end runs of the design workflow on the in-memory checkpoint store.

use async_trait::async_trait;
use schemaflow_checkpoint::{CheckpointSaver, InMemoryCheckpointSaver, TenantId, ThreadRef};
use schemaflow_core::{ComputeError, ComputeStep, GraphError, RunConfig};
use schemaflow_designer::{
    design_workflow, Column, Constraint, DesignRequest, DesignerConfig, DesignerDeps, Index,
    PatchOp, SchemaPatch, ScriptedGenerator, ScriptedProposer, Table, Testcase,
};
use serde_json::{json, Value};
use std::sync::Arc;

const TENANT: &str = "org-1";

fn users_patch() -> SchemaPatch {
    SchemaPatch::new(vec![PatchOp::AddTable {
        table: Table::new("users")
            .column(Column::new("id", "integer").not_null())
            .column(Column::new("email", "text").not_null())
            .constraint(
                "users_pkey",
                Constraint::PrimaryKey {
                    columns: vec!["id".into()],
                },
            )
            .index(Index::new("users_email_idx", &["email"]).unique()),
    }])
}

/// Previews fine but the DDL does not parse.
fn broken_check_patch() -> SchemaPatch {
    SchemaPatch::new(vec![PatchOp::AddTable {
        table: Table::new("users").column(Column::new("id", "integer").with_check("id >")),
    }])
}

/// Rejected by preview: the foreign key targets a table that does not exist.
fn dangling_fk_patch() -> SchemaPatch {
    SchemaPatch::new(vec![
        PatchOp::AddTable {
            table: Table::new("posts")
                .column(Column::new("id", "integer"))
                .column(Column::new("author_id", "integer")),
        },
        PatchOp::AddConstraint {
            table: "posts".into(),
            name: "posts_author_fk".into(),
            constraint: Constraint::ForeignKey {
                columns: vec!["author_id".into()],
                target_table: "accounts".into(),
                target_columns: vec!["id".into()],
                on_update: Default::default(),
                on_delete: Default::default(),
            },
        },
    ])
}

fn good_testcases() -> Vec<Testcase> {
    vec![
        Testcase {
            title: "register user".into(),
            sql: "INSERT INTO users (id, email) VALUES (1, 'a@example.com')".into(),
        },
        Testcase {
            title: "look up user".into(),
            sql: "SELECT email FROM users WHERE id = 1;".into(),
        },
    ]
}

fn failing_testcases() -> Vec<Testcase> {
    vec![Testcase {
        title: "user without email".into(),
        sql: "INSERT INTO users (id) VALUES (2)".into(),
    }]
}

struct Harness {
    proposer: Arc<ScriptedProposer>,
    generator: Arc<ScriptedGenerator>,
    saver: Arc<InMemoryCheckpointSaver>,
}

impl Harness {
    fn new(patches: Vec<SchemaPatch>, batches: Vec<Vec<Testcase>>) -> Self {
        Self {
            proposer: Arc::new(ScriptedProposer::new(patches)),
            generator: Arc::new(ScriptedGenerator::new(batches)),
            saver: Arc::new(InMemoryCheckpointSaver::new(TENANT).unwrap()),
        }
    }

    async fn run(&self, config: &DesignerConfig) -> Value {
        let deps = DesignerDeps::new(self.proposer.clone(), self.generator.clone());
        let graph = design_workflow(deps, config)
            .unwrap()
            .with_checkpointer(self.saver.clone());
        graph
            .invoke(json!({"request": "users with unique emails"}), run_config("session-1"))
            .await
            .unwrap()
            .state
    }
}

fn run_config(thread_id: &str) -> RunConfig {
    RunConfig::new(TenantId::new(TENANT).unwrap(), thread_id)
}

fn with_attempts(design: u32, statements: u32) -> DesignerConfig {
    DesignerConfig {
        max_design_attempts: design,
        max_statement_attempts: statements,
        interactive: false,
    }
}

#[tokio::test]
async fn test_pipeline_completes() {
    let harness = Harness::new(vec![users_patch()], vec![good_testcases()]);
    let state = harness.run(&DesignerConfig::default()).await;

    assert_eq!(state["outcome"], "completed");
    assert_eq!(state["document"]["version"], 1);
    assert!(state["document"]["schema"]["tables"]["users"].is_object());
    assert!(state["ddl"].as_str().unwrap().starts_with("CREATE TABLE \"users\""));
    assert_eq!(state["retry_count"], json!({}));
    assert_eq!(state["testcases"].as_array().unwrap().len(), 2);
    assert_eq!(state["validation_report"]["failed"], false);

    // One checkpoint per step plus the input checkpoint.
    let saver = harness.saver.clone();
    assert_eq!(saver.backend().checkpoint_count().await, 7);
    let latest = saver.get(&ThreadRef::new("session-1")).await.unwrap();
    assert_eq!(latest.metadata.next.as_deref(), Some(schemaflow_core::END));
}

#[tokio::test]
async fn test_rejected_patch_is_retried_with_feedback() {
    let harness = Harness::new(vec![dangling_fk_patch(), users_patch()], vec![good_testcases()]);
    let state = harness.run(&with_attempts(3, 3)).await;

    assert_eq!(state["outcome"], "completed");
    assert_eq!(state["retry_count"]["design_schema"], 1);
    assert_eq!(state["design_schema_exhausted"], false);
    assert_eq!(state["design_schema_status"], "passed");
    assert_eq!(state["design_schema_failure"]["stage"], "patch");
    assert!(state["design_schema_failure"]["message"]
        .as_str()
        .unwrap()
        .contains("accounts"));
    assert_eq!(harness.proposer.calls(), 2);
}

#[tokio::test]
async fn test_failed_ddl_feeds_design_loop() {
    let harness = Harness::new(vec![broken_check_patch(), users_patch()], vec![good_testcases()]);
    let state = harness.run(&with_attempts(3, 3)).await;

    assert_eq!(state["outcome"], "completed");
    assert_eq!(state["retry_count"]["design_schema"], 1);
    assert_eq!(state["design_schema_failure"]["stage"], "ddl");
    assert_eq!(state["design_schema_failure"]["category"], "sql_quality");
    // The broken proposal never reached the document.
    assert_eq!(state["document"]["version"], 1);
}

#[tokio::test]
async fn test_single_attempt_exhausts_design() {
    let harness = Harness::new(vec![dangling_fk_patch()], vec![good_testcases()]);
    let state = harness.run(&with_attempts(1, 3)).await;

    assert_eq!(state["outcome"], "design_exhausted");
    assert_eq!(state["design_schema_exhausted"], true);
    assert_eq!(state["retry_count"]["design_schema"], 1);
    assert_eq!(harness.proposer.calls(), 1);
    assert_eq!(harness.generator.calls(), 0);
    assert_eq!(state["document"]["version"], 0);
}

#[tokio::test]
async fn test_no_proposal_beyond_budget() {
    let harness = Harness::new(vec![dangling_fk_patch()], vec![good_testcases()]);
    let state = harness.run(&with_attempts(3, 3)).await;

    assert_eq!(state["outcome"], "design_exhausted");
    assert_eq!(state["retry_count"]["design_schema"], 3);
    assert_eq!(harness.proposer.calls(), 3);
}

#[tokio::test]
async fn test_statement_loop_exhausts() {
    let harness = Harness::new(vec![users_patch()], vec![failing_testcases()]);
    let state = harness.run(&with_attempts(3, 2)).await;

    assert_eq!(state["outcome"], "statements_exhausted");
    assert_eq!(state["retry_count"], json!({"validate_statements": 2}));
    assert_eq!(state["validate_statements_exhausted"], true);
    assert_eq!(state["validate_statements_failure"]["category"], "schema");
    assert_eq!(harness.generator.calls(), 2);
    // Schema was committed before the statements failed.
    assert_eq!(state["document"]["version"], 1);
}

#[tokio::test]
async fn test_statement_retry_then_pass() {
    let harness = Harness::new(
        vec![users_patch()],
        vec![failing_testcases(), good_testcases()],
    );
    let state = harness.run(&with_attempts(3, 3)).await;

    assert_eq!(state["outcome"], "completed");
    assert_eq!(state["retry_count"]["validate_statements"], 1);
    // History keeps both generations; validation only ran the latest.
    assert_eq!(state["testcases"].as_array().unwrap().len(), 3);
    assert_eq!(state["current_testcases"].as_array().unwrap().len(), 2);
}

struct UnavailableProposer;

#[async_trait]
impl ComputeStep<DesignRequest, SchemaPatch> for UnavailableProposer {
    async fn invoke(&self, _request: DesignRequest) -> Result<SchemaPatch, ComputeError> {
        Err(ComputeError::failed("model endpoint unreachable"))
    }
}

#[tokio::test]
async fn test_resume_after_compute_failure() {
    let saver = Arc::new(InMemoryCheckpointSaver::new(TENANT).unwrap());
    let generator = Arc::new(ScriptedGenerator::new(vec![good_testcases()]));
    let config = DesignerConfig::default();

    let first = design_workflow(
        DesignerDeps::new(Arc::new(UnavailableProposer), generator.clone()),
        &config,
    )
    .unwrap()
    .with_checkpointer(saver.clone());
    let error = first
        .invoke(json!({"request": "users"}), run_config("session-2"))
        .await
        .unwrap_err();
    assert!(matches!(error, GraphError::NodeExecution { ref node, .. } if node == "design_schema"));
    assert!(error.is_resumable());

    let proposer = Arc::new(ScriptedProposer::new(vec![users_patch()]));
    let second = design_workflow(DesignerDeps::new(proposer.clone(), generator), &config)
        .unwrap()
        .with_checkpointer(saver);
    let outcome = second.resume(run_config("session-2")).await.unwrap();

    assert_eq!(outcome.state["outcome"], "completed");
    assert_eq!(proposer.calls(), 1);
    // record_request ran once, in the first process.
    let users: Vec<_> = outcome.state["messages"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|m| m["role"] == "user")
        .collect();
    assert_eq!(users.len(), 1);
}
