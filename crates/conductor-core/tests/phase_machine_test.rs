//! Integration tests for the phase state machine: gated transitions,
//! history, context accumulation, and template materialization.

use std::sync::Arc;

use sqlx::PgPool;
use uuid::Uuid;

use conductor_core::bus::EventBus;
use conductor_core::error::EngineError;
use conductor_core::phase::templates::WorkflowDefinition;
use conductor_core::phase::{DigestSummarizer, NewTicketSpec, PhaseMachine};
use conductor_db::models::{Priority, TaskStatus, TicketStatus};
use conductor_db::queries::tasks as task_db;
use conductor_test_utils::{create_test_db, drop_test_db};

fn machine(pool: &PgPool, workflow: WorkflowDefinition) -> PhaseMachine {
    PhaseMachine::new(
        pool.clone(),
        EventBus::new(pool.clone(), 256),
        Arc::new(workflow),
        Arc::new(DigestSummarizer),
    )
}

async fn standard_machine(pool: &PgPool) -> PhaseMachine {
    let machine = machine(pool, WorkflowDefinition::standard());
    machine.sync_definitions().await.expect("sync should succeed");
    machine
}

fn ticket_spec(title: &str) -> NewTicketSpec {
    NewTicketSpec {
        title: title.into(),
        description: "test".into(),
        owner: "alice".into(),
        priority: Priority::Normal,
        initial_phase: None,
    }
}

/// Workflow with an artifact-gated phase and task templates.
fn gated_workflow() -> WorkflowDefinition {
    WorkflowDefinition::from_toml_str(
        r#"
[[phases]]
id = "draft"
position = 0
next = ["review"]
prompt = "Produce the document."
expected_outputs = ["draft_doc"]

[[phases.tasks]]
name = "outline"
task_type = "analysis"
description = "Outline the document"

[[phases.tasks]]
name = "write"
task_type = "code"
description = "Write the document"
depends_on = ["outline"]

[[phases]]
id = "review"
position = 1
terminal = true
"#,
    )
    .expect("workflow should parse")
}

#[tokio::test]
async fn create_ticket_enters_initial_phase() {
    let (pool, db_name) = create_test_db().await;
    let machine = standard_machine(&pool).await;

    let ticket = machine
        .create_ticket(ticket_spec("Add /health endpoint"))
        .await
        .expect("create should succeed");

    assert_eq!(ticket.current_phase, "backlog");
    assert_eq!(ticket.status, TicketStatus::Active);
    assert!(ticket.previous_phase.is_none());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn invalid_transition_rejected() {
    let (pool, db_name) = create_test_db().await;
    let machine = standard_machine(&pool).await;

    let ticket = machine.create_ticket(ticket_spec("t")).await.unwrap();
    let err = machine
        .transition(ticket.id, "design", "skip ahead", "alice")
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "conflict");
    assert!(err.to_string().contains("invalid transition"));

    let ticket = machine.get_ticket(ticket.id).await.unwrap();
    assert_eq!(ticket.current_phase, "backlog", "phase unchanged on failure");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn unknown_phase_rejected() {
    let (pool, db_name) = create_test_db().await;
    let machine = standard_machine(&pool).await;

    let ticket = machine.create_ticket(ticket_spec("t")).await.unwrap();
    let err = machine
        .transition(ticket.id, "shipping", "typo", "alice")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_input");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn gate_blocks_until_artifact_recorded() {
    let (pool, db_name) = create_test_db().await;
    let machine = machine(&pool, gated_workflow());
    machine.sync_definitions().await.unwrap();

    let ticket = machine.create_ticket(ticket_spec("doc work")).await.unwrap();

    // Complete both template tasks so only the artifact is missing.
    for task in task_db::list_for_ticket(&pool, ticket.id).await.unwrap() {
        task_db::promote_ready(&pool, None).await.unwrap();
        task_db::assign(&pool, task.id, Uuid::new_v4()).await.unwrap();
        task_db::transition_status(
            &pool,
            task.id,
            TaskStatus::Assigned,
            TaskStatus::Running,
            Some(chrono::Utc::now()),
            None,
        )
        .await
        .unwrap();
        task_db::complete(&pool, task.id, &serde_json::json!({}))
            .await
            .unwrap();
    }

    let err = machine
        .transition(ticket.id, "review", "ready", "alice")
        .await
        .unwrap_err();
    match &err {
        EngineError::GateNotSatisfied { missing } => {
            assert!(
                missing.iter().any(|m| m.contains("draft_doc")),
                "missing list should name the artifact: {missing:?}"
            );
        }
        other => panic!("expected gate_not_satisfied, got {other:?}"),
    }

    machine
        .record_artifact(
            ticket.id,
            None,
            "draft_doc".into(),
            serde_json::json!({ "url": "s3://docs/draft" }),
            None,
        )
        .await
        .unwrap();

    let ticket = machine
        .transition(ticket.id, "review", "ready", "alice")
        .await
        .expect("gate should pass with artifact");
    assert_eq!(ticket.current_phase, "review");
    assert_eq!(ticket.status, TicketStatus::Done, "terminal phase finishes the ticket");
    assert_eq!(ticket.previous_phase.as_deref(), Some("draft"));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn templates_materialize_with_dependencies() {
    let (pool, db_name) = create_test_db().await;
    let machine = machine(&pool, gated_workflow());
    machine.sync_definitions().await.unwrap();

    let ticket = machine.create_ticket(ticket_spec("doc work")).await.unwrap();
    let tasks = task_db::list_for_ticket(&pool, ticket.id).await.unwrap();
    assert_eq!(tasks.len(), 2);

    let outline = tasks.iter().find(|t| t.task_type == "analysis").unwrap();
    let write = tasks.iter().find(|t| t.task_type == "code").unwrap();

    let deps = task_db::dependencies_of(&pool, write.id).await.unwrap();
    assert_eq!(deps, vec![outline.id], "template dependency resolved to task id");

    // Only the independent task promotes.
    let promoted = task_db::promote_ready(&pool, None).await.unwrap();
    let ids: Vec<Uuid> = promoted.iter().map(|t| t.id).collect();
    assert!(ids.contains(&outline.id));
    assert!(!ids.contains(&write.id));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn blocked_bypasses_gate_and_reactivates_on_exit() {
    let (pool, db_name) = create_test_db().await;
    let machine = standard_machine(&pool).await;

    let ticket = machine.create_ticket(ticket_spec("t")).await.unwrap();
    machine
        .transition(ticket.id, "requirements", "start", "alice")
        .await
        .unwrap();

    // An open required task keeps the requirements gate shut.
    task_db::insert_task(
        &pool,
        &task_db::NewTask {
            ticket_id: ticket.id,
            phase_id: "requirements".into(),
            task_type: "analysis".into(),
            description: "interview stakeholders".into(),
            priority: Priority::Normal,
            optional: false,
            max_retries: 3,
            timeout_seconds: None,
            required_resources: vec![],
            required_capabilities: vec![],
        },
    )
    .await
    .unwrap();

    let err = machine
        .transition(ticket.id, "design", "premature", "alice")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "gate_not_satisfied");

    // Blocking is always allowed.
    let ticket_row = machine
        .transition(ticket.id, "blocked", "waiting on customer", "alice")
        .await
        .expect("blocked bypasses the gate");
    assert_eq!(ticket_row.status, TicketStatus::Blocked);
    assert!(ticket_row.blocking_reasons.as_array().is_some_and(|a| !a.is_empty()));

    // Returning from blocked reactivates.
    let ticket_row = machine
        .transition(ticket.id, "requirements", "customer answered", "alice")
        .await
        .unwrap();
    assert_eq!(ticket_row.status, TicketStatus::Active);
    assert_eq!(
        ticket_row.blocking_reasons,
        serde_json::json!([]),
        "reasons cleared on reactivation"
    );

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn history_forms_a_chain() {
    let (pool, db_name) = create_test_db().await;
    let machine = standard_machine(&pool).await;

    let ticket = machine.create_ticket(ticket_spec("t")).await.unwrap();
    machine
        .transition(ticket.id, "requirements", "start", "alice")
        .await
        .unwrap();
    machine
        .transition(ticket.id, "design", "reqs done", "alice")
        .await
        .unwrap();
    machine
        .transition(ticket.id, "implementation", "design done", "bob")
        .await
        .unwrap();

    let history = machine.history(ticket.id).await.unwrap();
    assert_eq!(history.len(), 3);
    for pair in history.windows(2) {
        assert_eq!(
            pair[0].to_phase, pair[1].from_phase,
            "each entry's target is the next entry's source"
        );
    }
    assert_eq!(history[0].from_phase, "backlog");
    assert_eq!(history[2].actor, "bob");

    // Context accumulated one entry per finished phase.
    let ticket = machine.get_ticket(ticket.id).await.unwrap();
    let ctx = ticket.context.as_object().unwrap();
    assert!(ctx.contains_key("phase:backlog"));
    assert!(ctx.contains_key("phase:requirements"));
    assert!(ctx.contains_key("phase:design"));
    assert!(ticket.context_summary.is_some());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn terminal_phase_admits_no_exit() {
    let (pool, db_name) = create_test_db().await;
    let machine = machine(&pool, gated_workflow());
    machine.sync_definitions().await.unwrap();

    let ticket = machine
        .create_ticket(NewTicketSpec {
            initial_phase: Some("review".into()),
            ..ticket_spec("already reviewed")
        })
        .await
        .unwrap();

    let err = machine
        .transition(ticket.id, "draft", "go back", "alice")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "conflict");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn archive_is_idempotent() {
    let (pool, db_name) = create_test_db().await;
    let machine = standard_machine(&pool).await;

    let ticket = machine.create_ticket(ticket_spec("t")).await.unwrap();
    let archived = machine.archive_ticket(ticket.id, "obsolete").await.unwrap();
    assert_eq!(archived.status, TicketStatus::Archived);

    let archived_again = machine.archive_ticket(ticket.id, "obsolete").await.unwrap();
    assert_eq!(archived_again.status, TicketStatus::Archived);

    pool.close().await;
    drop_test_db(&db_name).await;
}
