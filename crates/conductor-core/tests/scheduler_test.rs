//! Integration tests for the scheduler: enqueue validation, readiness,
//! retry classification, cancellation, and timeout handling.

use std::sync::Arc;

use sqlx::PgPool;
use uuid::Uuid;

use conductor_core::bus::EventBus;
use conductor_core::config::{LockConfig, TaskConfig};
use conductor_core::lock::LockCoordinator;
use conductor_core::phase::templates::WorkflowDefinition;
use conductor_core::phase::{DigestSummarizer, NewTicketSpec, PhaseMachine};
use conductor_core::sched::{EnqueueTask, TaskScheduler, error_kinds};
use conductor_db::models::{Priority, TaskStatus, TicketStatus};
use conductor_db::queries::tickets as ticket_db;
use conductor_test_utils::{create_test_db, drop_test_db};

struct Harness {
    pool: PgPool,
    db_name: String,
    bus: EventBus,
    sched: TaskScheduler,
    ticket_id: Uuid,
}

async fn setup() -> Harness {
    let (pool, db_name) = create_test_db().await;
    let bus = EventBus::new(pool.clone(), 256);
    let locks = LockCoordinator::new(
        pool.clone(),
        bus.clone(),
        LockConfig {
            max_retries: 1,
            base_backoff_ms: 10,
            ..LockConfig::default()
        },
    );
    let sched = TaskScheduler::new(
        pool.clone(),
        bus.clone(),
        locks,
        TaskConfig {
            default_max_retries: 3,
            retry_backoff_base_ms: 20,
        },
    );

    let machine = PhaseMachine::new(
        pool.clone(),
        bus.clone(),
        Arc::new(WorkflowDefinition::standard()),
        Arc::new(DigestSummarizer),
    );
    machine.sync_definitions().await.unwrap();
    let ticket = machine
        .create_ticket(NewTicketSpec {
            title: "scheduler test".into(),
            description: String::new(),
            owner: "alice".into(),
            priority: Priority::Normal,
            initial_phase: None,
        })
        .await
        .unwrap();

    Harness {
        pool,
        db_name,
        bus,
        sched,
        ticket_id: ticket.id,
    }
}

fn spec(h: &Harness, task_type: &str) -> EnqueueTask {
    EnqueueTask {
        ticket_id: h.ticket_id,
        phase_id: None,
        task_type: task_type.into(),
        description: format!("{task_type} work"),
        priority: Priority::Normal,
        optional: false,
        dependencies: vec![],
        required_resources: vec![],
        required_capabilities: vec![],
        max_retries: None,
        timeout_seconds: None,
    }
}

/// Walk a task to `running` through the public surface.
async fn run_task(h: &Harness, task_id: Uuid) {
    h.sched.promote_ready(None).await.unwrap();
    conductor_db::queries::tasks::assign(&h.pool, task_id, Uuid::new_v4())
        .await
        .unwrap();
    h.sched.start_task(task_id).await.unwrap();
}

#[tokio::test]
async fn enqueue_rejects_cross_ticket_dependency() {
    let h = setup().await;

    let other = ticket_db::insert_ticket(
        &h.pool,
        &ticket_db::NewTicket {
            title: "other".into(),
            description: String::new(),
            owner: "bob".into(),
            current_phase: "backlog".into(),
            priority: Priority::Normal,
        },
    )
    .await
    .unwrap();
    let foreign = h
        .sched
        .enqueue(EnqueueTask {
            ticket_id: other.id,
            ..spec(&h, "foreign")
        })
        .await
        .unwrap();

    let err = h
        .sched
        .enqueue(EnqueueTask {
            dependencies: vec![foreign.id],
            ..spec(&h, "local")
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_input");

    h.pool.close().await;
    drop_test_db(&h.db_name).await;
}

#[tokio::test]
async fn dependency_cycle_rejected() {
    let h = setup().await;

    let a = h.sched.enqueue(spec(&h, "a")).await.unwrap();
    let b = h
        .sched
        .enqueue(EnqueueTask {
            dependencies: vec![a.id],
            ..spec(&h, "b")
        })
        .await
        .unwrap();

    let err = h.sched.add_dependency(a.id, b.id).await.unwrap_err();
    assert_eq!(err.kind(), "conflict");
    assert!(err.to_string().contains("cycle"));

    // The rejected edge must not persist.
    let deps = conductor_db::queries::tasks::dependencies_of(&h.pool, a.id)
        .await
        .unwrap();
    assert!(deps.is_empty());

    let err = h.sched.add_dependency(a.id, a.id).await.unwrap_err();
    assert_eq!(err.kind(), "conflict");

    h.pool.close().await;
    drop_test_db(&h.db_name).await;
}

#[tokio::test]
async fn complete_unlocks_downstream() {
    let h = setup().await;

    let a = h.sched.enqueue(spec(&h, "a")).await.unwrap();
    let b = h
        .sched
        .enqueue(EnqueueTask {
            dependencies: vec![a.id],
            ..spec(&h, "b")
        })
        .await
        .unwrap();

    run_task(&h, a.id).await;
    h.sched
        .complete_task(a.id, serde_json::json!({ "ok": true }))
        .await
        .unwrap();

    // complete_task re-promotes; b is now ready.
    let ready = h.sched.ready_tasks(None, 10).await.unwrap();
    assert!(ready.iter().any(|t| t.id == b.id));

    let a = h.sched.get(a.id).await.unwrap();
    assert_eq!(a.status, TaskStatus::Completed);
    assert!(a.completed_at.is_some());
    assert_eq!(a.result, Some(serde_json::json!({ "ok": true })));

    h.pool.close().await;
    drop_test_db(&h.db_name).await;
}

#[tokio::test]
async fn transient_failure_requeues_with_backoff() {
    let h = setup().await;

    let task = h.sched.enqueue(spec(&h, "flaky")).await.unwrap();
    run_task(&h, task.id).await;

    let task = h
        .sched
        .fail_task(task.id, error_kinds::NETWORK, "connection reset")
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.retry_count, 1);
    assert!(task.not_before.is_some(), "backoff window recorded");

    // Events: one transient failure, no permanent failure.
    let since = chrono::Utc::now() - chrono::Duration::minutes(1);
    let transient = conductor_db::queries::events::of_type_since(
        &h.pool,
        "task.failed.transient",
        since,
    )
    .await
    .unwrap();
    assert_eq!(transient.len(), 1);
    let permanent = conductor_db::queries::events::of_type_since(
        &h.pool,
        "task.failed.permanent",
        since,
    )
    .await
    .unwrap();
    assert!(permanent.is_empty());

    // Ticket unaffected by a transient failure.
    let ticket = ticket_db::get_ticket(&h.pool, h.ticket_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ticket.status, TicketStatus::Active);

    h.pool.close().await;
    drop_test_db(&h.db_name).await;
}

#[tokio::test]
async fn retry_backoff_sequence_doubles() {
    let h = setup().await;

    let task = h.sched.enqueue(spec(&h, "flaky")).await.unwrap();

    let mut gaps = Vec::new();
    for _ in 0..3 {
        // Clear the backoff window so the task re-promotes immediately.
        sqlx::query("UPDATE tasks SET not_before = NULL WHERE id = $1")
            .bind(task.id)
            .execute(&h.pool)
            .await
            .unwrap();
        run_task(&h, task.id).await;
        let before = chrono::Utc::now();
        let failed = h
            .sched
            .fail_task(task.id, error_kinds::NETWORK, "reset")
            .await
            .unwrap();
        gaps.push((failed.not_before.unwrap() - before).num_milliseconds());
    }

    // Base 20ms: ~20, ~40, ~80 (allowing scheduling slack).
    assert!(gaps[0] >= 15 && gaps[0] < 40, "first backoff: {gaps:?}");
    assert!(gaps[1] >= 35 && gaps[1] < 80, "second backoff: {gaps:?}");
    assert!(gaps[2] >= 75 && gaps[2] < 160, "third backoff: {gaps:?}");

    h.pool.close().await;
    drop_test_db(&h.db_name).await;
}

#[tokio::test]
async fn permanent_failure_blocks_ticket() {
    let h = setup().await;

    let task = h.sched.enqueue(spec(&h, "broken")).await.unwrap();
    run_task(&h, task.id).await;

    let task = h
        .sched
        .fail_task(task.id, error_kinds::VALIDATION, "schema mismatch")
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error_kind.as_deref(), Some(error_kinds::VALIDATION));

    let ticket = ticket_db::get_ticket(&h.pool, h.ticket_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ticket.status, TicketStatus::Blocked);
    assert!(
        ticket
            .blocking_reasons
            .as_array()
            .is_some_and(|a| !a.is_empty())
    );

    h.pool.close().await;
    drop_test_db(&h.db_name).await;
}

#[tokio::test]
async fn zero_retry_budget_fails_permanently_on_transient_error() {
    let h = setup().await;

    let task = h
        .sched
        .enqueue(EnqueueTask {
            max_retries: Some(0),
            ..spec(&h, "fragile")
        })
        .await
        .unwrap();
    run_task(&h, task.id).await;

    let task = h
        .sched
        .fail_task(task.id, error_kinds::NETWORK, "reset")
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Failed, "no budget means permanent");

    h.pool.close().await;
    drop_test_db(&h.db_name).await;
}

#[tokio::test]
async fn optional_task_failure_does_not_block_ticket() {
    let h = setup().await;

    let task = h
        .sched
        .enqueue(EnqueueTask {
            optional: true,
            max_retries: Some(0),
            ..spec(&h, "nice_to_have")
        })
        .await
        .unwrap();
    run_task(&h, task.id).await;

    h.sched
        .fail_task(task.id, error_kinds::VALIDATION, "bad")
        .await
        .unwrap();

    let ticket = ticket_db::get_ticket(&h.pool, h.ticket_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ticket.status, TicketStatus::Active);

    h.pool.close().await;
    drop_test_db(&h.db_name).await;
}

#[tokio::test]
async fn cancel_is_idempotent() {
    let h = setup().await;

    let task = h.sched.enqueue(spec(&h, "doomed")).await.unwrap();

    let first = h.sched.cancel_task(task.id, "not needed").await.unwrap();
    assert_eq!(first.status, TaskStatus::Cancelled);

    let second = h.sched.cancel_task(task.id, "not needed").await.unwrap();
    assert_eq!(second.status, TaskStatus::Cancelled, "second cancel is a no-op");

    h.pool.close().await;
    drop_test_db(&h.db_name).await;
}

#[tokio::test]
async fn running_task_cancel_waits_for_acknowledgement() {
    let h = setup().await;

    let task = h.sched.enqueue(spec(&h, "long")).await.unwrap();
    run_task(&h, task.id).await;

    let task = h.sched.cancel_task(task.id, "operator abort").await.unwrap();
    assert_eq!(task.status, TaskStatus::Running, "keeps running until acked");
    assert!(task.cancel_requested_at.is_some());

    let task = h.sched.acknowledge_cancel(task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert_eq!(task.cancel_reason.as_deref(), Some("operator abort"));

    h.pool.close().await;
    drop_test_db(&h.db_name).await;
}

#[tokio::test]
async fn timeout_sweep_requeues_within_budget() {
    let h = setup().await;

    let task = h
        .sched
        .enqueue(EnqueueTask {
            timeout_seconds: Some(0),
            ..spec(&h, "slow")
        })
        .await
        .unwrap();
    run_task(&h, task.id).await;

    let swept = h.sched.timeout_sweep().await.unwrap();
    assert_eq!(swept.len(), 1);

    let task = h.sched.get(task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Pending, "budget left, requeued");
    assert_eq!(task.retry_count, 1);

    h.pool.close().await;
    drop_test_db(&h.db_name).await;
}

#[tokio::test]
async fn timeout_sweep_finalizes_exhausted_tasks() {
    let h = setup().await;

    let task = h
        .sched
        .enqueue(EnqueueTask {
            timeout_seconds: Some(0),
            max_retries: Some(0),
            ..spec(&h, "slow")
        })
        .await
        .unwrap();
    run_task(&h, task.id).await;

    h.sched.timeout_sweep().await.unwrap();

    let task = h.sched.get(task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::TimedOut);

    let ticket = ticket_db::get_ticket(&h.pool, h.ticket_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ticket.status, TicketStatus::Blocked);

    h.pool.close().await;
    drop_test_db(&h.db_name).await;
}

#[tokio::test]
async fn bus_subscription_sees_task_events() {
    let h = setup().await;

    let mut sub = h.bus.subscribe("task.*");
    let task = h.sched.enqueue(spec(&h, "observed")).await.unwrap();

    let event = tokio::time::timeout(std::time::Duration::from_secs(2), sub.next())
        .await
        .expect("event should arrive")
        .expect("stream open");
    assert_eq!(event.event_type, "task.created");
    assert_eq!(event.entity_id, task.id.to_string());

    h.pool.close().await;
    drop_test_db(&h.db_name).await;
}
