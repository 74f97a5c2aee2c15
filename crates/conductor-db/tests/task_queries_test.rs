//! Integration tests for the task query layer: readiness computation,
//! optimistic transitions, and retry bookkeeping.

use chrono::Utc;
use uuid::Uuid;

use conductor_db::models::{Priority, TaskStatus};
use conductor_db::queries::tasks as db;
use conductor_db::queries::tasks::NewTask;
use conductor_test_utils::{create_test_db, drop_test_db};

async fn seed_ticket(pool: &sqlx::PgPool) -> Uuid {
    sqlx::query("INSERT INTO phases (id, position) VALUES ('backlog', 0) ON CONFLICT DO NOTHING")
        .execute(pool)
        .await
        .unwrap();
    let (id,): (Uuid,) = sqlx::query_as(
        "INSERT INTO tickets (title, owner, current_phase) \
         VALUES ('test ticket', 'alice', 'backlog') RETURNING id",
    )
    .fetch_one(pool)
    .await
    .unwrap();
    id
}

fn new_task(ticket_id: Uuid, task_type: &str, priority: Priority) -> NewTask {
    NewTask {
        ticket_id,
        phase_id: "backlog".into(),
        task_type: task_type.into(),
        description: String::new(),
        priority,
        optional: false,
        max_retries: 3,
        timeout_seconds: None,
        required_resources: vec![],
        required_capabilities: vec![],
    }
}

#[tokio::test]
async fn promote_respects_dependencies() {
    let (pool, db_name) = create_test_db().await;
    let ticket = seed_ticket(&pool).await;

    let a = db::insert_task(&pool, &new_task(ticket, "a", Priority::Normal))
        .await
        .unwrap();
    let b = db::insert_task(&pool, &new_task(ticket, "b", Priority::Normal))
        .await
        .unwrap();
    db::insert_dependency(&pool, b.id, a.id).await.unwrap();

    let promoted = db::promote_ready(&pool, None).await.unwrap();
    let ids: Vec<Uuid> = promoted.iter().map(|t| t.id).collect();
    assert!(ids.contains(&a.id), "a has no deps and should promote");
    assert!(!ids.contains(&b.id), "b waits on a");

    // Walk a to completed, then b promotes.
    db::assign(&pool, a.id, Uuid::new_v4()).await.unwrap();
    db::transition_status(
        &pool,
        a.id,
        TaskStatus::Assigned,
        TaskStatus::Running,
        Some(Utc::now()),
        None,
    )
    .await
    .unwrap();
    db::complete(&pool, a.id, &serde_json::json!({})).await.unwrap();

    let promoted = db::promote_ready(&pool, None).await.unwrap();
    let ids: Vec<Uuid> = promoted.iter().map(|t| t.id).collect();
    assert!(ids.contains(&b.id), "b should promote once a completed");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn ready_order_is_priority_then_age() {
    let (pool, db_name) = create_test_db().await;
    let ticket = seed_ticket(&pool).await;

    let low = db::insert_task(&pool, &new_task(ticket, "low", Priority::Low))
        .await
        .unwrap();
    let high = db::insert_task(&pool, &new_task(ticket, "high", Priority::High))
        .await
        .unwrap();
    let normal = db::insert_task(&pool, &new_task(ticket, "normal", Priority::Normal))
        .await
        .unwrap();

    db::promote_ready(&pool, None).await.unwrap();
    let ready = db::ready_tasks(&pool, None, 10).await.unwrap();
    let order: Vec<Uuid> = ready.iter().map(|t| t.id).collect();
    assert_eq!(order, vec![high.id, normal.id, low.id]);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn backoff_window_delays_promotion() {
    let (pool, db_name) = create_test_db().await;
    let ticket = seed_ticket(&pool).await;

    let task = db::insert_task(&pool, &new_task(ticket, "a", Priority::Normal))
        .await
        .unwrap();

    // Park the task behind a future not_before.
    sqlx::query("UPDATE tasks SET not_before = now() + interval '1 hour' WHERE id = $1")
        .bind(task.id)
        .execute(&pool)
        .await
        .unwrap();

    let promoted = db::promote_ready(&pool, None).await.unwrap();
    assert!(promoted.is_empty(), "backoff window should hold the task");

    sqlx::query("UPDATE tasks SET not_before = now() - interval '1 second' WHERE id = $1")
        .bind(task.id)
        .execute(&pool)
        .await
        .unwrap();

    let promoted = db::promote_ready(&pool, None).await.unwrap();
    assert_eq!(promoted.len(), 1);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn optimistic_transition_loses_cleanly() {
    let (pool, db_name) = create_test_db().await;
    let ticket = seed_ticket(&pool).await;

    let task = db::insert_task(&pool, &new_task(ticket, "a", Priority::Normal))
        .await
        .unwrap();

    // Status is pending; a ready->assigned style update must not apply.
    let rows = db::assign(&pool, task.id, Uuid::new_v4()).await.unwrap();
    assert_eq!(rows, 0, "assign requires ready status");

    db::promote_ready(&pool, None).await.unwrap();
    let rows = db::assign(&pool, task.id, Uuid::new_v4()).await.unwrap();
    assert_eq!(rows, 1);

    // A second assign must lose the optimistic race.
    let rows = db::assign(&pool, task.id, Uuid::new_v4()).await.unwrap();
    assert_eq!(rows, 0);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn requeue_increments_retry_and_clears_assignment() {
    let (pool, db_name) = create_test_db().await;
    let ticket = seed_ticket(&pool).await;

    let task = db::insert_task(&pool, &new_task(ticket, "a", Priority::Normal))
        .await
        .unwrap();
    db::promote_ready(&pool, None).await.unwrap();
    db::assign(&pool, task.id, Uuid::new_v4()).await.unwrap();
    db::transition_status(
        &pool,
        task.id,
        TaskStatus::Assigned,
        TaskStatus::Running,
        Some(Utc::now()),
        None,
    )
    .await
    .unwrap();

    let rows = db::requeue(
        &pool,
        task.id,
        TaskStatus::Running,
        0,
        Utc::now(),
        "network",
        "connection reset",
    )
    .await
    .unwrap();
    assert_eq!(rows, 1);

    let task = db::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.retry_count, 1);
    assert!(task.assigned_agent.is_none());
    assert!(task.started_at.is_none());
    assert_eq!(task.error_kind.as_deref(), Some("network"));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn cancel_all_for_ticket_spares_terminal_tasks() {
    let (pool, db_name) = create_test_db().await;
    let ticket = seed_ticket(&pool).await;

    let a = db::insert_task(&pool, &new_task(ticket, "a", Priority::Normal))
        .await
        .unwrap();
    let b = db::insert_task(&pool, &new_task(ticket, "b", Priority::Normal))
        .await
        .unwrap();

    // Complete a fully.
    db::promote_ready(&pool, None).await.unwrap();
    db::assign(&pool, a.id, Uuid::new_v4()).await.unwrap();
    db::transition_status(
        &pool,
        a.id,
        TaskStatus::Assigned,
        TaskStatus::Running,
        Some(Utc::now()),
        None,
    )
    .await
    .unwrap();
    db::complete(&pool, a.id, &serde_json::json!({})).await.unwrap();

    let cancelled = db::cancel_all_for_ticket(&pool, ticket, "operator request")
        .await
        .unwrap();
    let ids: Vec<Uuid> = cancelled.iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![b.id], "only the live task is cancelled");

    let a = db::get_task(&pool, a.id).await.unwrap().unwrap();
    assert_eq!(a.status, TaskStatus::Completed);

    pool.close().await;
    drop_test_db(&db_name).await;
}
