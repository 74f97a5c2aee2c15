//! Schema migration tests.
//!
//! Each test creates a unique temporary database through
//! `conductor-test-utils`, which applies the migration chain, and drops
//! it on completion.

use conductor_test_utils::{create_test_db, drop_test_db};

#[tokio::test]
async fn migrations_create_all_tables() {
    let (pool, db_name) = create_test_db().await;

    let tables: Vec<(String,)> = sqlx::query_as(
        "SELECT tablename::text FROM pg_tables \
         WHERE schemaname = 'public' \
         ORDER BY tablename",
    )
    .fetch_all(&pool)
    .await
    .expect("should list tables");

    let names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();
    for expected in [
        "agents",
        "events",
        "guardian_interventions",
        "phase_gate_artifacts",
        "phase_history",
        "phases",
        "resource_locks",
        "task_dependencies",
        "task_discoveries",
        "tasks",
        "tickets",
        "trajectory_contexts",
    ] {
        assert!(names.contains(&expected), "missing table {expected}: {names:?}");
    }

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn migrations_are_idempotent() {
    let (pool, db_name) = create_test_db().await;

    // Re-running the chain against an up-to-date database is a no-op.
    conductor_db::pool::run_migrations(&pool, conductor_db::pool::default_migrations_path())
        .await
        .expect("second run should succeed");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn task_status_check_constraint_enforced() {
    let (pool, db_name) = create_test_db().await;

    // Seed a phase and ticket to satisfy the foreign keys.
    sqlx::query("INSERT INTO phases (id, position) VALUES ('backlog', 0)")
        .execute(&pool)
        .await
        .unwrap();
    let (ticket_id,): (uuid::Uuid,) = sqlx::query_as(
        "INSERT INTO tickets (title, owner, current_phase) \
         VALUES ('t', 'alice', 'backlog') RETURNING id",
    )
    .fetch_one(&pool)
    .await
    .unwrap();

    let result = sqlx::query(
        "INSERT INTO tasks (ticket_id, phase_id, task_type, status) \
         VALUES ($1, 'backlog', 'code', 'bogus')",
    )
    .bind(ticket_id)
    .execute(&pool)
    .await;
    assert!(result.is_err(), "invalid status should violate CHECK");

    pool.close().await;
    drop_test_db(&db_name).await;
}
