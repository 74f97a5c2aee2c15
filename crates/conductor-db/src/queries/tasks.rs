//! Database query functions for the `tasks` and `task_dependencies`
//! tables.
//!
//! State transitions use optimistic locking: every UPDATE carries the
//! expected current status in its WHERE clause, so a row is only changed
//! when no concurrent writer got there first.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

use crate::models::{Priority, Task, TaskDependency, TaskStatus};

/// Fields for a new task row.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub ticket_id: Uuid,
    pub phase_id: String,
    pub task_type: String,
    pub description: String,
    pub priority: Priority,
    pub optional: bool,
    pub max_retries: i32,
    pub timeout_seconds: Option<i32>,
    pub required_resources: Vec<String>,
    pub required_capabilities: Vec<String>,
}

/// Insert a new task row. Returns the inserted task with server-generated
/// defaults (id, status, retry_count, created_at).
pub async fn insert_task<'e>(ex: impl PgExecutor<'e>, new: &NewTask) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (ticket_id, phase_id, task_type, description, priority, optional, \
                            max_retries, timeout_seconds, required_resources, required_capabilities) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
         RETURNING *",
    )
    .bind(new.ticket_id)
    .bind(&new.phase_id)
    .bind(&new.task_type)
    .bind(&new.description)
    .bind(new.priority)
    .bind(new.optional)
    .bind(new.max_retries)
    .bind(new.timeout_seconds)
    .bind(&new.required_resources)
    .bind(&new.required_capabilities)
    .fetch_one(ex)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task<'e>(ex: impl PgExecutor<'e>, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(ex)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// List all tasks for a ticket, ordered by creation time.
pub async fn list_for_ticket(pool: &PgPool, ticket_id: Uuid) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE ticket_id = $1 ORDER BY created_at ASC",
    )
    .bind(ticket_id)
    .fetch_all(pool)
    .await
    .context("failed to list tasks for ticket")?;

    Ok(tasks)
}

/// List a ticket's tasks within one phase.
pub async fn list_for_ticket_phase(
    pool: &PgPool,
    ticket_id: Uuid,
    phase_id: &str,
) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE ticket_id = $1 AND phase_id = $2 ORDER BY created_at ASC",
    )
    .bind(ticket_id)
    .bind(phase_id)
    .fetch_all(pool)
    .await
    .context("failed to list tasks for ticket phase")?;

    Ok(tasks)
}

/// Insert a dependency edge: `task_id` depends on `depends_on`.
///
/// Uses `ON CONFLICT DO NOTHING` so this is idempotent.
pub async fn insert_dependency<'e>(
    ex: impl PgExecutor<'e>,
    task_id: Uuid,
    depends_on: Uuid,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO task_dependencies (task_id, depends_on) VALUES ($1, $2) \
         ON CONFLICT DO NOTHING",
    )
    .bind(task_id)
    .bind(depends_on)
    .execute(ex)
    .await
    .context("failed to insert task dependency")?;

    Ok(())
}

/// IDs of all tasks that a given task depends on.
pub async fn dependencies_of(pool: &PgPool, task_id: Uuid) -> Result<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> =
        sqlx::query_as("SELECT depends_on FROM task_dependencies WHERE task_id = $1")
            .bind(task_id)
            .fetch_all(pool)
            .await
            .context("failed to get task dependencies")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// All dependency edges among a ticket's tasks.
pub async fn edges_for_ticket<'e>(
    ex: impl PgExecutor<'e>,
    ticket_id: Uuid,
) -> Result<Vec<TaskDependency>> {
    let edges = sqlx::query_as::<_, TaskDependency>(
        "SELECT td.task_id, td.depends_on \
         FROM task_dependencies td \
         JOIN tasks t ON t.id = td.task_id \
         WHERE t.ticket_id = $1",
    )
    .bind(ticket_id)
    .fetch_all(ex)
    .await
    .context("failed to get dependency edges for ticket")?;

    Ok(edges)
}

/// Promote eligible `pending` tasks to `ready`.
///
/// A task is eligible once every dependency is `completed` and its retry
/// backoff window (`not_before`) has passed. Returns the promoted rows so
/// the caller can publish one event per task.
pub async fn promote_ready(pool: &PgPool, phase_id: Option<&str>) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "UPDATE tasks t \
         SET status = 'ready' \
         WHERE t.status = 'pending' \
           AND (t.not_before IS NULL OR t.not_before <= now()) \
           AND ($1::text IS NULL OR t.phase_id = $1) \
           AND NOT EXISTS ( \
               SELECT 1 FROM task_dependencies td \
               JOIN tasks dep ON dep.id = td.depends_on \
               WHERE td.task_id = t.id AND dep.status != 'completed' \
           ) \
         RETURNING t.*",
    )
    .bind(phase_id)
    .fetch_all(pool)
    .await
    .context("failed to promote ready tasks")?;

    Ok(tasks)
}

/// Tasks in `ready` status ordered by (priority desc, created_at asc).
pub async fn ready_tasks(pool: &PgPool, phase_id: Option<&str>, limit: i64) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE status = 'ready' \
           AND ($1::text IS NULL OR phase_id = $1) \
         ORDER BY priority DESC, created_at ASC \
         LIMIT $2",
    )
    .bind(phase_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to get ready tasks")?;

    Ok(tasks)
}

/// The oldest task currently in `ready` status, irrespective of priority.
pub async fn oldest_ready_task(pool: &PgPool, phase_id: Option<&str>) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE status = 'ready' \
           AND ($1::text IS NULL OR phase_id = $1) \
         ORDER BY created_at ASC \
         LIMIT 1",
    )
    .bind(phase_id)
    .fetch_optional(pool)
    .await
    .context("failed to get oldest ready task")?;

    Ok(task)
}

/// Atomically transition a task between statuses, optionally stamping
/// `started_at` / `completed_at`. Returns rows affected (0 means the
/// status did not match).
pub async fn transition_status<'e>(
    ex: impl PgExecutor<'e>,
    id: Uuid,
    from: TaskStatus,
    to: TaskStatus,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = $1, \
             started_at = COALESCE($2, started_at), \
             completed_at = COALESCE($3, completed_at) \
         WHERE id = $4 AND status = $5",
    )
    .bind(to)
    .bind(started_at)
    .bind(completed_at)
    .bind(id)
    .bind(from)
    .execute(ex)
    .await
    .context("failed to transition task status")?;

    Ok(result.rows_affected())
}

/// Bind a `ready` task to an agent (`ready -> assigned`).
pub async fn assign<'e>(ex: impl PgExecutor<'e>, id: Uuid, agent_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'assigned', assigned_agent = $1 \
         WHERE id = $2 AND status = 'ready'",
    )
    .bind(agent_id)
    .bind(id)
    .execute(ex)
    .await
    .context("failed to assign task")?;

    Ok(result.rows_affected())
}

/// Record a successful result (`running -> completed`).
pub async fn complete<'e>(
    ex: impl PgExecutor<'e>,
    id: Uuid,
    result_payload: &serde_json::Value,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'completed', result = $1, completed_at = now() \
         WHERE id = $2 AND status = 'running'",
    )
    .bind(result_payload)
    .bind(id)
    .execute(ex)
    .await
    .context("failed to complete task")?;

    Ok(result.rows_affected())
}

/// Return a task to `pending` for a retry after a transient failure.
///
/// Increments the attempt counter, clears the assignment, and records the
/// backoff window. Optimistic on both the expected status and the current
/// retry count.
pub async fn requeue<'e>(
    ex: impl PgExecutor<'e>,
    id: Uuid,
    from: TaskStatus,
    current_retry: i32,
    not_before: DateTime<Utc>,
    error_kind: &str,
    error_detail: &str,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'pending', \
             retry_count = retry_count + 1, \
             not_before = $1, \
             assigned_agent = NULL, \
             started_at = NULL, \
             error_kind = $2, \
             error_detail = $3 \
         WHERE id = $4 AND status = $5 AND retry_count = $6",
    )
    .bind(not_before)
    .bind(error_kind)
    .bind(error_detail)
    .bind(id)
    .bind(from)
    .bind(current_retry)
    .execute(ex)
    .await
    .context("failed to requeue task")?;

    Ok(result.rows_affected())
}

/// Permanently fail a task, recording the error taxonomy kind and detail.
pub async fn mark_failed<'e>(
    ex: impl PgExecutor<'e>,
    id: Uuid,
    from: TaskStatus,
    error_kind: &str,
    error_detail: &str,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'failed', error_kind = $1, error_detail = $2, completed_at = now() \
         WHERE id = $3 AND status = $4",
    )
    .bind(error_kind)
    .bind(error_detail)
    .bind(id)
    .bind(from)
    .execute(ex)
    .await
    .context("failed to mark task failed")?;

    Ok(result.rows_affected())
}

/// Move a task to a terminal cancellation status (`cancelled` or
/// `timed_out`).
pub async fn finalize_cancel<'e>(
    ex: impl PgExecutor<'e>,
    id: Uuid,
    from: TaskStatus,
    to: TaskStatus,
    reason: &str,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = $1, cancel_reason = $2, completed_at = now() \
         WHERE id = $3 AND status = $4",
    )
    .bind(to)
    .bind(reason)
    .bind(id)
    .bind(from)
    .execute(ex)
    .await
    .context("failed to finalize task cancellation")?;

    Ok(result.rows_affected())
}

/// Record that cancellation was requested for an in-flight task. The task
/// keeps running until the worker acknowledges or the grace period ends.
pub async fn request_cancel<'e>(ex: impl PgExecutor<'e>, id: Uuid, reason: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET cancel_reason = $1, cancel_requested_at = now() \
         WHERE id = $2 AND status IN ('assigned', 'running') AND cancel_requested_at IS NULL",
    )
    .bind(reason)
    .bind(id)
    .execute(ex)
    .await
    .context("failed to request task cancellation")?;

    Ok(result.rows_affected())
}

/// Demote a task back to `pending` without touching its retry budget.
///
/// Used when a task is parked behind a newly-discovered dependency: it
/// leaves the agent's hands and re-enters the DAG, becoming ready again
/// once the new dependency completes.
pub async fn demote_to_pending<'e>(
    ex: impl PgExecutor<'e>,
    id: Uuid,
    from: TaskStatus,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'pending', assigned_agent = NULL, started_at = NULL \
         WHERE id = $1 AND status = $2",
    )
    .bind(id)
    .bind(from)
    .execute(ex)
    .await
    .context("failed to demote task to pending")?;

    Ok(result.rows_affected())
}

/// Running tasks whose wall time has exceeded `timeout_seconds`.
pub async fn timed_out_candidates(pool: &PgPool) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE status = 'running' \
           AND timeout_seconds IS NOT NULL \
           AND started_at IS NOT NULL \
           AND started_at + make_interval(secs => timeout_seconds) < now()",
    )
    .fetch_all(pool)
    .await
    .context("failed to find timed-out tasks")?;

    Ok(tasks)
}

/// In-flight tasks whose cancellation request is older than the grace
/// window and still unacknowledged.
pub async fn cancel_overdue(pool: &PgPool, grace_seconds: i64) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE status IN ('assigned', 'running') \
           AND cancel_requested_at IS NOT NULL \
           AND cancel_requested_at + make_interval(secs => $1) < now()",
    )
    .bind(grace_seconds as f64)
    .fetch_all(pool)
    .await
    .context("failed to find overdue cancellations")?;

    Ok(tasks)
}

/// Non-terminal tasks currently bound to an agent.
pub async fn in_flight_on_agent(pool: &PgPool, agent_id: Uuid) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE assigned_agent = $1 AND status IN ('assigned', 'running')",
    )
    .bind(agent_id)
    .fetch_all(pool)
    .await
    .context("failed to list in-flight tasks for agent")?;

    Ok(tasks)
}

/// Number of tasks currently bound to agents (assigned or running).
pub async fn count_in_flight(pool: &PgPool) -> Result<i64> {
    let row: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM tasks WHERE status IN ('assigned', 'running')")
            .fetch_one(pool)
            .await
            .context("failed to count in-flight tasks")?;

    Ok(row.0)
}

/// Count of non-optional tasks in a phase that have not completed.
pub async fn incomplete_required_count<'e>(
    ex: impl PgExecutor<'e>,
    ticket_id: Uuid,
    phase_id: &str,
) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM tasks \
         WHERE ticket_id = $1 AND phase_id = $2 \
           AND optional = false AND status != 'completed'",
    )
    .bind(ticket_id)
    .bind(phase_id)
    .fetch_one(ex)
    .await
    .context("failed to count incomplete required tasks")?;

    Ok(row.0)
}

/// Latest completion timestamp among a ticket's tasks in one phase.
pub async fn latest_completion(
    pool: &PgPool,
    ticket_id: Uuid,
    phase_id: &str,
) -> Result<Option<DateTime<Utc>>> {
    let row: (Option<DateTime<Utc>>,) = sqlx::query_as(
        "SELECT MAX(completed_at) FROM tasks WHERE ticket_id = $1 AND phase_id = $2",
    )
    .bind(ticket_id)
    .bind(phase_id)
    .fetch_one(pool)
    .await
    .context("failed to get latest task completion")?;

    Ok(row.0)
}

/// Cancel every non-terminal task belonging to a ticket. Returns the
/// cancelled rows.
pub async fn cancel_all_for_ticket<'e>(
    ex: impl PgExecutor<'e>,
    ticket_id: Uuid,
    reason: &str,
) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "UPDATE tasks \
         SET status = 'cancelled', cancel_reason = $1, completed_at = now() \
         WHERE ticket_id = $2 \
           AND status IN ('pending', 'ready', 'assigned', 'running') \
         RETURNING *",
    )
    .bind(reason)
    .bind(ticket_id)
    .fetch_all(ex)
    .await
    .context("failed to cancel tasks for ticket")?;

    Ok(tasks)
}

/// Task counts per status, for health summaries.
pub async fn count_by_status(pool: &PgPool) -> Result<Vec<(String, i64)>> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT status::text, COUNT(*) FROM tasks GROUP BY status ORDER BY status")
            .fetch_all(pool)
            .await
            .context("failed to count tasks by status")?;

    Ok(rows)
}

/// A group of running tasks with identical descriptions within one
/// ticket, used by coherence analysis to spot duplicated work.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DuplicateWork {
    pub ticket_id: Uuid,
    pub description: String,
    pub task_count: i64,
    pub agents: Vec<Uuid>,
}

/// Find running tasks duplicated across agents.
pub async fn duplicate_running_work(pool: &PgPool) -> Result<Vec<DuplicateWork>> {
    let rows = sqlx::query_as::<_, DuplicateWork>(
        "SELECT ticket_id, description, COUNT(*) AS task_count, \
                array_agg(assigned_agent) AS agents \
         FROM tasks \
         WHERE status = 'running' AND assigned_agent IS NOT NULL \
         GROUP BY ticket_id, description \
         HAVING COUNT(*) > 1",
    )
    .fetch_all(pool)
    .await
    .context("failed to find duplicate running work")?;

    Ok(rows)
}

/// Running tasks whose phase differs from their ticket's current phase.
///
/// Discovery-spawned tasks are exempt: targeting another phase is their
/// whole point.
pub async fn phase_mismatched_running(pool: &PgPool) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT t.* FROM tasks t \
         JOIN tickets k ON k.id = t.ticket_id \
         WHERE t.status = 'running' \
           AND t.phase_id != k.current_phase \
           AND NOT EXISTS ( \
               SELECT 1 FROM task_discoveries d WHERE d.spawned_task = t.id \
           )",
    )
    .fetch_all(pool)
    .await
    .context("failed to find phase-mismatched tasks")?;

    Ok(tasks)
}
