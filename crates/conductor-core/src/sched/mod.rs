//! Task store and dependency-aware scheduler.
//!
//! Tasks form a per-ticket DAG. `pending` tasks whose dependencies are
//! all `completed` (and whose retry backoff has elapsed) are promoted to
//! `ready`; the dispatcher consumes the ready set in (priority desc,
//! created_at asc) order. Failures are classified transient or permanent:
//! transient failures requeue with exponential backoff, permanent ones
//! finalize the task and block the ticket when the task gates the
//! current phase.

pub mod graph;

use anyhow::Context;
use chrono::{Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use conductor_db::models::{DiscoveryResolution, Priority, Task, TaskStatus};
use conductor_db::queries::agents as agent_db;
use conductor_db::queries::discoveries as discovery_db;
use conductor_db::queries::tasks as db;
use conductor_db::queries::tasks::NewTask;
use conductor_db::queries::tickets as ticket_db;

use crate::bus::{EventBus, topics};
use crate::config::TaskConfig;
use crate::error::{EngineError, EngineResult};
use crate::lock::LockCoordinator;

/// Stable `error_kind` values recognized by the retry classifier.
pub mod error_kinds {
    pub const NETWORK: &str = "network";
    pub const LOCK_WAIT_TIMEOUT: &str = "lock_wait_timeout";
    pub const RATE_LIMIT: &str = "rate_limit";
    pub const TIMEOUT: &str = "timeout";
    pub const AGENT_UNREACHABLE: &str = "agent_unreachable";
    pub const VALIDATION: &str = "validation";
    pub const DO_NOT_RETRY: &str = "do_not_retry";
    pub const INTERNAL: &str = "internal";
}

/// Whether a failure may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

/// Classify an error kind. Unknown kinds are permanent: retrying an
/// unrecognized failure forever is worse than surfacing it.
pub fn classify_error(error_kind: &str) -> ErrorClass {
    match error_kind {
        error_kinds::NETWORK
        | error_kinds::LOCK_WAIT_TIMEOUT
        | error_kinds::RATE_LIMIT
        | error_kinds::TIMEOUT
        | error_kinds::AGENT_UNREACHABLE => ErrorClass::Transient,
        _ => ErrorClass::Permanent,
    }
}

/// Exponential retry backoff: `base × 2^retry_count`.
pub fn retry_backoff(base_ms: u64, retry_count: i32) -> Duration {
    let shift = retry_count.clamp(0, 16) as u32;
    Duration::milliseconds(base_ms.saturating_mul(1u64 << shift) as i64)
}

/// Caller-facing task specification.
#[derive(Debug, Clone)]
pub struct EnqueueTask {
    pub ticket_id: Uuid,
    /// Target phase; defaults to the ticket's current phase. Discovery
    /// may target another phase without transitioning the ticket.
    pub phase_id: Option<String>,
    pub task_type: String,
    pub description: String,
    pub priority: Priority,
    pub optional: bool,
    pub dependencies: Vec<Uuid>,
    pub required_resources: Vec<String>,
    pub required_capabilities: Vec<String>,
    pub max_retries: Option<i32>,
    pub timeout_seconds: Option<i32>,
}

/// The scheduler component.
#[derive(Clone)]
pub struct TaskScheduler {
    pool: PgPool,
    bus: EventBus,
    locks: LockCoordinator,
    config: TaskConfig,
}

impl TaskScheduler {
    pub fn new(pool: PgPool, bus: EventBus, locks: LockCoordinator, config: TaskConfig) -> Self {
        Self {
            pool,
            bus,
            locks,
            config,
        }
    }

    /// Fetch one task.
    pub async fn get(&self, id: Uuid) -> EngineResult<Task> {
        db::get_task(&self.pool, id)
            .await?
            .ok_or(EngineError::NotFound {
                entity: "task",
                id: id.to_string(),
            })
    }

    /// Persist a new task and its dependency edges.
    ///
    /// Dependencies must already exist and belong to the same ticket; the
    /// resulting edge set must stay acyclic. Runs in one transaction so a
    /// rejected dependency leaves nothing behind.
    pub async fn enqueue(&self, spec: EnqueueTask) -> EngineResult<Task> {
        if spec.task_type.trim().is_empty() {
            return Err(EngineError::InvalidInput("task type is empty".into()));
        }

        let ticket = ticket_db::get_ticket(&self.pool, spec.ticket_id)
            .await?
            .ok_or(EngineError::NotFound {
                entity: "ticket",
                id: spec.ticket_id.to_string(),
            })?;

        for dep_id in &spec.dependencies {
            let dep = db::get_task(&self.pool, *dep_id)
                .await?
                .ok_or(EngineError::NotFound {
                    entity: "task",
                    id: dep_id.to_string(),
                })?;
            if dep.ticket_id != spec.ticket_id {
                return Err(EngineError::InvalidInput(format!(
                    "dependency {dep_id} belongs to another ticket"
                )));
            }
        }

        let phase_id = spec
            .phase_id
            .clone()
            .unwrap_or_else(|| ticket.current_phase.clone());

        let new = NewTask {
            ticket_id: spec.ticket_id,
            phase_id,
            task_type: spec.task_type.clone(),
            description: spec.description.clone(),
            priority: spec.priority,
            optional: spec.optional,
            max_retries: spec.max_retries.unwrap_or(self.config.default_max_retries),
            timeout_seconds: spec.timeout_seconds,
            required_resources: spec.required_resources.clone(),
            required_capabilities: spec.required_capabilities.clone(),
        };

        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin enqueue transaction")?;

        let task = db::insert_task(&mut *tx, &new).await?;
        for dep_id in &spec.dependencies {
            db::insert_dependency(&mut *tx, task.id, *dep_id).await?;
        }

        let edges: Vec<(Uuid, Uuid)> = db::edges_for_ticket(&mut *tx, spec.ticket_id)
            .await?
            .into_iter()
            .map(|e| (e.task_id, e.depends_on))
            .collect();
        if let Err(cyclic) = graph::ensure_acyclic(&edges) {
            tx.rollback()
                .await
                .context("failed to roll back enqueue transaction")?;
            return Err(EngineError::Conflict(format!(
                "dependency cycle involving tasks: {}",
                cyclic
                    .iter()
                    .map(Uuid::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }

        tx.commit()
            .await
            .context("failed to commit enqueue transaction")?;

        let _ = self
            .bus
            .emit(
                topics::TASK_CREATED,
                "task",
                task.id,
                serde_json::json!({
                    "ticket_id": task.ticket_id,
                    "phase_id": task.phase_id,
                    "task_type": task.task_type,
                    "priority": task.priority,
                }),
            )
            .await;

        Ok(task)
    }

    /// Add a dependency edge between existing tasks, rejecting cycles.
    pub async fn add_dependency(&self, task_id: Uuid, depends_on: Uuid) -> EngineResult<()> {
        if task_id == depends_on {
            return Err(EngineError::Conflict(
                "a task cannot depend on itself".into(),
            ));
        }
        let task = self.get(task_id).await?;
        let dep = self.get(depends_on).await?;
        if task.ticket_id != dep.ticket_id {
            return Err(EngineError::InvalidInput(
                "dependencies must stay within one ticket".into(),
            ));
        }
        if task.status.is_terminal() {
            return Err(EngineError::Conflict(format!(
                "task {task_id} is {} and cannot gain dependencies",
                task.status
            )));
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin dependency transaction")?;

        db::insert_dependency(&mut *tx, task_id, depends_on).await?;
        let edges: Vec<(Uuid, Uuid)> = db::edges_for_ticket(&mut *tx, task.ticket_id)
            .await?
            .into_iter()
            .map(|e| (e.task_id, e.depends_on))
            .collect();
        if let Err(cyclic) = graph::ensure_acyclic(&edges) {
            tx.rollback()
                .await
                .context("failed to roll back dependency transaction")?;
            return Err(EngineError::Conflict(format!(
                "dependency cycle involving tasks: {}",
                cyclic
                    .iter()
                    .map(Uuid::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }

        tx.commit()
            .await
            .context("failed to commit dependency transaction")?;
        Ok(())
    }

    /// Promote eligible `pending` tasks to `ready`, emitting `task.ready`
    /// per promotion.
    pub async fn promote_ready(&self, phase_id: Option<&str>) -> EngineResult<Vec<Task>> {
        let promoted = db::promote_ready(&self.pool, phase_id).await?;
        for task in &promoted {
            let _ = self
                .bus
                .emit(
                    topics::TASK_READY,
                    "task",
                    task.id,
                    serde_json::json!({ "ticket_id": task.ticket_id, "phase_id": task.phase_id }),
                )
                .await;
        }
        Ok(promoted)
    }

    /// The ready set, ordered by (priority desc, created_at asc).
    pub async fn ready_tasks(&self, phase_id: Option<&str>, limit: i64) -> EngineResult<Vec<Task>> {
        Ok(db::ready_tasks(&self.pool, phase_id, limit).await?)
    }

    /// The oldest ready task regardless of priority (dispatcher
    /// fairness).
    pub async fn oldest_ready(&self, phase_id: Option<&str>) -> EngineResult<Option<Task>> {
        Ok(db::oldest_ready_task(&self.pool, phase_id).await?)
    }

    /// A worker picked up its assignment: `assigned -> running`.
    pub async fn start_task(&self, task_id: Uuid) -> EngineResult<Task> {
        let rows = db::transition_status(
            &self.pool,
            task_id,
            TaskStatus::Assigned,
            TaskStatus::Running,
            Some(Utc::now()),
            None,
        )
        .await?;
        if rows == 0 {
            let task = self.get(task_id).await?;
            return Err(EngineError::Conflict(format!(
                "task {task_id} is {}, expected assigned",
                task.status
            )));
        }
        let task = self.get(task_id).await?;
        let _ = self
            .bus
            .emit(
                topics::TASK_STARTED,
                "task",
                task_id,
                serde_json::json!({ "agent_id": task.assigned_agent }),
            )
            .await;
        Ok(task)
    }

    /// A worker reported success: `running -> completed`.
    ///
    /// Releases the task's leases, returns the agent's capacity unit,
    /// resolves any discovery that spawned this task, and re-promotes the
    /// ready set so downstream tasks whose dependencies just cleared
    /// become dispatchable.
    pub async fn complete_task(
        &self,
        task_id: Uuid,
        result: serde_json::Value,
    ) -> EngineResult<Task> {
        let rows = db::complete(&self.pool, task_id, &result).await?;
        if rows == 0 {
            let task = self.get(task_id).await?;
            return Err(EngineError::Conflict(format!(
                "task {task_id} is {}, expected running",
                task.status
            )));
        }
        let task = self.get(task_id).await?;

        self.release_task_grip(&task).await?;

        let _ = self
            .bus
            .emit(
                topics::TASK_COMPLETED,
                "task",
                task_id,
                serde_json::json!({ "ticket_id": task.ticket_id, "result": result }),
            )
            .await;

        // Discoveries that spawned this task are now answered.
        for discovery in discovery_db::open_with_spawned_task(&self.pool, task_id).await? {
            discovery_db::resolve(&self.pool, discovery.id, DiscoveryResolution::Resolved).await?;
        }

        self.promote_ready(None).await?;
        Ok(task)
    }

    /// A worker reported failure. Applies the retry policy.
    pub async fn fail_task(
        &self,
        task_id: Uuid,
        error_kind: &str,
        error_detail: &str,
    ) -> EngineResult<Task> {
        let task = self.get(task_id).await?;
        if !matches!(task.status, TaskStatus::Assigned | TaskStatus::Running) {
            return Err(EngineError::Conflict(format!(
                "task {task_id} is {}, expected assigned or running",
                task.status
            )));
        }

        self.release_task_grip(&task).await?;

        let transient = classify_error(error_kind) == ErrorClass::Transient
            && task.retry_count < task.max_retries;

        if transient {
            let backoff = retry_backoff(self.config.retry_backoff_base_ms, task.retry_count);
            let not_before = Utc::now() + backoff;
            let rows = db::requeue(
                &self.pool,
                task_id,
                task.status,
                task.retry_count,
                not_before,
                error_kind,
                error_detail,
            )
            .await?;
            if rows == 0 {
                return Err(EngineError::Conflict(format!(
                    "task {task_id} changed concurrently during retry"
                )));
            }
            let _ = self
                .bus
                .emit(
                    topics::TASK_FAILED_TRANSIENT,
                    "task",
                    task_id,
                    serde_json::json!({
                        "error_kind": error_kind,
                        "retry_count": task.retry_count + 1,
                        "not_before": not_before,
                    }),
                )
                .await;
        } else {
            let rows =
                db::mark_failed(&self.pool, task_id, task.status, error_kind, error_detail).await?;
            if rows == 0 {
                return Err(EngineError::Conflict(format!(
                    "task {task_id} changed concurrently during failure"
                )));
            }
            let _ = self
                .bus
                .emit(
                    topics::TASK_FAILED_PERMANENT,
                    "task",
                    task_id,
                    serde_json::json!({ "error_kind": error_kind, "error_detail": error_detail }),
                )
                .await;
            if !task.optional {
                self.block_ticket_for_task(&task, error_kind).await?;
            }
        }

        self.get(task_id).await
    }

    /// Cancel a task. Idempotent: cancelling a terminal task is a no-op.
    ///
    /// Queued tasks finalize immediately; in-flight tasks get a cancel
    /// request the worker must acknowledge (the cancel sweep finalizes
    /// unacknowledged ones after the grace period).
    pub async fn cancel_task(&self, task_id: Uuid, reason: &str) -> EngineResult<Task> {
        let task = self.get(task_id).await?;
        match task.status {
            status if status.is_terminal() => Ok(task),
            TaskStatus::Pending | TaskStatus::Ready => {
                let rows = db::finalize_cancel(
                    &self.pool,
                    task_id,
                    task.status,
                    TaskStatus::Cancelled,
                    reason,
                )
                .await?;
                if rows > 0 {
                    let _ = self
                        .bus
                        .emit(
                            topics::TASK_CANCELLED,
                            "task",
                            task_id,
                            serde_json::json!({ "reason": reason }),
                        )
                        .await;
                }
                self.get(task_id).await
            }
            TaskStatus::Assigned | TaskStatus::Running => {
                let rows = db::request_cancel(&self.pool, task_id, reason).await?;
                if rows > 0 {
                    // The worker sees this event and is expected to stop
                    // and acknowledge.
                    let _ = self
                        .bus
                        .emit(
                            topics::TASK_CANCELLED,
                            "task",
                            task_id,
                            serde_json::json!({ "reason": reason, "acknowledged": false }),
                        )
                        .await;
                }
                self.get(task_id).await
            }
            TaskStatus::Completed
            | TaskStatus::Failed
            | TaskStatus::Cancelled
            | TaskStatus::TimedOut => Ok(task),
        }
    }

    /// A worker acknowledged a cancel request; finalize the task.
    pub async fn acknowledge_cancel(&self, task_id: Uuid) -> EngineResult<Task> {
        let task = self.get(task_id).await?;
        if task.status.is_terminal() {
            return Ok(task);
        }
        if task.cancel_requested_at.is_none() {
            return Err(EngineError::Conflict(format!(
                "task {task_id} has no pending cancel request"
            )));
        }
        let reason = task.cancel_reason.clone().unwrap_or_default();
        let rows = db::finalize_cancel(
            &self.pool,
            task_id,
            task.status,
            TaskStatus::Cancelled,
            &reason,
        )
        .await?;
        if rows > 0 {
            self.release_task_grip(&task).await?;
            let _ = self
                .bus
                .emit(
                    topics::TASK_CANCELLED,
                    "task",
                    task_id,
                    serde_json::json!({ "reason": reason, "acknowledged": true }),
                )
                .await;
        }
        self.get(task_id).await
    }

    /// Cancel running tasks that have exceeded their `timeout_seconds`.
    ///
    /// Timed-out tasks with retry budget left go straight back to
    /// `pending` (timeout is a transient failure); exhausted ones
    /// finalize as `timed_out` and block their ticket like a permanent
    /// failure.
    pub async fn timeout_sweep(&self) -> EngineResult<Vec<Task>> {
        let candidates = db::timed_out_candidates(&self.pool).await?;
        let mut swept = Vec::with_capacity(candidates.len());

        for task in candidates {
            self.release_task_grip(&task).await?;

            let retryable = task.retry_count < task.max_retries;
            if retryable {
                let backoff = retry_backoff(self.config.retry_backoff_base_ms, task.retry_count);
                let rows = db::requeue(
                    &self.pool,
                    task.id,
                    task.status,
                    task.retry_count,
                    Utc::now() + backoff,
                    error_kinds::TIMEOUT,
                    "task exceeded its timeout",
                )
                .await?;
                if rows == 0 {
                    continue;
                }
            } else {
                let rows = db::finalize_cancel(
                    &self.pool,
                    task.id,
                    task.status,
                    TaskStatus::TimedOut,
                    "task exceeded its timeout",
                )
                .await?;
                if rows == 0 {
                    continue;
                }
                if !task.optional {
                    self.block_ticket_for_task(&task, error_kinds::TIMEOUT).await?;
                }
            }

            let _ = self
                .bus
                .emit(
                    topics::TASK_TIMED_OUT,
                    "task",
                    task.id,
                    serde_json::json!({
                        "ticket_id": task.ticket_id,
                        "timeout_seconds": task.timeout_seconds,
                        "will_retry": retryable,
                    }),
                )
                .await;
            swept.push(task);
        }

        Ok(swept)
    }

    /// Finalize cancellations the worker never acknowledged within the
    /// grace period, and quarantine the unresponsive agent.
    pub async fn cancel_sweep(&self, grace_seconds: i64) -> EngineResult<Vec<Task>> {
        let overdue = db::cancel_overdue(&self.pool, grace_seconds).await?;
        let mut finalized = Vec::with_capacity(overdue.len());

        for task in overdue {
            let reason = task.cancel_reason.clone().unwrap_or_default();
            let rows = db::finalize_cancel(
                &self.pool,
                task.id,
                task.status,
                TaskStatus::Cancelled,
                &reason,
            )
            .await?;
            if rows == 0 {
                continue;
            }
            self.release_task_grip(&task).await?;
            if let Some(agent_id) = task.assigned_agent {
                agent_db::set_status(
                    &self.pool,
                    agent_id,
                    conductor_db::models::AgentStatus::Unreachable,
                )
                .await?;
                tracing::warn!(
                    task_id = %task.id,
                    agent_id = %agent_id,
                    "agent ignored cancel request past grace period"
                );
            }
            let _ = self
                .bus
                .emit(
                    topics::TASK_CANCELLED,
                    "task",
                    task.id,
                    serde_json::json!({ "reason": reason, "acknowledged": false, "forced": true }),
                )
                .await;
            finalized.push(task);
        }

        Ok(finalized)
    }

    /// Requeue the in-flight tasks of an agent that went unreachable.
    pub async fn requeue_for_agent(&self, agent_id: Uuid) -> EngineResult<Vec<Task>> {
        let in_flight = db::in_flight_on_agent(&self.pool, agent_id).await?;
        let mut requeued = Vec::with_capacity(in_flight.len());

        for task in in_flight {
            self.release_task_grip(&task).await?;

            if task.retry_count < task.max_retries {
                let backoff = retry_backoff(self.config.retry_backoff_base_ms, task.retry_count);
                let rows = db::requeue(
                    &self.pool,
                    task.id,
                    task.status,
                    task.retry_count,
                    Utc::now() + backoff,
                    error_kinds::AGENT_UNREACHABLE,
                    "assigned agent stopped heartbeating",
                )
                .await?;
                if rows == 0 {
                    continue;
                }
                let _ = self
                    .bus
                    .emit(
                        topics::TASK_FAILED_TRANSIENT,
                        "task",
                        task.id,
                        serde_json::json!({
                            "error_kind": error_kinds::AGENT_UNREACHABLE,
                            "retry_count": task.retry_count + 1,
                        }),
                    )
                    .await;
            } else {
                let rows = db::mark_failed(
                    &self.pool,
                    task.id,
                    task.status,
                    error_kinds::AGENT_UNREACHABLE,
                    "assigned agent stopped heartbeating and retries are exhausted",
                )
                .await?;
                if rows == 0 {
                    continue;
                }
                let _ = self
                    .bus
                    .emit(
                        topics::TASK_FAILED_PERMANENT,
                        "task",
                        task.id,
                        serde_json::json!({ "error_kind": error_kinds::AGENT_UNREACHABLE }),
                    )
                    .await;
                if !task.optional {
                    self.block_ticket_for_task(&task, error_kinds::AGENT_UNREACHABLE)
                        .await?;
                }
            }
            requeued.push(task);
        }

        Ok(requeued)
    }

    /// Cancel every live task of a ticket (ticket cancellation path).
    pub async fn cancel_tasks_for_ticket(
        &self,
        ticket_id: Uuid,
        reason: &str,
    ) -> EngineResult<Vec<Task>> {
        let cancelled = db::cancel_all_for_ticket(&self.pool, ticket_id, reason).await?;
        for task in &cancelled {
            self.release_task_grip(task).await?;
            let _ = self
                .bus
                .emit(
                    topics::TASK_CANCELLED,
                    "task",
                    task.id,
                    serde_json::json!({ "reason": reason }),
                )
                .await;
        }
        Ok(cancelled)
    }

    /// Park an in-flight task behind a newly-discovered dependency: the
    /// agent lets go (leases released, capacity returned) and the task
    /// re-enters the DAG as `pending`, becoming ready once the new
    /// dependency completes.
    pub async fn park_for_dependency(&self, task_id: Uuid) -> EngineResult<Task> {
        let task = self.get(task_id).await?;
        if task.status.is_terminal() {
            return Err(EngineError::Conflict(format!(
                "task {task_id} is {} and cannot be parked",
                task.status
            )));
        }
        if task.status != TaskStatus::Pending {
            self.release_task_grip(&task).await?;
            let rows = db::demote_to_pending(&self.pool, task_id, task.status).await?;
            if rows == 0 {
                return Err(EngineError::Conflict(format!(
                    "task {task_id} changed concurrently while parking"
                )));
            }
        }
        self.get(task_id).await
    }

    /// Release a finished task's leases and return its agent's capacity
    /// unit.
    async fn release_task_grip(&self, task: &Task) -> EngineResult<()> {
        self.locks.release_all_for_task(task.id).await?;
        if let Some(agent_id) = task.assigned_agent {
            agent_db::decrement_load(&self.pool, agent_id).await?;
        }
        Ok(())
    }

    /// Move the owning ticket to `blocked` after a gating task failed
    /// permanently.
    async fn block_ticket_for_task(&self, task: &Task, error_kind: &str) -> EngineResult<()> {
        let reasons = serde_json::json!([{
            "task_id": task.id,
            "phase_id": task.phase_id,
            "error_kind": error_kind,
            "detail": format!("required task {:?} failed permanently", task.task_type),
        }]);
        ticket_db::set_blocked(&self.pool, task.ticket_id, &reasons).await?;
        let _ = self
            .bus
            .emit(
                topics::TICKET_BLOCKED,
                "ticket",
                task.ticket_id,
                reasons.clone(),
            )
            .await;
        Ok(())
    }
}
