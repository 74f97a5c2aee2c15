//! Dispatcher: binds ready tasks to best-fit agents under lock and
//! capacity constraints.
//!
//! Pull-based: each pass promotes and fetches a ready batch, ranks
//! candidates per task, acquires the task's resource keys in
//! lexicographic order (all-or-nothing, which prevents deadlock), and
//! atomically assigns. A fairness window keeps low-priority tasks from
//! starving: after `fairness_window` consecutive priority-ordered
//! assignments the oldest ready task goes first regardless of priority.

use std::time::Duration;

use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use conductor_db::models::{Agent, LockType, Task};
use conductor_db::queries::agents as agent_db;
use conductor_db::queries::tasks as task_db;

use crate::bus::{EventBus, topics};
use crate::config::DispatcherConfig;
use crate::error::{EngineError, EngineResult};
use crate::lock::{AcquireOutcome, LockCoordinator, LockHandle};
use crate::registry::AgentRegistry;
use crate::sched::TaskScheduler;

/// A successful binding of one task to one agent.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub task_id: Uuid,
    pub agent_id: Uuid,
}

/// Why a task was passed over this scheduling pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SkipReason {
    /// No registered agent matches the task's requirements right now.
    NoCandidate,
    /// A required resource key is held incompatibly.
    LockBusy,
    /// The task or agent changed under us; the next pass re-evaluates.
    Raced,
    /// The engine-wide concurrency bound is reached.
    AtCapacity,
}

/// Counters for one scheduling pass.
#[derive(Debug, Clone, Default)]
pub struct DispatchStats {
    pub examined: usize,
    pub assigned: usize,
    pub skipped_no_candidate: usize,
    pub skipped_lock_busy: usize,
    pub skipped_raced: usize,
    pub skipped_at_capacity: usize,
}

/// The dispatcher component.
pub struct Dispatcher {
    pool: PgPool,
    bus: EventBus,
    sched: TaskScheduler,
    registry: AgentRegistry,
    locks: LockCoordinator,
    config: DispatcherConfig,
    /// Consecutive priority-ordered assignments since the last fairness
    /// pick.
    priority_streak: std::sync::atomic::AtomicU32,
}

impl Dispatcher {
    pub fn new(
        pool: PgPool,
        bus: EventBus,
        sched: TaskScheduler,
        registry: AgentRegistry,
        locks: LockCoordinator,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            pool,
            bus,
            sched,
            registry,
            locks,
            config,
            priority_streak: std::sync::atomic::AtomicU32::new(0),
        }
    }

    /// The engine-wide in-flight bound: the configured cap, or total
    /// registered agent capacity when unset.
    async fn effective_max_concurrent(&self) -> EngineResult<usize> {
        if let Some(max) = self.config.max_concurrent_tasks {
            return Ok(max);
        }
        let agents = agent_db::list_agents(&self.pool).await?;
        Ok(agents
            .iter()
            .filter(|a| a.status.is_dispatchable())
            .map(|a| a.capacity as usize)
            .sum())
    }

    /// One scheduling pass.
    pub async fn run_once(&self) -> EngineResult<DispatchStats> {
        use std::sync::atomic::Ordering;

        self.sched.promote_ready(None).await?;

        let mut batch = self.sched.ready_tasks(None, self.config.batch_size).await?;

        // Fairness: periodically front-run the oldest ready task.
        let mut fairness_pick: Option<Uuid> = None;
        if self.priority_streak.load(Ordering::Relaxed) >= self.config.fairness_window {
            if let Some(oldest) = self.sched.oldest_ready(None).await? {
                fairness_pick = Some(oldest.id);
                batch.retain(|t| t.id != oldest.id);
                batch.insert(0, oldest);
            }
        }

        let mut stats = DispatchStats::default();

        for task in batch {
            stats.examined += 1;

            let max = self.effective_max_concurrent().await?;
            let in_flight = task_db::count_in_flight(&self.pool).await? as usize;
            if in_flight >= max {
                stats.skipped_at_capacity += 1;
                continue;
            }

            match self.try_dispatch(&task, None).await? {
                Ok(assignment) => {
                    stats.assigned += 1;
                    if fairness_pick == Some(assignment.task_id) {
                        self.priority_streak.store(0, Ordering::Relaxed);
                        fairness_pick = None;
                    } else {
                        self.priority_streak.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Err(SkipReason::NoCandidate) => stats.skipped_no_candidate += 1,
                Err(SkipReason::LockBusy) => stats.skipped_lock_busy += 1,
                Err(SkipReason::Raced) => stats.skipped_raced += 1,
                Err(SkipReason::AtCapacity) => stats.skipped_at_capacity += 1,
            }
        }

        Ok(stats)
    }

    /// The dispatcher loop: scheduling passes until cancelled, sleeping
    /// briefly when nothing was assignable.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                tracing::info!("dispatcher stopping");
                return;
            }

            let assigned = match self.run_once().await {
                Ok(stats) => {
                    if stats.assigned > 0 {
                        tracing::debug!(
                            assigned = stats.assigned,
                            examined = stats.examined,
                            "dispatch pass complete"
                        );
                    }
                    stats.assigned
                }
                Err(e) => {
                    tracing::error!(error = %e, "dispatch pass failed");
                    0
                }
            };

            if assigned == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(self.config.idle_poll_ms)) => {}
                    _ = cancel.cancelled() => {}
                }
            }
        }
    }

    /// Explicitly assign a task, optionally to a chosen agent. The task
    /// must be (or become) ready.
    pub async fn assign(
        &self,
        task_id: Uuid,
        agent_id: Option<Uuid>,
    ) -> EngineResult<Assignment> {
        self.sched.promote_ready(None).await?;
        let task = self.sched.get(task_id).await?;

        let chosen = match agent_id {
            Some(id) => Some(self.registry.get(id).await?),
            None => None,
        };

        match self.try_dispatch(&task, chosen).await? {
            Ok(assignment) => Ok(assignment),
            Err(SkipReason::NoCandidate) => Err(EngineError::InvalidInput(format!(
                "no dispatchable agent matches capabilities {:?}",
                task.required_capabilities
            ))),
            Err(SkipReason::LockBusy) => Err(EngineError::LockUnavailable {
                resource_key: task.required_resources.join(","),
                attempts: 1,
            }),
            Err(SkipReason::Raced) => Err(EngineError::Conflict(format!(
                "task {task_id} is not ready for assignment"
            ))),
            Err(SkipReason::AtCapacity) => Err(EngineError::Conflict(
                "dispatcher is at its concurrency bound".into(),
            )),
        }
    }

    /// Attempt to bind one task: choose the top-ranked candidate, take
    /// every resource key, then flip task and agent state atomically.
    async fn try_dispatch(
        &self,
        task: &Task,
        chosen: Option<Agent>,
    ) -> EngineResult<Result<Assignment, SkipReason>> {
        let agent = match chosen {
            Some(agent) => {
                let holds_all = task
                    .required_capabilities
                    .iter()
                    .all(|c| agent.capabilities.contains(c));
                if !holds_all || !agent.status.is_dispatchable() {
                    return Ok(Err(SkipReason::NoCandidate));
                }
                agent
            }
            None => {
                let candidates = self
                    .registry
                    .find_candidates(&task.required_capabilities, None, None)
                    .await?;
                match candidates.into_iter().next() {
                    Some(scored) => scored.agent,
                    None => return Ok(Err(SkipReason::NoCandidate)),
                }
            }
        };

        // Deterministic acquisition order prevents deadlock between
        // tasks sharing resource keys.
        let mut keys = task.required_resources.clone();
        keys.sort();
        keys.dedup();

        let mut held: Vec<LockHandle> = Vec::with_capacity(keys.len());
        for key in &keys {
            match self
                .locks
                .acquire(key, task.id, agent.id, LockType::Exclusive, None)
                .await?
            {
                AcquireOutcome::Acquired(handle) => held.push(handle),
                AcquireOutcome::Unavailable { .. } => {
                    self.unwind(&held).await;
                    return Ok(Err(SkipReason::LockBusy));
                }
            }
        }

        // Reserve capacity before flipping the task so load can never
        // exceed the agent's declared bound.
        if agent_db::increment_load(&self.pool, agent.id).await? == 0 {
            self.unwind(&held).await;
            return Ok(Err(SkipReason::AtCapacity));
        }

        if task_db::assign(&self.pool, task.id, agent.id).await? == 0 {
            agent_db::decrement_load(&self.pool, agent.id).await?;
            self.unwind(&held).await;
            return Ok(Err(SkipReason::Raced));
        }

        tracing::info!(
            task_id = %task.id,
            agent_id = %agent.id,
            agent_name = %agent.name,
            "task assigned"
        );
        let _ = self
            .bus
            .emit(
                topics::TASK_ASSIGNED,
                "task",
                task.id,
                serde_json::json!({
                    "agent_id": agent.id,
                    "ticket_id": task.ticket_id,
                    "phase_id": task.phase_id,
                    "task_type": task.task_type,
                    "description": task.description,
                    "required_resources": keys,
                    "timeout_seconds": task.timeout_seconds,
                }),
            )
            .await;

        Ok(Ok(Assignment {
            task_id: task.id,
            agent_id: agent.id,
        }))
    }

    /// Best-effort release of partially-acquired leases.
    async fn unwind(&self, held: &[LockHandle]) {
        for handle in held {
            if let Err(e) = self.locks.release(handle).await {
                tracing::warn!(
                    resource_key = %handle.resource_key,
                    error = %e,
                    "failed to release lock during unwind"
                );
            }
        }
    }
}
