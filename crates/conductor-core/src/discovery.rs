//! Discovery and adaptive branching.
//!
//! A running task can record that it found more work: a bug, a missing
//! dependency, a clarification that belongs to an earlier phase. The
//! discovery may spawn a new task, in the same phase or any other,
//! without transitioning the ticket. Optionally the source task is
//! parked behind the spawned one, modeled as a plain dependency edge so
//! the ready-set machinery handles resumption.

use sqlx::PgPool;
use uuid::Uuid;

use conductor_db::models::{DiscoveryResolution, DiscoveryType, Task, TaskDiscovery, TaskStatus};
use conductor_db::queries::discoveries as db;
use conductor_db::queries::discoveries::NewDiscovery;
use conductor_db::queries::tasks as task_db;

use crate::bus::{EventBus, topics};
use crate::error::{EngineError, EngineResult};
use crate::sched::{EnqueueTask, TaskScheduler};

/// Instruction to spawn a follow-up task from a discovery.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    /// Target phase; defaults to the source task's phase. May name any
    /// phase, the ticket does not transition.
    pub phase_id: Option<String>,
    pub task_type: String,
    pub description: String,
    /// Raise the spawned task's priority one level above the source's.
    pub priority_boost: bool,
    /// Park the source task until the spawned task completes.
    pub block_source: bool,
    pub required_resources: Vec<String>,
    pub required_capabilities: Vec<String>,
}

/// A discovery with the task it spawned, if any.
#[derive(Debug, Clone)]
pub struct RecordedDiscovery {
    pub discovery: TaskDiscovery,
    pub spawned: Option<Task>,
}

/// One edge of a ticket's materialized workflow graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphEdge {
    /// `task` depends on `depends_on`.
    Dependency { task: Uuid, depends_on: Uuid },
    /// `source` recorded a discovery that spawned `spawned`.
    Discovery { source: Uuid, spawned: Uuid },
}

/// A ticket's workflow graph: original and spawned tasks plus dependency
/// and discovery edges. Materialized on demand, never stored.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    pub ticket_id: Uuid,
    pub tasks: Vec<Task>,
    pub edges: Vec<GraphEdge>,
}

/// The discovery component.
#[derive(Clone)]
pub struct DiscoveryService {
    pool: PgPool,
    bus: EventBus,
    sched: TaskScheduler,
}

impl DiscoveryService {
    pub fn new(pool: PgPool, bus: EventBus, sched: TaskScheduler) -> Self {
        Self { pool, bus, sched }
    }

    /// Record a discovery, optionally spawning a follow-up task.
    pub async fn record(
        &self,
        source_task_id: Uuid,
        discovery_type: DiscoveryType,
        description: &str,
        spawn: Option<SpawnSpec>,
    ) -> EngineResult<RecordedDiscovery> {
        let source = self.sched.get(source_task_id).await?;

        let spawned = match &spawn {
            Some(spec) => Some(self.spawn_task(&source, spec).await?),
            None => None,
        };

        let discovery = db::insert_discovery(
            &self.pool,
            &NewDiscovery {
                source_task: source_task_id,
                discovery_type,
                description: description.to_owned(),
                spawned_task: spawned.as_ref().map(|t| t.id),
                spawned_phase: spawned.as_ref().map(|t| t.phase_id.clone()),
                priority_boost: spawn.as_ref().is_some_and(|s| s.priority_boost),
            },
        )
        .await?;

        let _ = self
            .bus
            .emit(
                topics::DISCOVERY_RECORDED,
                "discovery",
                discovery.id,
                serde_json::json!({
                    "source_task": source_task_id,
                    "discovery_type": discovery_type,
                    "spawned_task": discovery.spawned_task,
                }),
            )
            .await;

        if let Some(task) = &spawned {
            let _ = self
                .bus
                .emit(
                    topics::TASK_SPAWNED_FROM_DISCOVERY,
                    "task",
                    task.id,
                    serde_json::json!({
                        "discovery_id": discovery.id,
                        "source_task": source_task_id,
                        "phase_id": task.phase_id,
                        "priority": task.priority,
                    }),
                )
                .await;
        }

        Ok(RecordedDiscovery { discovery, spawned })
    }

    async fn spawn_task(&self, source: &Task, spec: &SpawnSpec) -> EngineResult<Task> {
        if spec.block_source && source.status.is_terminal() {
            return Err(EngineError::Conflict(format!(
                "source task {} is {} and cannot be blocked on a discovery",
                source.id, source.status
            )));
        }

        let priority = if spec.priority_boost {
            source.priority.boosted()
        } else {
            source.priority
        };

        let task = self
            .sched
            .enqueue(EnqueueTask {
                ticket_id: source.ticket_id,
                phase_id: Some(
                    spec.phase_id
                        .clone()
                        .unwrap_or_else(|| source.phase_id.clone()),
                ),
                task_type: spec.task_type.clone(),
                description: spec.description.clone(),
                priority,
                optional: false,
                dependencies: vec![],
                required_resources: spec.required_resources.clone(),
                required_capabilities: spec.required_capabilities.clone(),
                max_retries: None,
                timeout_seconds: None,
            })
            .await?;

        if spec.block_source {
            self.sched.add_dependency(source.id, task.id).await?;
            if source.status != TaskStatus::Pending {
                self.sched.park_for_dependency(source.id).await?;
            }
        }

        Ok(task)
    }

    /// Update a discovery's resolution status.
    pub async fn resolve(
        &self,
        discovery_id: Uuid,
        resolution: DiscoveryResolution,
    ) -> EngineResult<()> {
        let rows = db::resolve(&self.pool, discovery_id, resolution).await?;
        if rows == 0 {
            return Err(EngineError::NotFound {
                entity: "discovery",
                id: discovery_id.to_string(),
            });
        }
        Ok(())
    }

    /// All discoveries recorded under a ticket.
    pub async fn for_ticket(&self, ticket_id: Uuid) -> EngineResult<Vec<TaskDiscovery>> {
        Ok(db::for_ticket(&self.pool, ticket_id).await?)
    }

    /// Materialize a ticket's workflow graph: tasks plus dependency and
    /// discovery edges.
    pub async fn workflow_graph(&self, ticket_id: Uuid) -> EngineResult<WorkflowGraph> {
        let tasks = task_db::list_for_ticket(&self.pool, ticket_id).await?;
        let mut edges: Vec<GraphEdge> = task_db::edges_for_ticket(&self.pool, ticket_id)
            .await?
            .into_iter()
            .map(|e| GraphEdge::Dependency {
                task: e.task_id,
                depends_on: e.depends_on,
            })
            .collect();

        for discovery in db::for_ticket(&self.pool, ticket_id).await? {
            if let Some(spawned) = discovery.spawned_task {
                edges.push(GraphEdge::Discovery {
                    source: discovery.source_task,
                    spawned,
                });
            }
        }

        Ok(WorkflowGraph {
            ticket_id,
            tasks,
            edges,
        })
    }
}
