//! Engine runtime: component wiring, supervised background loops, and
//! the transport-agnostic control API.
//!
//! `Engine::new` builds every component around one pool, bus, and
//! config; `Engine::start` spawns the loops (dispatcher, heartbeat
//! sweep, task-timeout sweep, lock-expiry sweep, three guardian passes)
//! under a supervisor that restarts panicked loops with exponential
//! backoff. All loops share one cancellation token; shutdown finishes
//! in-flight iterations and exits.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use conductor_db::models::{
    GuardianIntervention, PhaseHistoryEntry, Task, TaskDiscovery, Ticket, TicketStatus,
};
use conductor_db::queries::agents as agent_db;
use conductor_db::queries::locks as lock_db;
use conductor_db::queries::tasks as task_db;
use conductor_db::queries::tickets as ticket_db;

use crate::bus::{EventBus, topics};
use crate::config::EngineConfig;
use crate::discovery::{DiscoveryService, RecordedDiscovery, SpawnSpec, WorkflowGraph};
use crate::dispatch::{Assignment, Dispatcher};
use crate::error::EngineResult;
use crate::guardian::Guardian;
use crate::guardian::analyzer::{AlignedAnalyzer, TrajectoryAnalyzer};
use crate::lock::LockCoordinator;
use crate::phase::templates::WorkflowDefinition;
use crate::phase::{DigestSummarizer, NewTicketSpec, PhaseMachine, Summarizer, gate::GateReport};
use crate::registry::{AgentRegistry, AgentUpdate, NewAgent};
use crate::sched::{EnqueueTask, TaskScheduler};

/// Broadcast ring-buffer capacity of the in-process bus.
const BUS_CAPACITY: usize = 1024;

/// Aggregate system state for `system_health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    pub tickets_by_status: Vec<(String, i64)>,
    pub tasks_by_status: Vec<(String, i64)>,
    pub agents_total: usize,
    pub agents_dispatchable: usize,
    pub active_locks: i64,
}

/// The assembled engine.
pub struct Engine {
    pool: PgPool,
    config: EngineConfig,
    bus: EventBus,
    locks: LockCoordinator,
    registry: AgentRegistry,
    sched: TaskScheduler,
    phases: PhaseMachine,
    discovery: DiscoveryService,
    guardian: Arc<Guardian>,
    dispatcher: Arc<Dispatcher>,
}

impl Engine {
    /// Wire every component and sync the workflow's phase definitions
    /// into the store.
    pub async fn new(
        pool: PgPool,
        config: EngineConfig,
        workflow: WorkflowDefinition,
        analyzer: Arc<dyn TrajectoryAnalyzer>,
        summarizer: Arc<dyn Summarizer>,
    ) -> EngineResult<Self> {
        let workflow = Arc::new(workflow);
        let bus = EventBus::new(pool.clone(), BUS_CAPACITY);
        let locks = LockCoordinator::new(pool.clone(), bus.clone(), config.locks.clone());
        let registry = AgentRegistry::new(pool.clone(), bus.clone(), config.agents.clone());
        let sched = TaskScheduler::new(
            pool.clone(),
            bus.clone(),
            locks.clone(),
            config.tasks.clone(),
        );
        let phases = PhaseMachine::new(
            pool.clone(),
            bus.clone(),
            Arc::clone(&workflow),
            summarizer,
        );
        let discovery = DiscoveryService::new(pool.clone(), bus.clone(), sched.clone());
        let guardian = Arc::new(Guardian::new(
            pool.clone(),
            bus.clone(),
            discovery.clone(),
            Arc::clone(&workflow),
            analyzer,
            config.guardian.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            pool.clone(),
            bus.clone(),
            sched.clone(),
            registry.clone(),
            locks.clone(),
            config.dispatcher.clone(),
        ));

        let engine = Self {
            pool,
            config,
            bus,
            locks,
            registry,
            sched,
            phases,
            discovery,
            guardian,
            dispatcher,
        };
        engine.phases.sync_definitions().await?;
        Ok(engine)
    }

    /// Build with the standard workflow, a no-op analyzer, and the
    /// digest summarizer.
    pub async fn with_defaults(pool: PgPool, config: EngineConfig) -> EngineResult<Self> {
        Self::new(
            pool,
            config,
            WorkflowDefinition::standard(),
            Arc::new(AlignedAnalyzer),
            Arc::new(DigestSummarizer),
        )
        .await
    }

    // -- component handles ------------------------------------------------

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn locks(&self) -> &LockCoordinator {
        &self.locks
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.sched
    }

    pub fn phases(&self) -> &PhaseMachine {
        &self.phases
    }

    pub fn discovery(&self) -> &DiscoveryService {
        &self.discovery
    }

    pub fn guardian(&self) -> &Guardian {
        &self.guardian
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    // -- control API -------------------------------------------------------

    pub async fn create_ticket(&self, spec: NewTicketSpec) -> EngineResult<Ticket> {
        self.phases.create_ticket(spec).await
    }

    pub async fn transition_ticket(
        &self,
        ticket_id: Uuid,
        to_phase: &str,
        reason: &str,
        actor: &str,
    ) -> EngineResult<Ticket> {
        self.phases
            .transition(ticket_id, to_phase, reason, actor)
            .await
    }

    /// Cancel a ticket: every live task is cancelled, then the ticket is
    /// archived. Idempotent.
    pub async fn cancel_ticket(&self, ticket_id: Uuid, reason: &str) -> EngineResult<Ticket> {
        self.sched.cancel_tasks_for_ticket(ticket_id, reason).await?;
        self.phases.archive_ticket(ticket_id, reason).await
    }

    pub async fn get_ticket(&self, ticket_id: Uuid) -> EngineResult<Ticket> {
        self.phases.get_ticket(ticket_id).await
    }

    pub async fn list_tickets(&self, status: Option<TicketStatus>) -> EngineResult<Vec<Ticket>> {
        self.phases.list_tickets(status).await
    }

    pub async fn ticket_history(&self, ticket_id: Uuid) -> EngineResult<Vec<PhaseHistoryEntry>> {
        self.phases.history(ticket_id).await
    }

    pub async fn enqueue_task(&self, spec: EnqueueTask) -> EngineResult<Task> {
        self.sched.enqueue(spec).await
    }

    pub async fn cancel_task(&self, task_id: Uuid, reason: &str) -> EngineResult<Task> {
        self.sched.cancel_task(task_id, reason).await
    }

    pub async fn get_task(&self, task_id: Uuid) -> EngineResult<Task> {
        self.sched.get(task_id).await
    }

    pub async fn register_agent(&self, new: NewAgent) -> EngineResult<conductor_db::models::Agent> {
        self.registry.register(new).await
    }

    pub async fn update_agent(
        &self,
        agent_id: Uuid,
        update: AgentUpdate,
    ) -> EngineResult<conductor_db::models::Agent> {
        self.registry.update(agent_id, update).await
    }

    pub async fn deregister_agent(&self, agent_id: Uuid) -> EngineResult<()> {
        self.registry.deregister(agent_id).await
    }

    pub async fn heartbeat(
        &self,
        agent_id: Uuid,
        metadata: Option<serde_json::Value>,
    ) -> EngineResult<()> {
        self.registry.heartbeat(agent_id, metadata).await
    }

    pub async fn validate_gate(
        &self,
        ticket_id: Uuid,
        phase_id: Option<String>,
    ) -> EngineResult<GateReport> {
        self.phases.validate_gate(ticket_id, phase_id).await
    }

    pub async fn record_discovery(
        &self,
        source_task_id: Uuid,
        discovery_type: conductor_db::models::DiscoveryType,
        description: &str,
        spawn: Option<SpawnSpec>,
    ) -> EngineResult<RecordedDiscovery> {
        self.discovery
            .record(source_task_id, discovery_type, description, spawn)
            .await
    }

    pub async fn discoveries_for_ticket(
        &self,
        ticket_id: Uuid,
    ) -> EngineResult<Vec<TaskDiscovery>> {
        self.discovery.for_ticket(ticket_id).await
    }

    pub async fn workflow_graph(&self, ticket_id: Uuid) -> EngineResult<WorkflowGraph> {
        self.discovery.workflow_graph(ticket_id).await
    }

    /// Promote then return the ready set.
    pub async fn ready_tasks(
        &self,
        phase_id: Option<&str>,
        limit: i64,
    ) -> EngineResult<Vec<Task>> {
        self.sched.promote_ready(phase_id).await?;
        self.sched.ready_tasks(phase_id, limit).await
    }

    pub async fn assign(&self, task_id: Uuid, agent_id: Option<Uuid>) -> EngineResult<Assignment> {
        self.dispatcher.assign(task_id, agent_id).await
    }

    /// Tickets currently stuck: phase work done, gate unsatisfied past
    /// the threshold.
    pub async fn stuck_workflows(&self) -> EngineResult<Vec<Uuid>> {
        Ok(self
            .guardian
            .find_stuck()
            .await?
            .into_iter()
            .map(|s| s.ticket_id)
            .collect())
    }

    pub async fn interventions_for_agent(
        &self,
        agent_id: Uuid,
    ) -> EngineResult<Vec<GuardianIntervention>> {
        self.guardian.interventions_for_agent(agent_id).await
    }

    /// Aggregate counts across tickets, tasks, agents, and locks.
    pub async fn system_health(&self) -> EngineResult<HealthSummary> {
        let agents = agent_db::list_agents(&self.pool).await?;
        Ok(HealthSummary {
            tickets_by_status: ticket_db::count_by_status(&self.pool).await?,
            tasks_by_status: task_db::count_by_status(&self.pool).await?,
            agents_total: agents.len(),
            agents_dispatchable: agents
                .iter()
                .filter(|a| a.status.is_dispatchable() && a.current_load < a.capacity)
                .count(),
            active_locks: lock_db::count_active(&self.pool).await?,
        })
    }

    // -- runtime ----------------------------------------------------------

    /// Spawn every background loop. Returns a handle for graceful
    /// shutdown.
    pub fn start(self: &Arc<Self>) -> EngineHandle {
        let cancel = CancellationToken::new();
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        // Dispatcher.
        {
            let dispatcher = Arc::clone(&self.dispatcher);
            let token = cancel.clone();
            tasks.push(supervise("dispatcher", cancel.clone(), move || {
                let dispatcher = Arc::clone(&dispatcher);
                let token = token.clone();
                async move { dispatcher.run(token).await }
            }));
        }

        // Heartbeat/staleness sweep: quarantine silent agents and requeue
        // their in-flight work.
        {
            let engine = Arc::clone(self);
            let period = Duration::from_secs(self.config.agents.heartbeat_interval_seconds.max(1));
            let token = cancel.clone();
            tasks.push(supervise("stale-sweep", cancel.clone(), move || {
                let engine = Arc::clone(&engine);
                let token = token.clone();
                async move {
                    run_interval("stale-sweep", period, token, move || {
                        let engine = Arc::clone(&engine);
                        async move {
                            for agent in engine.registry.stale_sweep().await? {
                                engine.sched.requeue_for_agent(agent.id).await?;
                            }
                            Ok(())
                        }
                    })
                    .await;
                }
            }));
        }

        // Task timeout + cancellation-grace sweep.
        {
            let engine = Arc::clone(self);
            let grace = self.config.agents.cancel_grace_seconds;
            let token = cancel.clone();
            tasks.push(supervise("timeout-sweep", cancel.clone(), move || {
                let engine = Arc::clone(&engine);
                let token = token.clone();
                async move {
                    run_interval("timeout-sweep", Duration::from_secs(5), token, move || {
                        let engine = Arc::clone(&engine);
                        async move {
                            engine.sched.timeout_sweep().await?;
                            engine.sched.cancel_sweep(grace).await?;
                            Ok(())
                        }
                    })
                    .await;
                }
            }));
        }

        // Lock expiry sweep.
        {
            let locks = self.locks.clone();
            let period =
                Duration::from_secs((self.config.locks.default_ttl_seconds.max(4) as u64) / 4);
            let token = cancel.clone();
            tasks.push(supervise("lock-expiry", cancel.clone(), move || {
                let locks = locks.clone();
                let token = token.clone();
                async move {
                    run_interval("lock-expiry", period, token, move || {
                        let locks = locks.clone();
                        async move {
                            locks.expiry_sweep().await?;
                            Ok(())
                        }
                    })
                    .await;
                }
            }));
        }

        // Guardian pass (1): trajectory analysis.
        {
            let guardian = Arc::clone(&self.guardian);
            let period = self.config.guardian.interval();
            let token = cancel.clone();
            tasks.push(supervise("guardian-trajectory", cancel.clone(), move || {
                let guardian = Arc::clone(&guardian);
                let token = token.clone();
                async move {
                    run_interval("guardian-trajectory", period, token, move || {
                        let guardian = Arc::clone(&guardian);
                        async move {
                            guardian.analyze_agents().await?;
                            Ok(())
                        }
                    })
                    .await;
                }
            }));
        }

        // Guardian pass (2): stuck workflows.
        {
            let guardian = Arc::clone(&self.guardian);
            let period = self.config.guardian.interval();
            let token = cancel.clone();
            tasks.push(supervise("guardian-stuck", cancel.clone(), move || {
                let guardian = Arc::clone(&guardian);
                let token = token.clone();
                async move {
                    run_interval("guardian-stuck", period, token, move || {
                        let guardian = Arc::clone(&guardian);
                        async move {
                            guardian.stuck_sweep().await?;
                            Ok(())
                        }
                    })
                    .await;
                }
            }));
        }

        // Guardian pass (3): coherence.
        {
            let guardian = Arc::clone(&self.guardian);
            let period = self.config.guardian.coherence_interval();
            let token = cancel.clone();
            tasks.push(supervise("guardian-coherence", cancel.clone(), move || {
                let guardian = Arc::clone(&guardian);
                let token = token.clone();
                async move {
                    run_interval("guardian-coherence", period, token, move || {
                        let guardian = Arc::clone(&guardian);
                        async move {
                            guardian.coherence_pass().await?;
                            Ok(())
                        }
                    })
                    .await;
                }
            }));
        }

        // Verdict-cache invalidation on task completion/failure.
        let mut listeners: Vec<JoinHandle<()>> = Vec::new();
        {
            let guardian = Arc::clone(&self.guardian);
            let pool = self.pool.clone();
            listeners.push(self.bus.subscribe_handler("task.*", move |event| {
                let guardian = Arc::clone(&guardian);
                let pool = pool.clone();
                async move {
                    if !matches!(
                        event.event_type.as_str(),
                        topics::TASK_COMPLETED
                            | topics::TASK_FAILED_TRANSIENT
                            | topics::TASK_FAILED_PERMANENT
                    ) {
                        return Ok(());
                    }
                    let task_id: Uuid = event.entity_id.parse()?;
                    if let Some(task) = task_db::get_task(&pool, task_id).await? {
                        if let Some(agent_id) = task.assigned_agent {
                            guardian.invalidate_agent(agent_id).await;
                        }
                    }
                    Ok(())
                }
            }));
        }

        EngineHandle {
            cancel,
            tasks,
            listeners,
        }
    }
}

/// Handle over the running loops.
pub struct EngineHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    /// Bus-subscription tasks; ended by abort since they block on the
    /// broadcast stream rather than the cancellation token.
    listeners: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    /// The shared cancellation token.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Graceful shutdown: signal every loop, then wait for them to
    /// finish their in-flight iteration.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    tracing::warn!(error = %e, "engine loop ended abnormally");
                }
            }
        }
        for listener in self.listeners {
            listener.abort();
        }
    }
}

/// Restart a loop body whenever it panics, with exponential backoff.
/// Returns when the loop body finishes normally after cancellation.
fn supervise<F, Fut>(
    name: &'static str,
    cancel: CancellationToken,
    mut factory: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut backoff = Duration::from_millis(500);
        loop {
            let result = tokio::spawn(factory()).await;
            match result {
                Ok(()) => {
                    if cancel.is_cancelled() {
                        return;
                    }
                    // A loop body returning without cancellation is
                    // unexpected; restart it like a panic.
                    tracing::warn!(loop_name = name, "engine loop exited early, restarting");
                }
                Err(e) if e.is_panic() => {
                    tracing::error!(loop_name = name, "engine loop panicked, restarting");
                }
                Err(_) => return,
            }

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = cancel.cancelled() => return,
            }
            backoff = (backoff * 2).min(Duration::from_secs(60));
        }
    })
}

/// Drive `f` on a fixed period until cancelled. Iteration errors are
/// logged, never fatal.
async fn run_interval<F, Fut>(name: &'static str, period: Duration, cancel: CancellationToken, f: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = EngineResult<()>>,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {
                if let Err(e) = f().await {
                    tracing::error!(loop_name = name, error = %e, "sweep iteration failed");
                }
            }
        }
    }
}
