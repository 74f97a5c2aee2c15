//! Guardian: the intelligent monitoring loop.
//!
//! Three cooperating passes, each driven on its own cadence by the
//! engine runtime:
//!
//! 1. **Trajectory analysis** — per active agent, assemble a snapshot and
//!    ask the analyzer for a verdict; confident steering recommendations
//!    become interventions delivered over the bus, rate-limited per
//!    (agent, kind) by a cooldown.
//! 2. **Stuck-workflow detection** — tickets whose phase tasks are all
//!    complete but whose gate stays unsatisfied past a threshold get a
//!    `workflow.stuck.detected` event and one recovery task.
//! 3. **System coherence** — duplicate work, phase mismatches, and load
//!    imbalance surface as `system.incoherence.detected` events; nothing
//!    is spawned automatically.
//!
//! Analyzer failures downgrade to "no verdict". Each agent is analyzed
//! in isolation; one failure never poisons the rest of the pass.

pub mod analyzer;
pub mod trajectory;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use tokio::sync::Mutex;
use uuid::Uuid;

use conductor_db::models::{
    DiscoveryType, GuardianIntervention, InterventionOutcome, SteeringKind, TaskStatus,
    TicketStatus,
};
use conductor_db::queries::agents as agent_db;
use conductor_db::queries::discoveries as discovery_db;
use conductor_db::queries::interventions as db;
use conductor_db::queries::interventions::NewIntervention;
use conductor_db::queries::tasks as task_db;
use conductor_db::queries::tickets as ticket_db;

use crate::bus::{EventBus, topics};
use crate::config::GuardianConfig;
use crate::discovery::{DiscoveryService, SpawnSpec};
use crate::error::EngineResult;
use crate::phase::gate;
use crate::phase::templates::WorkflowDefinition;
use analyzer::{RecommendedSteering, TrajectoryAnalyzer};
use trajectory::VerdictCache;

/// Canned description for guardian-spawned recovery tasks.
const RECOVERY_DESCRIPTION: &str = "Submit final result with evidence";

/// A ticket detected as stuck: phase work done, gate unsatisfied.
#[derive(Debug, Clone)]
pub struct StuckTicket {
    pub ticket_id: Uuid,
    pub phase_id: String,
    /// When the last task of the phase completed.
    pub since: DateTime<Utc>,
}

/// The guardian component.
pub struct Guardian {
    pool: PgPool,
    bus: EventBus,
    discovery: DiscoveryService,
    workflow: Arc<WorkflowDefinition>,
    analyzer: Arc<dyn TrajectoryAnalyzer>,
    config: GuardianConfig,
    cooldowns: Mutex<HashMap<(Uuid, SteeringKind), DateTime<Utc>>>,
    cache: Mutex<VerdictCache>,
}

impl Guardian {
    pub fn new(
        pool: PgPool,
        bus: EventBus,
        discovery: DiscoveryService,
        workflow: Arc<WorkflowDefinition>,
        analyzer: Arc<dyn TrajectoryAnalyzer>,
        config: GuardianConfig,
    ) -> Self {
        let cache = Mutex::new(VerdictCache::new(config.verdict_cache_size));
        Self {
            pool,
            bus,
            discovery,
            workflow,
            analyzer,
            config,
            cooldowns: Mutex::new(HashMap::new()),
            cache,
        }
    }

    /// Drop an agent's cached verdict (wired to task completion/failure
    /// events by the engine).
    pub async fn invalidate_agent(&self, agent_id: Uuid) {
        self.cache.lock().await.invalidate(agent_id);
    }

    /// Pass (1): analyze every agent with running work.
    ///
    /// Returns the interventions issued this pass.
    pub async fn analyze_agents(&self) -> EngineResult<Vec<GuardianIntervention>> {
        let agents = agent_db::list_agents(&self.pool).await?;
        let mut issued = Vec::new();

        for agent in agents {
            if !agent.status.is_dispatchable() || agent.current_load == 0 {
                continue;
            }
            let running: Vec<_> = task_db::in_flight_on_agent(&self.pool, agent.id)
                .await?
                .into_iter()
                .filter(|t| t.status == TaskStatus::Running)
                .collect();
            let Some(task) = running.first() else {
                continue;
            };

            let snapshot = match trajectory::assemble_snapshot(
                &self.pool,
                &self.workflow,
                &agent,
                task,
                self.config.event_window,
            )
            .await
            {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    tracing::warn!(agent_id = %agent.id, error = %e, "snapshot assembly failed");
                    continue;
                }
            };

            // Analyzer failure means no verdict, never a dead loop.
            let verdict = match self.analyzer.analyze(&snapshot).await {
                Ok(verdict) => verdict,
                Err(e) => {
                    tracing::warn!(
                        agent_id = %agent.id,
                        error = %e,
                        "trajectory analyzer unavailable, skipping agent"
                    );
                    continue;
                }
            };

            self.cache.lock().await.insert(agent.id, verdict.clone());

            let Some(steering) = effective_steering(&verdict, &self.config) else {
                continue;
            };
            if steering.confidence < self.config.confidence_threshold {
                tracing::debug!(
                    agent_id = %agent.id,
                    kind = %steering.kind,
                    confidence = steering.confidence,
                    "steering below confidence threshold"
                );
                continue;
            }
            if self.in_cooldown(agent.id, steering.kind).await? {
                continue;
            }

            let intervention = db::insert_intervention(
                &self.pool,
                &NewIntervention {
                    agent_id: Some(agent.id),
                    ticket_id: Some(task.ticket_id),
                    kind: steering.kind,
                    message: steering.message.clone(),
                    evidence: serde_json::json!({
                        "alignment_score": verdict.alignment_score,
                        "drift_reasons": verdict.detected_drift_reasons,
                        "constraint_violations": verdict.constraint_violations,
                        "skipped_mandatory_steps": verdict.skipped_mandatory_steps,
                        "summary": verdict.summary,
                    }),
                    confidence: steering.confidence,
                },
            )
            .await?;

            self.cooldowns
                .lock()
                .await
                .insert((agent.id, steering.kind), Utc::now());

            tracing::info!(
                agent_id = %agent.id,
                kind = %steering.kind,
                confidence = steering.confidence,
                "issuing guardian intervention"
            );
            // The bus is the delivery channel; workers subscribe and ack.
            let _ = self
                .bus
                .emit(
                    topics::GUARDIAN_INTERVENTION_ISSUED,
                    "agent",
                    agent.id,
                    serde_json::json!({
                        "intervention_id": intervention.id,
                        "kind": steering.kind,
                        "message": steering.message,
                        "confidence": steering.confidence,
                        "task_id": task.id,
                    }),
                )
                .await;

            issued.push(intervention);
        }

        Ok(issued)
    }

    /// Pass (2), read-only half: find tickets whose current phase has all
    /// required tasks completed but an unsatisfied gate for longer than
    /// the stuck threshold.
    pub async fn find_stuck(&self) -> EngineResult<Vec<StuckTicket>> {
        let threshold = Duration::seconds(self.config.stuck_threshold_seconds);
        let now = Utc::now();
        let mut stuck = Vec::new();

        for ticket in ticket_db::list_tickets(&self.pool, Some(TicketStatus::Active)).await? {
            let Some(phase) = self.workflow.get(&ticket.current_phase) else {
                continue;
            };
            if phase.terminal || phase.bypass_gate {
                continue;
            }

            let tasks =
                task_db::list_for_ticket_phase(&self.pool, ticket.id, &phase.id).await?;
            if tasks.is_empty() {
                continue;
            }
            let open =
                task_db::incomplete_required_count(&self.pool, ticket.id, &phase.id).await?;
            if open > 0 {
                continue;
            }

            let mut conn = self
                .pool
                .acquire()
                .await
                .context("failed to acquire connection")?;
            let report = gate::evaluate(&mut conn, &ticket, phase).await?;
            if report.passed() {
                continue;
            }

            let Some(since) = task_db::latest_completion(&self.pool, ticket.id, &phase.id).await?
            else {
                continue;
            };
            if now - since >= threshold {
                stuck.push(StuckTicket {
                    ticket_id: ticket.id,
                    phase_id: phase.id.clone(),
                    since,
                });
            }
        }

        Ok(stuck)
    }

    /// Pass (2), acting half: emit `workflow.stuck.detected` for each
    /// stuck ticket and spawn one priority-boosted recovery task. An
    /// open recovery discovery suppresses re-spawning.
    pub async fn stuck_sweep(&self) -> EngineResult<Vec<StuckTicket>> {
        let stuck = self.find_stuck().await?;

        for entry in &stuck {
            let _ = self
                .bus
                .emit(
                    topics::WORKFLOW_STUCK_DETECTED,
                    "ticket",
                    entry.ticket_id,
                    serde_json::json!({
                        "phase_id": entry.phase_id,
                        "since": entry.since,
                    }),
                )
                .await;

            let open = discovery_db::open_of_type_for_ticket(
                &self.pool,
                entry.ticket_id,
                DiscoveryType::StalledWorkflow,
            )
            .await?;
            if !open.is_empty() {
                tracing::debug!(
                    ticket_id = %entry.ticket_id,
                    "recovery task already pending, not re-spawning"
                );
                continue;
            }

            // Anchor the discovery to the most recently completed task of
            // the stalled phase.
            let tasks =
                task_db::list_for_ticket_phase(&self.pool, entry.ticket_id, &entry.phase_id)
                    .await?;
            let Some(anchor) = tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Completed)
                .max_by_key(|t| t.completed_at)
            else {
                continue;
            };

            self.discovery
                .record(
                    anchor.id,
                    DiscoveryType::StalledWorkflow,
                    "phase work complete but gate evidence missing",
                    Some(SpawnSpec {
                        phase_id: Some(entry.phase_id.clone()),
                        task_type: "submit_result".into(),
                        description: RECOVERY_DESCRIPTION.into(),
                        priority_boost: true,
                        block_source: false,
                        required_resources: vec![],
                        required_capabilities: vec![],
                    }),
                )
                .await?;

            tracing::warn!(
                ticket_id = %entry.ticket_id,
                phase_id = %entry.phase_id,
                "stuck workflow detected, recovery task spawned"
            );
        }

        Ok(stuck)
    }

    /// Pass (3): conductor-level coherence. Emits
    /// `system.incoherence.detected` events; spawns nothing.
    pub async fn coherence_pass(&self) -> EngineResult<usize> {
        let mut findings = 0usize;

        for dup in task_db::duplicate_running_work(&self.pool).await? {
            findings += 1;
            let _ = self
                .bus
                .emit(
                    topics::SYSTEM_INCOHERENCE_DETECTED,
                    "ticket",
                    dup.ticket_id,
                    serde_json::json!({
                        "kind": "duplicate_work",
                        "description": dup.description,
                        "task_count": dup.task_count,
                        "agents": dup.agents,
                    }),
                )
                .await;
        }

        for task in task_db::phase_mismatched_running(&self.pool).await? {
            findings += 1;
            let _ = self
                .bus
                .emit(
                    topics::SYSTEM_INCOHERENCE_DETECTED,
                    "task",
                    task.id,
                    serde_json::json!({
                        "kind": "phase_mismatch",
                        "task_phase": task.phase_id,
                        "ticket_id": task.ticket_id,
                        "agent_id": task.assigned_agent,
                    }),
                )
                .await;
        }

        let agents = agent_db::list_agents(&self.pool).await?;
        let ratios: Vec<f64> = agents
            .iter()
            .filter(|a| a.status.is_dispatchable())
            .map(|a| a.current_load as f64 / a.capacity.max(1) as f64)
            .collect();
        if ratios.len() >= 2 {
            let max = ratios.iter().cloned().fold(f64::MIN, f64::max);
            let min = ratios.iter().cloned().fold(f64::MAX, f64::min);
            if max - min >= 0.75 {
                findings += 1;
                let _ = self
                    .bus
                    .emit(
                        topics::SYSTEM_INCOHERENCE_DETECTED,
                        "system",
                        "load_balance",
                        serde_json::json!({
                            "kind": "load_imbalance",
                            "max_load_ratio": max,
                            "min_load_ratio": min,
                        }),
                    )
                    .await;
            }
        }

        Ok(findings)
    }

    /// Record a worker's response to an intervention.
    pub async fn mark_outcome(
        &self,
        intervention_id: Uuid,
        outcome: InterventionOutcome,
    ) -> EngineResult<()> {
        let rows = db::set_outcome(&self.pool, intervention_id, outcome).await?;
        if rows == 0 {
            return Err(crate::error::EngineError::NotFound {
                entity: "intervention",
                id: intervention_id.to_string(),
            });
        }
        Ok(())
    }

    /// Interventions targeting one agent, newest first.
    pub async fn interventions_for_agent(
        &self,
        agent_id: Uuid,
    ) -> EngineResult<Vec<GuardianIntervention>> {
        Ok(db::list_for_agent(&self.pool, agent_id).await?)
    }

    /// Whether an (agent, kind) pair is inside its intervention cooldown.
    async fn in_cooldown(&self, agent_id: Uuid, kind: SteeringKind) -> EngineResult<bool> {
        let cooldown = Duration::seconds(self.config.intervention_cooldown_seconds);
        let now = Utc::now();

        if let Some(last) = self.cooldowns.lock().await.get(&(agent_id, kind)) {
            if now - *last < cooldown {
                return Ok(true);
            }
        }
        // Fall back to the store so restarts keep the cooldown.
        if let Some(last) = db::latest_for_agent(&self.pool, agent_id, kind).await? {
            if now - last.issued_at < cooldown {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Derive the steering to act on from a verdict: the analyzer's
/// recommendation, escalated to `emergency` when alignment collapses.
/// A `drifting` recommendation only holds while alignment is actually
/// below the threshold.
fn effective_steering(
    verdict: &analyzer::TrajectoryVerdict,
    config: &GuardianConfig,
) -> Option<RecommendedSteering> {
    let mut steering = verdict.recommended_steering.clone()?;
    if steering.kind == SteeringKind::Drifting
        && verdict.alignment_score >= config.alignment_threshold
    {
        return None;
    }
    if verdict.alignment_score < config.emergency_threshold {
        steering.kind = SteeringKind::Emergency;
    }
    Some(steering)
}
