//! Agent registry: the live catalog of workers, their capabilities,
//! capacity, and health, plus deterministic best-fit ranking for
//! dispatch.
//!
//! Workers heartbeat every `heartbeat_interval_seconds`; the stale sweep
//! marks agents silent beyond `stale_timeout_seconds` as unreachable so
//! their in-flight tasks can be requeued.

use std::cmp::Ordering;

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use conductor_db::models::{Agent, AgentStatus};
use conductor_db::queries::agents as db;
pub use conductor_db::queries::agents::{AgentUpdate, NewAgent};

use crate::bus::{EventBus, topics};
use crate::config::AgentConfig;
use crate::error::{EngineError, EngineResult};

/// Ranking weights. Higher score wins.
const W_CAP: f64 = 0.5;
const W_CAP_FREE: f64 = 0.3;
const W_HEALTH: f64 = 0.2;
const W_STALE: f64 = 0.001;

/// Deterministic best-fit score for one candidate.
///
/// `w_cap × capability_match_ratio + w_cap_free × (1 − load/capacity)
///  + w_health × health − w_stale × staleness_seconds`
pub fn score(agent: &Agent, required_capabilities: &[String], now: DateTime<Utc>) -> f64 {
    let cap_ratio = if required_capabilities.is_empty() {
        1.0
    } else {
        let held = required_capabilities
            .iter()
            .filter(|c| agent.capabilities.contains(c))
            .count();
        held as f64 / required_capabilities.len() as f64
    };

    let cap_free = 1.0 - agent.current_load as f64 / agent.capacity.max(1) as f64;
    let staleness = (now - agent.last_heartbeat).num_seconds().max(0) as f64;

    W_CAP * cap_ratio + W_CAP_FREE * cap_free + W_HEALTH * agent.health_score - W_STALE * staleness
}

/// A candidate agent with its computed score.
#[derive(Debug, Clone)]
pub struct ScoredAgent {
    pub agent: Agent,
    pub score: f64,
}

/// Order candidates: score desc, then lowest load, then lexicographic id
/// (the final tiers keep test runs deterministic).
fn rank(a: &ScoredAgent, b: &ScoredAgent) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.agent.current_load.cmp(&b.agent.current_load))
        .then_with(|| a.agent.id.to_string().cmp(&b.agent.id.to_string()))
}

/// The live worker catalog.
#[derive(Clone)]
pub struct AgentRegistry {
    pool: PgPool,
    bus: EventBus,
    config: AgentConfig,
}

impl AgentRegistry {
    pub fn new(pool: PgPool, bus: EventBus, config: AgentConfig) -> Self {
        Self { pool, bus, config }
    }

    /// Register a new worker. Names are unique; re-registering an
    /// existing name is a conflict.
    pub async fn register(&self, new: NewAgent) -> EngineResult<Agent> {
        if new.name.trim().is_empty() {
            return Err(EngineError::InvalidInput("agent name is empty".into()));
        }
        if new.capacity < 1 {
            return Err(EngineError::InvalidInput(format!(
                "agent capacity must be at least 1, got {}",
                new.capacity
            )));
        }

        let agent = match db::insert_agent(&self.pool, &new).await {
            Ok(agent) => agent,
            Err(e) if is_unique_violation(&e) => {
                return Err(EngineError::Conflict(format!(
                    "agent name {:?} already registered",
                    new.name
                )));
            }
            Err(e) => return Err(e.into()),
        };

        let _ = self
            .bus
            .emit(
                topics::AGENT_REGISTERED,
                "agent",
                agent.id,
                serde_json::json!({
                    "name": agent.name,
                    "capabilities": agent.capabilities,
                    "capacity": agent.capacity,
                }),
            )
            .await;

        Ok(agent)
    }

    /// Fetch one registration.
    pub async fn get(&self, id: Uuid) -> EngineResult<Agent> {
        db::get_agent(&self.pool, id)
            .await?
            .ok_or(EngineError::NotFound {
                entity: "agent",
                id: id.to_string(),
            })
    }

    /// List all registrations.
    pub async fn list(&self) -> EngineResult<Vec<Agent>> {
        Ok(db::list_agents(&self.pool).await?)
    }

    /// Apply a partial update to a registration.
    pub async fn update(&self, id: Uuid, update: AgentUpdate) -> EngineResult<Agent> {
        if let Some(capacity) = update.capacity {
            if capacity < 1 {
                return Err(EngineError::InvalidInput(format!(
                    "agent capacity must be at least 1, got {capacity}"
                )));
            }
        }
        let rows = db::update_agent(&self.pool, id, &update).await?;
        if rows == 0 {
            return Err(EngineError::NotFound {
                entity: "agent",
                id: id.to_string(),
            });
        }
        self.get(id).await
    }

    /// Remove a registration.
    pub async fn deregister(&self, id: Uuid) -> EngineResult<()> {
        let rows = db::delete_agent(&self.pool, id).await?;
        if rows == 0 {
            return Err(EngineError::NotFound {
                entity: "agent",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    /// Record a worker heartbeat. Idempotent; revives unreachable
    /// agents.
    pub async fn heartbeat(
        &self,
        id: Uuid,
        metadata: Option<serde_json::Value>,
    ) -> EngineResult<()> {
        let rows = db::heartbeat(&self.pool, id, metadata.as_ref()).await?;
        if rows == 0 {
            return Err(EngineError::NotFound {
                entity: "agent",
                id: id.to_string(),
            });
        }
        let _ = self
            .bus
            .emit(
                topics::AGENT_HEARTBEAT,
                "agent",
                id,
                metadata.unwrap_or_else(|| serde_json::json!({})),
            )
            .await;
        Ok(())
    }

    /// Manually mark an agent unreachable.
    pub async fn mark_unreachable(&self, id: Uuid) -> EngineResult<()> {
        let rows = db::set_status(&self.pool, id, AgentStatus::Unreachable).await?;
        if rows == 0 {
            return Err(EngineError::NotFound {
                entity: "agent",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    /// Ranked dispatch candidates holding every required capability.
    ///
    /// Filters to dispatchable agents (idle/busy, spare capacity, health
    /// at or above `min_health`, heartbeat within the staleness window),
    /// then orders by score with deterministic tie-breaking.
    pub async fn find_candidates(
        &self,
        required_capabilities: &[String],
        tags: Option<&[String]>,
        min_health: Option<f64>,
    ) -> EngineResult<Vec<ScoredAgent>> {
        let now = Utc::now();
        let cutoff = now - Duration::seconds(self.config.stale_timeout_seconds);
        let min_health = min_health.unwrap_or(self.config.min_health);

        let agents =
            db::candidates(&self.pool, required_capabilities, tags, min_health, cutoff).await?;

        let mut scored: Vec<ScoredAgent> = agents
            .into_iter()
            .map(|agent| {
                let score = score(&agent, required_capabilities, now);
                ScoredAgent { agent, score }
            })
            .collect();
        scored.sort_by(rank);
        Ok(scored)
    }

    /// Mark agents silent past the staleness window as unreachable and
    /// emit `agent.stale.detected` for each. Returns the newly-stale
    /// agents so the caller can requeue their in-flight tasks.
    pub async fn stale_sweep(&self) -> EngineResult<Vec<Agent>> {
        let cutoff = Utc::now() - Duration::seconds(self.config.stale_timeout_seconds);
        let stale = db::stale_agents(&self.pool, cutoff).await?;

        for agent in &stale {
            db::set_status(&self.pool, agent.id, AgentStatus::Unreachable)
                .await
                .with_context(|| format!("failed to quarantine stale agent {}", agent.id))?;
            tracing::warn!(
                agent_id = %agent.id,
                agent_name = %agent.name,
                last_heartbeat = %agent.last_heartbeat,
                "agent went stale"
            );
            let _ = self
                .bus
                .emit(
                    topics::AGENT_STALE_DETECTED,
                    "agent",
                    agent.id,
                    serde_json::json!({
                        "name": agent.name,
                        "last_heartbeat": agent.last_heartbeat,
                    }),
                )
                .await;
        }

        Ok(stale)
    }
}

fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.downcast_ref::<sqlx::Error>()
        .and_then(|e| e.as_database_error())
        .and_then(|db| db.code())
        .is_some_and(|code| code == "23505")
}
