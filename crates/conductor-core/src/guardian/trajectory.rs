//! Trajectory snapshot assembly and the per-agent verdict cache.

use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use conductor_db::models::{Agent, Task};
use conductor_db::queries::events as event_db;
use conductor_db::queries::interventions as guardian_db;
use conductor_db::queries::tickets as ticket_db;

use super::analyzer::{Constraint, EventBrief, TaskBrief, TrajectorySnapshot, TrajectoryVerdict};
use crate::phase::templates::WorkflowDefinition;

/// Shape of the `trajectory_contexts.context` document. Parsed
/// leniently; absent fields default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrajectoryDoc {
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    #[serde(default)]
    pub standing_instructions: Vec<String>,
    #[serde(default)]
    pub past_summaries: Vec<String>,
}

/// Build the analyzer input for one agent working one task.
pub async fn assemble_snapshot(
    pool: &PgPool,
    workflow: &WorkflowDefinition,
    agent: &Agent,
    task: &Task,
    event_window: i64,
) -> Result<TrajectorySnapshot> {
    let ticket = ticket_db::get_ticket(pool, task.ticket_id).await?;
    let overall_goal = ticket
        .map(|t| format!("{}: {}", t.title, t.description))
        .unwrap_or_default();

    let (phase_prompt, mandatory_steps) = match workflow.get(&task.phase_id) {
        Some(phase) => (phase.prompt.clone(), phase.mandatory_steps.clone()),
        None => (String::new(), vec![]),
    };

    let doc: TrajectoryDoc = guardian_db::get_trajectory_context(pool, agent.id)
        .await?
        .map(|row| serde_json::from_value(row.context).unwrap_or_default())
        .unwrap_or_default();

    let recent_events = event_db::latest_for_entity(pool, &agent.id.to_string(), event_window)
        .await?
        .into_iter()
        .map(|e| EventBrief {
            event_type: e.event_type,
            payload: e.payload,
            recorded_at: e.recorded_at,
        })
        .collect();

    Ok(TrajectorySnapshot {
        agent_id: agent.id,
        agent_name: agent.name.clone(),
        task: Some(TaskBrief {
            id: task.id,
            task_type: task.task_type.clone(),
            description: task.description.clone(),
            phase_id: task.phase_id.clone(),
        }),
        overall_goal,
        phase_prompt,
        mandatory_steps,
        constraints: doc.constraints,
        standing_instructions: doc.standing_instructions,
        past_summaries: doc.past_summaries,
        recent_events,
    })
}

/// A cached verdict with its capture time.
#[derive(Debug, Clone)]
pub struct CachedVerdict {
    pub verdict: TrajectoryVerdict,
    pub cached_at: DateTime<Utc>,
}

/// Bounded per-agent verdict cache. When full, the oldest entry is
/// evicted. Invalidated on task completion/failure events.
#[derive(Debug)]
pub struct VerdictCache {
    capacity: usize,
    entries: HashMap<Uuid, CachedVerdict>,
}

impl VerdictCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
        }
    }

    pub fn get(&self, agent_id: Uuid) -> Option<&CachedVerdict> {
        self.entries.get(&agent_id)
    }

    pub fn insert(&mut self, agent_id: Uuid, verdict: TrajectoryVerdict) {
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&agent_id) {
            if let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, v)| v.cached_at)
                .map(|(k, _)| *k)
            {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(
            agent_id,
            CachedVerdict {
                verdict,
                cached_at: Utc::now(),
            },
        );
    }

    pub fn invalidate(&mut self, agent_id: Uuid) {
        self.entries.remove(&agent_id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
