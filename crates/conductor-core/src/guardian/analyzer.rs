//! The trajectory analyzer seam.
//!
//! The guardian assembles a [`TrajectorySnapshot`] per active agent and
//! asks an analyzer for a structured verdict. Production backs this with
//! an LLM; tests inject deterministic stubs. Analyzer failure downgrades
//! to "no verdict" and never blocks the monitoring loop.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use conductor_db::models::SteeringKind;

/// A standing constraint an agent must respect, with provenance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Constraint {
    pub text: String,
    /// Where the constraint came from (user instruction, discovery, ...).
    #[serde(default)]
    pub source: String,
    /// Lifted constraints remain visible for context but are not
    /// enforced.
    #[serde(default)]
    pub lifted: bool,
}

/// The task an agent is currently working, abridged for analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskBrief {
    pub id: Uuid,
    pub task_type: String,
    pub description: String,
    pub phase_id: String,
}

/// One recent event, abridged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBrief {
    pub event_type: String,
    pub payload: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

/// Everything the analyzer sees about one agent's trajectory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajectorySnapshot {
    pub agent_id: Uuid,
    pub agent_name: String,
    pub task: Option<TaskBrief>,
    /// The ticket's goal (title and description).
    pub overall_goal: String,
    pub phase_prompt: String,
    pub mandatory_steps: Vec<String>,
    pub constraints: Vec<Constraint>,
    pub standing_instructions: Vec<String>,
    /// Timestamped summaries of past phases, oldest first.
    pub past_summaries: Vec<String>,
    pub recent_events: Vec<EventBrief>,
}

/// Steering the analyzer recommends for a misaligned trajectory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendedSteering {
    pub kind: SteeringKind,
    pub message: String,
    pub confidence: f64,
}

/// Structured assessment of one trajectory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajectoryVerdict {
    /// Alignment with the goal, 0.0 (lost) to 1.0 (on track).
    pub alignment_score: f64,
    pub trajectory_aligned: bool,
    pub summary: String,
    #[serde(default)]
    pub detected_drift_reasons: Vec<String>,
    #[serde(default)]
    pub constraint_violations: Vec<String>,
    #[serde(default)]
    pub skipped_mandatory_steps: Vec<String>,
    #[serde(default)]
    pub recommended_steering: Option<RecommendedSteering>,
}

impl TrajectoryVerdict {
    /// A verdict that raises no flags.
    pub fn aligned(summary: impl Into<String>) -> Self {
        Self {
            alignment_score: 1.0,
            trajectory_aligned: true,
            summary: summary.into(),
            detected_drift_reasons: vec![],
            constraint_violations: vec![],
            skipped_mandatory_steps: vec![],
            recommended_steering: None,
        }
    }
}

/// Analyzes agent trajectories. One method; implementations decide how.
#[async_trait]
pub trait TrajectoryAnalyzer: Send + Sync {
    async fn analyze(&self, snapshot: &TrajectorySnapshot) -> Result<TrajectoryVerdict>;
}

/// Analyzer that finds every trajectory aligned. The default when no
/// LLM backend is wired.
pub struct AlignedAnalyzer;

#[async_trait]
impl TrajectoryAnalyzer for AlignedAnalyzer {
    async fn analyze(&self, snapshot: &TrajectorySnapshot) -> Result<TrajectoryVerdict> {
        Ok(TrajectoryVerdict::aligned(format!(
            "agent {} proceeding without analysis",
            snapshot.agent_name
        )))
    }
}
