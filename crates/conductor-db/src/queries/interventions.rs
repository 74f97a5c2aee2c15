//! Database query functions for guardian state: the
//! `guardian_interventions` and `trajectory_contexts` tables.

use anyhow::{Context, Result};
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

use crate::models::{GuardianIntervention, InterventionOutcome, SteeringKind, TrajectoryContextRow};

/// Fields for a new intervention record.
#[derive(Debug, Clone)]
pub struct NewIntervention {
    pub agent_id: Option<Uuid>,
    pub ticket_id: Option<Uuid>,
    pub kind: SteeringKind,
    pub message: String,
    pub evidence: serde_json::Value,
    pub confidence: f64,
}

/// Persist an intervention. The initial outcome is `delivered`.
pub async fn insert_intervention<'e>(
    ex: impl PgExecutor<'e>,
    new: &NewIntervention,
) -> Result<GuardianIntervention> {
    let intervention = sqlx::query_as::<_, GuardianIntervention>(
        "INSERT INTO guardian_interventions \
             (agent_id, ticket_id, kind, message, evidence, confidence) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         RETURNING *",
    )
    .bind(new.agent_id)
    .bind(new.ticket_id)
    .bind(new.kind)
    .bind(&new.message)
    .bind(&new.evidence)
    .bind(new.confidence)
    .fetch_one(ex)
    .await
    .context("failed to insert intervention")?;

    Ok(intervention)
}

/// The most recent intervention of one kind for an agent.
pub async fn latest_for_agent(
    pool: &PgPool,
    agent_id: Uuid,
    kind: SteeringKind,
) -> Result<Option<GuardianIntervention>> {
    let intervention = sqlx::query_as::<_, GuardianIntervention>(
        "SELECT * FROM guardian_interventions \
         WHERE agent_id = $1 AND kind = $2 \
         ORDER BY issued_at DESC \
         LIMIT 1",
    )
    .bind(agent_id)
    .bind(kind)
    .fetch_optional(pool)
    .await
    .context("failed to fetch latest intervention")?;

    Ok(intervention)
}

/// All interventions targeting an agent, newest first.
pub async fn list_for_agent(pool: &PgPool, agent_id: Uuid) -> Result<Vec<GuardianIntervention>> {
    let interventions = sqlx::query_as::<_, GuardianIntervention>(
        "SELECT * FROM guardian_interventions \
         WHERE agent_id = $1 \
         ORDER BY issued_at DESC",
    )
    .bind(agent_id)
    .fetch_all(pool)
    .await
    .context("failed to list interventions for agent")?;

    Ok(interventions)
}

/// All interventions targeting a ticket, newest first.
pub async fn list_for_ticket(pool: &PgPool, ticket_id: Uuid) -> Result<Vec<GuardianIntervention>> {
    let interventions = sqlx::query_as::<_, GuardianIntervention>(
        "SELECT * FROM guardian_interventions \
         WHERE ticket_id = $1 \
         ORDER BY issued_at DESC",
    )
    .bind(ticket_id)
    .fetch_all(pool)
    .await
    .context("failed to list interventions for ticket")?;

    Ok(interventions)
}

/// Update the outcome of a delivered intervention.
pub async fn set_outcome<'e>(
    ex: impl PgExecutor<'e>,
    id: Uuid,
    outcome: InterventionOutcome,
) -> Result<u64> {
    let result = sqlx::query("UPDATE guardian_interventions SET outcome = $1 WHERE id = $2")
        .bind(outcome)
        .bind(id)
        .execute(ex)
        .await
        .context("failed to set intervention outcome")?;

    Ok(result.rows_affected())
}

/// Upsert the cached trajectory context document for an agent.
pub async fn upsert_trajectory_context<'e>(
    ex: impl PgExecutor<'e>,
    agent_id: Uuid,
    context: &serde_json::Value,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO trajectory_contexts (agent_id, context) \
         VALUES ($1, $2) \
         ON CONFLICT (agent_id) DO UPDATE \
         SET context = EXCLUDED.context, updated_at = now()",
    )
    .bind(agent_id)
    .bind(context)
    .execute(ex)
    .await
    .context("failed to upsert trajectory context")?;

    Ok(())
}

/// Fetch the cached trajectory context for an agent.
pub async fn get_trajectory_context(
    pool: &PgPool,
    agent_id: Uuid,
) -> Result<Option<TrajectoryContextRow>> {
    let row = sqlx::query_as::<_, TrajectoryContextRow>(
        "SELECT * FROM trajectory_contexts WHERE agent_id = $1",
    )
    .bind(agent_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch trajectory context")?;

    Ok(row)
}
