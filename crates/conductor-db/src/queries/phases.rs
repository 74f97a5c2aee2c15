//! Database query functions for the `phases`, `phase_history`, and
//! `phase_gate_artifacts` tables.

use anyhow::{Context, Result};
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

use crate::models::{PhaseGateArtifact, PhaseHistoryEntry, PhaseRow};

/// Upsert a phase definition row (synced from workflow config at
/// startup).
pub async fn upsert_phase<'e>(
    ex: impl PgExecutor<'e>,
    id: &str,
    position: i32,
    definition: &serde_json::Value,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO phases (id, position, definition) \
         VALUES ($1, $2, $3) \
         ON CONFLICT (id) DO UPDATE \
         SET position = EXCLUDED.position, \
             definition = EXCLUDED.definition, \
             updated_at = now()",
    )
    .bind(id)
    .bind(position)
    .bind(definition)
    .execute(ex)
    .await
    .context("failed to upsert phase")?;

    Ok(())
}

/// List all phase rows in workflow order.
pub async fn list_phases(pool: &PgPool) -> Result<Vec<PhaseRow>> {
    let phases = sqlx::query_as::<_, PhaseRow>("SELECT * FROM phases ORDER BY position")
        .fetch_all(pool)
        .await
        .context("failed to list phases")?;

    Ok(phases)
}

/// Fields for a new phase-history entry.
#[derive(Debug, Clone)]
pub struct NewPhaseHistory {
    pub ticket_id: Uuid,
    pub from_phase: String,
    pub to_phase: String,
    pub reason: String,
    pub actor: String,
    pub artifacts: serde_json::Value,
}

/// Append a transition record. The table has no update path; history is
/// immutable once written.
pub async fn insert_history<'e>(
    ex: impl PgExecutor<'e>,
    new: &NewPhaseHistory,
) -> Result<PhaseHistoryEntry> {
    let entry = sqlx::query_as::<_, PhaseHistoryEntry>(
        "INSERT INTO phase_history (ticket_id, from_phase, to_phase, reason, actor, artifacts) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         RETURNING *",
    )
    .bind(new.ticket_id)
    .bind(&new.from_phase)
    .bind(&new.to_phase)
    .bind(&new.reason)
    .bind(&new.actor)
    .bind(&new.artifacts)
    .fetch_one(ex)
    .await
    .context("failed to insert phase history")?;

    Ok(entry)
}

/// Full transition history for a ticket, oldest first.
pub async fn history_for_ticket(pool: &PgPool, ticket_id: Uuid) -> Result<Vec<PhaseHistoryEntry>> {
    let entries = sqlx::query_as::<_, PhaseHistoryEntry>(
        "SELECT * FROM phase_history WHERE ticket_id = $1 ORDER BY recorded_at ASC, id ASC",
    )
    .bind(ticket_id)
    .fetch_all(pool)
    .await
    .context("failed to fetch phase history")?;

    Ok(entries)
}

/// Fields for a new gate artifact.
#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub ticket_id: Uuid,
    pub phase_id: String,
    pub artifact_kind: String,
    pub payload: serde_json::Value,
    pub collected_by: Option<Uuid>,
}

/// Record a piece of gate evidence.
pub async fn insert_artifact<'e>(
    ex: impl PgExecutor<'e>,
    new: &NewArtifact,
) -> Result<PhaseGateArtifact> {
    let artifact = sqlx::query_as::<_, PhaseGateArtifact>(
        "INSERT INTO phase_gate_artifacts (ticket_id, phase_id, artifact_kind, payload, collected_by) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(new.ticket_id)
    .bind(&new.phase_id)
    .bind(&new.artifact_kind)
    .bind(&new.payload)
    .bind(new.collected_by)
    .fetch_one(ex)
    .await
    .context("failed to insert gate artifact")?;

    Ok(artifact)
}

/// All artifacts collected for a ticket in one phase.
pub async fn artifacts_for<'e>(
    ex: impl PgExecutor<'e>,
    ticket_id: Uuid,
    phase_id: &str,
) -> Result<Vec<PhaseGateArtifact>> {
    let artifacts = sqlx::query_as::<_, PhaseGateArtifact>(
        "SELECT * FROM phase_gate_artifacts \
         WHERE ticket_id = $1 AND phase_id = $2 \
         ORDER BY recorded_at ASC",
    )
    .bind(ticket_id)
    .bind(phase_id)
    .fetch_all(ex)
    .await
    .context("failed to fetch gate artifacts")?;

    Ok(artifacts)
}

/// Distinct artifact kinds present for a ticket in one phase.
pub async fn artifact_kinds<'e>(
    ex: impl PgExecutor<'e>,
    ticket_id: Uuid,
    phase_id: &str,
) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT DISTINCT artifact_kind FROM phase_gate_artifacts \
         WHERE ticket_id = $1 AND phase_id = $2 \
         ORDER BY artifact_kind",
    )
    .bind(ticket_id)
    .bind(phase_id)
    .fetch_all(ex)
    .await
    .context("failed to fetch artifact kinds")?;

    Ok(rows.into_iter().map(|(kind,)| kind).collect())
}
