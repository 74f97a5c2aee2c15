//! Database query functions for the `agents` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

use crate::models::{Agent, AgentStatus};

/// Fields for a new agent registration.
#[derive(Debug, Clone)]
pub struct NewAgent {
    pub name: String,
    pub capabilities: Vec<String>,
    pub capacity: i32,
    pub tags: Vec<String>,
    pub attributes: serde_json::Value,
}

/// Insert a new agent row. Fails if the name is already registered.
pub async fn insert_agent<'e>(ex: impl PgExecutor<'e>, new: &NewAgent) -> Result<Agent> {
    let agent = sqlx::query_as::<_, Agent>(
        "INSERT INTO agents (name, capabilities, capacity, tags, attributes) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(&new.name)
    .bind(&new.capabilities)
    .bind(new.capacity)
    .bind(&new.tags)
    .bind(&new.attributes)
    .fetch_one(ex)
    .await
    .context("failed to insert agent")?;

    Ok(agent)
}

/// Fetch a single agent by ID.
pub async fn get_agent<'e>(ex: impl PgExecutor<'e>, id: Uuid) -> Result<Option<Agent>> {
    let agent = sqlx::query_as::<_, Agent>("SELECT * FROM agents WHERE id = $1")
        .bind(id)
        .fetch_optional(ex)
        .await
        .context("failed to fetch agent")?;

    Ok(agent)
}

/// Fetch a single agent by its unique name.
pub async fn get_agent_by_name(pool: &PgPool, name: &str) -> Result<Option<Agent>> {
    let agent = sqlx::query_as::<_, Agent>("SELECT * FROM agents WHERE name = $1")
        .bind(name)
        .fetch_optional(pool)
        .await
        .context("failed to fetch agent by name")?;

    Ok(agent)
}

/// List all agents, ordered by name.
pub async fn list_agents(pool: &PgPool) -> Result<Vec<Agent>> {
    let agents = sqlx::query_as::<_, Agent>("SELECT * FROM agents ORDER BY name")
        .fetch_all(pool)
        .await
        .context("failed to list agents")?;

    Ok(agents)
}

/// Partial update of a registration.
#[derive(Debug, Clone, Default)]
pub struct AgentUpdate {
    pub capabilities: Option<Vec<String>>,
    pub capacity: Option<i32>,
    pub tags: Option<Vec<String>>,
    pub health_score: Option<f64>,
    pub attributes: Option<serde_json::Value>,
}

/// Apply a partial update; absent fields keep their current values.
pub async fn update_agent<'e>(
    ex: impl PgExecutor<'e>,
    id: Uuid,
    update: &AgentUpdate,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE agents \
         SET capabilities = COALESCE($1, capabilities), \
             capacity = COALESCE($2, capacity), \
             tags = COALESCE($3, tags), \
             health_score = COALESCE($4, health_score), \
             attributes = COALESCE($5, attributes) \
         WHERE id = $6",
    )
    .bind(&update.capabilities)
    .bind(update.capacity)
    .bind(&update.tags)
    .bind(update.health_score)
    .bind(&update.attributes)
    .bind(id)
    .execute(ex)
    .await
    .context("failed to update agent")?;

    Ok(result.rows_affected())
}

/// Remove an agent registration.
pub async fn delete_agent<'e>(ex: impl PgExecutor<'e>, id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM agents WHERE id = $1")
        .bind(id)
        .execute(ex)
        .await
        .context("failed to delete agent")?;

    Ok(result.rows_affected())
}

/// Record a heartbeat: refreshes the timestamp, merges any reported
/// metadata into the attributes document, and revives `unreachable`
/// agents. Idempotent.
pub async fn heartbeat<'e>(
    ex: impl PgExecutor<'e>,
    id: Uuid,
    metadata: Option<&serde_json::Value>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE agents \
         SET last_heartbeat = now(), \
             attributes = attributes || COALESCE($1, '{}'::jsonb), \
             status = CASE WHEN status = 'unreachable' THEN 'idle' ELSE status END \
         WHERE id = $2",
    )
    .bind(metadata)
    .bind(id)
    .execute(ex)
    .await
    .context("failed to record heartbeat")?;

    Ok(result.rows_affected())
}

/// Set an agent's status.
pub async fn set_status<'e>(ex: impl PgExecutor<'e>, id: Uuid, status: AgentStatus) -> Result<u64> {
    let result = sqlx::query("UPDATE agents SET status = $1 WHERE id = $2")
        .bind(status)
        .bind(id)
        .execute(ex)
        .await
        .context("failed to set agent status")?;

    Ok(result.rows_affected())
}

/// Agents that should be heartbeating but have gone silent past the
/// cutoff.
pub async fn stale_agents(pool: &PgPool, cutoff: DateTime<Utc>) -> Result<Vec<Agent>> {
    let agents = sqlx::query_as::<_, Agent>(
        "SELECT * FROM agents \
         WHERE status IN ('idle', 'busy') AND last_heartbeat < $1",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await
    .context("failed to find stale agents")?;

    Ok(agents)
}

/// Dispatchable agents that hold every required capability, optionally
/// filtered by tag overlap, with fresh heartbeats and spare capacity.
///
/// Scoring and final ordering happen in the registry; this query only
/// prefilters.
pub async fn candidates(
    pool: &PgPool,
    required_capabilities: &[String],
    tags: Option<&[String]>,
    min_health: f64,
    heartbeat_cutoff: DateTime<Utc>,
) -> Result<Vec<Agent>> {
    let agents = sqlx::query_as::<_, Agent>(
        "SELECT * FROM agents \
         WHERE status IN ('idle', 'busy') \
           AND current_load < capacity \
           AND health_score >= $1 \
           AND last_heartbeat >= $2 \
           AND capabilities @> $3 \
           AND ($4::text[] IS NULL OR tags && $4)",
    )
    .bind(min_health)
    .bind(heartbeat_cutoff)
    .bind(required_capabilities)
    .bind(tags)
    .fetch_all(pool)
    .await
    .context("failed to find candidate agents")?;

    Ok(agents)
}

/// Reserve one unit of capacity on an agent (`current_load + 1`).
///
/// Optimistic: only applies while the agent is dispatchable with spare
/// capacity, so load can never exceed capacity. Marks the agent `busy`.
pub async fn increment_load<'e>(ex: impl PgExecutor<'e>, id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE agents \
         SET current_load = current_load + 1, status = 'busy' \
         WHERE id = $1 AND status IN ('idle', 'busy') AND current_load < capacity",
    )
    .bind(id)
    .execute(ex)
    .await
    .context("failed to increment agent load")?;

    Ok(result.rows_affected())
}

/// Release one unit of capacity. Agents that drop to zero load return to
/// `idle` (unless they are unreachable or disabled).
pub async fn decrement_load<'e>(ex: impl PgExecutor<'e>, id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE agents \
         SET current_load = GREATEST(current_load - 1, 0), \
             status = CASE \
                 WHEN status = 'busy' AND current_load <= 1 THEN 'idle' \
                 ELSE status \
             END \
         WHERE id = $1",
    )
    .bind(id)
    .execute(ex)
    .await
    .context("failed to decrement agent load")?;

    Ok(result.rows_affected())
}
