//! Database query functions for the `task_discoveries` table.

use anyhow::{Context, Result};
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

use crate::models::{DiscoveryResolution, DiscoveryType, TaskDiscovery};

/// Fields for a new discovery record.
#[derive(Debug, Clone)]
pub struct NewDiscovery {
    pub source_task: Uuid,
    pub discovery_type: DiscoveryType,
    pub description: String,
    pub spawned_task: Option<Uuid>,
    pub spawned_phase: Option<String>,
    pub priority_boost: bool,
}

/// Persist a discovery row.
pub async fn insert_discovery<'e>(
    ex: impl PgExecutor<'e>,
    new: &NewDiscovery,
) -> Result<TaskDiscovery> {
    let discovery = sqlx::query_as::<_, TaskDiscovery>(
        "INSERT INTO task_discoveries \
             (source_task, discovery_type, description, spawned_task, spawned_phase, priority_boost) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         RETURNING *",
    )
    .bind(new.source_task)
    .bind(new.discovery_type)
    .bind(&new.description)
    .bind(new.spawned_task)
    .bind(&new.spawned_phase)
    .bind(new.priority_boost)
    .fetch_one(ex)
    .await
    .context("failed to insert discovery")?;

    Ok(discovery)
}

/// Fetch a single discovery by ID.
pub async fn get_discovery(pool: &PgPool, id: Uuid) -> Result<Option<TaskDiscovery>> {
    let discovery = sqlx::query_as::<_, TaskDiscovery>(
        "SELECT * FROM task_discoveries WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch discovery")?;

    Ok(discovery)
}

/// All discoveries whose source task belongs to a ticket.
pub async fn for_ticket(pool: &PgPool, ticket_id: Uuid) -> Result<Vec<TaskDiscovery>> {
    let discoveries = sqlx::query_as::<_, TaskDiscovery>(
        "SELECT d.* FROM task_discoveries d \
         JOIN tasks t ON t.id = d.source_task \
         WHERE t.ticket_id = $1 \
         ORDER BY d.recorded_at ASC",
    )
    .bind(ticket_id)
    .fetch_all(pool)
    .await
    .context("failed to fetch discoveries for ticket")?;

    Ok(discoveries)
}

/// Open discoveries of one type for a ticket. Used to guard against
/// repeated recovery spawns.
pub async fn open_of_type_for_ticket(
    pool: &PgPool,
    ticket_id: Uuid,
    discovery_type: DiscoveryType,
) -> Result<Vec<TaskDiscovery>> {
    let discoveries = sqlx::query_as::<_, TaskDiscovery>(
        "SELECT d.* FROM task_discoveries d \
         JOIN tasks t ON t.id = d.source_task \
         WHERE t.ticket_id = $1 AND d.discovery_type = $2 AND d.resolution = 'open'",
    )
    .bind(ticket_id)
    .bind(discovery_type)
    .fetch_all(pool)
    .await
    .context("failed to fetch open discoveries")?;

    Ok(discoveries)
}

/// Update a discovery's resolution status.
pub async fn resolve<'e>(
    ex: impl PgExecutor<'e>,
    id: Uuid,
    resolution: DiscoveryResolution,
) -> Result<u64> {
    let result = sqlx::query("UPDATE task_discoveries SET resolution = $1 WHERE id = $2")
        .bind(resolution)
        .bind(id)
        .execute(ex)
        .await
        .context("failed to resolve discovery")?;

    Ok(result.rows_affected())
}

/// Discoveries whose spawned task just completed and are still open.
pub async fn open_with_spawned_task(pool: &PgPool, spawned_task: Uuid) -> Result<Vec<TaskDiscovery>> {
    let discoveries = sqlx::query_as::<_, TaskDiscovery>(
        "SELECT * FROM task_discoveries \
         WHERE spawned_task = $1 AND resolution = 'open'",
    )
    .bind(spawned_task)
    .fetch_all(pool)
    .await
    .context("failed to fetch discoveries by spawned task")?;

    Ok(discoveries)
}
