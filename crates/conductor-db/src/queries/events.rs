//! Database query functions for the append-only `events` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgExecutor, PgPool};

use crate::models::EventRow;

/// Fields for a new event log entry.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub payload: serde_json::Value,
    pub actor: Option<String>,
}

/// Append an event to the log. Returns the stored row (id, seq,
/// timestamp are server-generated).
pub async fn insert_event<'e>(ex: impl PgExecutor<'e>, new: &NewEvent) -> Result<EventRow> {
    let event = sqlx::query_as::<_, EventRow>(
        "INSERT INTO events (event_type, entity_type, entity_id, payload, actor) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(&new.event_type)
    .bind(&new.entity_type)
    .bind(&new.entity_id)
    .bind(&new.payload)
    .bind(&new.actor)
    .fetch_one(ex)
    .await
    .context("failed to insert event")?;

    Ok(event)
}

/// Events for one entity since a timestamp, in append order.
pub async fn recent_for_entity(
    pool: &PgPool,
    entity_id: &str,
    since: DateTime<Utc>,
) -> Result<Vec<EventRow>> {
    let events = sqlx::query_as::<_, EventRow>(
        "SELECT * FROM events \
         WHERE entity_id = $1 AND recorded_at >= $2 \
         ORDER BY seq ASC",
    )
    .bind(entity_id)
    .bind(since)
    .fetch_all(pool)
    .await
    .context("failed to fetch recent events for entity")?;

    Ok(events)
}

/// The newest `limit` events for one entity, oldest first.
pub async fn latest_for_entity(
    pool: &PgPool,
    entity_id: &str,
    limit: i64,
) -> Result<Vec<EventRow>> {
    let events = sqlx::query_as::<_, EventRow>(
        "SELECT * FROM ( \
             SELECT * FROM events WHERE entity_id = $1 ORDER BY seq DESC LIMIT $2 \
         ) sub ORDER BY seq ASC",
    )
    .bind(entity_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to fetch latest events for entity")?;

    Ok(events)
}

/// Events of one type recorded since a timestamp, in append order.
pub async fn of_type_since(
    pool: &PgPool,
    event_type: &str,
    since: DateTime<Utc>,
) -> Result<Vec<EventRow>> {
    let events = sqlx::query_as::<_, EventRow>(
        "SELECT * FROM events \
         WHERE event_type = $1 AND recorded_at >= $2 \
         ORDER BY seq ASC",
    )
    .bind(event_type)
    .bind(since)
    .fetch_all(pool)
    .await
    .context("failed to fetch events by type")?;

    Ok(events)
}
