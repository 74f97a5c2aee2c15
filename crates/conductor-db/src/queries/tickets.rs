//! Database query functions for the `tickets` table.

use anyhow::{Context, Result};
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

use crate::models::{Priority, Ticket, TicketStatus};

/// Fields for a new ticket row.
#[derive(Debug, Clone)]
pub struct NewTicket {
    pub title: String,
    pub description: String,
    pub owner: String,
    pub current_phase: String,
    pub priority: Priority,
}

/// Insert a new ticket. Returns the inserted row with server-generated
/// defaults (id, status, timestamps).
pub async fn insert_ticket<'e>(ex: impl PgExecutor<'e>, new: &NewTicket) -> Result<Ticket> {
    let ticket = sqlx::query_as::<_, Ticket>(
        "INSERT INTO tickets (title, description, owner, current_phase, priority) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(&new.title)
    .bind(&new.description)
    .bind(&new.owner)
    .bind(&new.current_phase)
    .bind(new.priority)
    .fetch_one(ex)
    .await
    .context("failed to insert ticket")?;

    Ok(ticket)
}

/// Fetch a single ticket by ID.
pub async fn get_ticket<'e>(ex: impl PgExecutor<'e>, id: Uuid) -> Result<Option<Ticket>> {
    let ticket = sqlx::query_as::<_, Ticket>("SELECT * FROM tickets WHERE id = $1")
        .bind(id)
        .fetch_optional(ex)
        .await
        .context("failed to fetch ticket")?;

    Ok(ticket)
}

/// Fetch a ticket by ID with a `FOR UPDATE` row lock, serializing
/// concurrent phase transitions on the same ticket.
pub async fn get_ticket_for_update<'e>(
    ex: impl PgExecutor<'e>,
    id: Uuid,
) -> Result<Option<Ticket>> {
    let ticket = sqlx::query_as::<_, Ticket>("SELECT * FROM tickets WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(ex)
        .await
        .context("failed to fetch ticket for update")?;

    Ok(ticket)
}

/// List tickets, optionally filtered by status, newest first.
pub async fn list_tickets(pool: &PgPool, status: Option<TicketStatus>) -> Result<Vec<Ticket>> {
    let tickets = match status {
        Some(status) => {
            sqlx::query_as::<_, Ticket>(
                "SELECT * FROM tickets WHERE status = $1 ORDER BY created_at DESC",
            )
            .bind(status)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, Ticket>("SELECT * FROM tickets ORDER BY created_at DESC")
                .fetch_all(pool)
                .await
        }
    }
    .context("failed to list tickets")?;

    Ok(tickets)
}

/// Atomically move a ticket to a new phase.
///
/// Optimistic: the UPDATE only applies while `current_phase` still equals
/// `from_phase`. Returns the number of rows affected (0 means a concurrent
/// transition won).
pub async fn update_phase<'e>(
    ex: impl PgExecutor<'e>,
    id: Uuid,
    from_phase: &str,
    to_phase: &str,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tickets \
         SET previous_phase = current_phase, current_phase = $1, updated_at = now() \
         WHERE id = $2 AND current_phase = $3",
    )
    .bind(to_phase)
    .bind(id)
    .bind(from_phase)
    .execute(ex)
    .await
    .context("failed to update ticket phase")?;

    Ok(result.rows_affected())
}

/// Set a ticket's status.
pub async fn set_status<'e>(
    ex: impl PgExecutor<'e>,
    id: Uuid,
    status: TicketStatus,
) -> Result<u64> {
    let result = sqlx::query("UPDATE tickets SET status = $1, updated_at = now() WHERE id = $2")
        .bind(status)
        .bind(id)
        .execute(ex)
        .await
        .context("failed to set ticket status")?;

    Ok(result.rows_affected())
}

/// Move a ticket to `blocked`, recording the reasons.
pub async fn set_blocked<'e>(
    ex: impl PgExecutor<'e>,
    id: Uuid,
    reasons: &serde_json::Value,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tickets \
         SET status = 'blocked', blocking_reasons = $1, updated_at = now() \
         WHERE id = $2",
    )
    .bind(reasons)
    .bind(id)
    .execute(ex)
    .await
    .context("failed to block ticket")?;

    Ok(result.rows_affected())
}

/// Return a blocked ticket to `active`, clearing its blocking reasons.
pub async fn set_active<'e>(ex: impl PgExecutor<'e>, id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tickets \
         SET status = 'active', blocking_reasons = '[]'::jsonb, updated_at = now() \
         WHERE id = $1 AND status = 'blocked'",
    )
    .bind(id)
    .execute(ex)
    .await
    .context("failed to unblock ticket")?;

    Ok(result.rows_affected())
}

/// Merge a document into the ticket's accumulated context and replace the
/// bounded summary.
pub async fn merge_context<'e>(
    ex: impl PgExecutor<'e>,
    id: Uuid,
    patch: &serde_json::Value,
    summary: &str,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tickets \
         SET context = context || $1, context_summary = $2, updated_at = now() \
         WHERE id = $3",
    )
    .bind(patch)
    .bind(summary)
    .bind(id)
    .execute(ex)
    .await
    .context("failed to merge ticket context")?;

    Ok(result.rows_affected())
}

/// Ticket counts per status, for health summaries.
pub async fn count_by_status(pool: &PgPool) -> Result<Vec<(String, i64)>> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status::text, COUNT(*) FROM tickets GROUP BY status ORDER BY status",
    )
    .fetch_all(pool)
    .await
    .context("failed to count tickets by status")?;

    Ok(rows)
}
