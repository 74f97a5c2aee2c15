//! Database query functions for the `resource_locks` table.
//!
//! All writes within an acquisition run inside the coordinator's
//! serializable transaction; the functions here are executor-generic for
//! that reason.

use anyhow::{Context, Result};
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

use crate::models::{LockType, ResourceLock};

/// Active (unexpired) locks for a resource key.
pub async fn active_locks<'e>(ex: impl PgExecutor<'e>, key: &str) -> Result<Vec<ResourceLock>> {
    let locks = sqlx::query_as::<_, ResourceLock>(
        "SELECT * FROM resource_locks \
         WHERE resource_key = $1 AND expires_at > now()",
    )
    .bind(key)
    .fetch_all(ex)
    .await
    .context("failed to fetch active locks")?;

    Ok(locks)
}

/// Delete expired locks for one key. Returns rows removed.
pub async fn evict_expired_for_key<'e>(ex: impl PgExecutor<'e>, key: &str) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM resource_locks WHERE resource_key = $1 AND expires_at <= now()",
    )
    .bind(key)
    .execute(ex)
    .await
    .context("failed to evict expired locks for key")?;

    Ok(result.rows_affected())
}

/// Delete every expired lock. Returns the reclaimed rows so the sweep can
/// publish a release event per lease.
pub async fn evict_all_expired(pool: &PgPool) -> Result<Vec<ResourceLock>> {
    let locks = sqlx::query_as::<_, ResourceLock>(
        "DELETE FROM resource_locks WHERE expires_at <= now() RETURNING *",
    )
    .fetch_all(pool)
    .await
    .context("failed to evict expired locks")?;

    Ok(locks)
}

/// Insert a lease with a fresh monotonic version and TTL-relative expiry.
pub async fn insert_lock<'e>(
    ex: impl PgExecutor<'e>,
    key: &str,
    task_id: Uuid,
    agent_id: Uuid,
    lock_type: LockType,
    ttl_seconds: i64,
) -> Result<ResourceLock> {
    let lock = sqlx::query_as::<_, ResourceLock>(
        "INSERT INTO resource_locks (resource_key, holder_task, holder_agent, lock_type, expires_at) \
         VALUES ($1, $2, $3, $4, now() + make_interval(secs => $5)) \
         RETURNING *",
    )
    .bind(key)
    .bind(task_id)
    .bind(agent_id)
    .bind(lock_type)
    .bind(ttl_seconds as f64)
    .fetch_one(ex)
    .await
    .context("failed to insert lock")?;

    Ok(lock)
}

/// Release a lease. The (key, task, version) triple must match, so a
/// holder cannot accidentally release a lease that was reclaimed and
/// re-granted to someone else.
pub async fn release<'e>(
    ex: impl PgExecutor<'e>,
    key: &str,
    task_id: Uuid,
    version: i64,
) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM resource_locks \
         WHERE resource_key = $1 AND holder_task = $2 AND version = $3",
    )
    .bind(key)
    .bind(task_id)
    .bind(version)
    .execute(ex)
    .await
    .context("failed to release lock")?;

    Ok(result.rows_affected())
}

/// Extend a lease's expiry, only while the holder still matches.
pub async fn extend<'e>(
    ex: impl PgExecutor<'e>,
    key: &str,
    task_id: Uuid,
    version: i64,
    ttl_seconds: i64,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE resource_locks \
         SET expires_at = now() + make_interval(secs => $1) \
         WHERE resource_key = $2 AND holder_task = $3 AND version = $4 \
           AND expires_at > now()",
    )
    .bind(ttl_seconds as f64)
    .bind(key)
    .bind(task_id)
    .bind(version)
    .execute(ex)
    .await
    .context("failed to extend lock")?;

    Ok(result.rows_affected())
}

/// Release every lease held by a task. Returns the released rows.
pub async fn release_all_for_task<'e>(
    ex: impl PgExecutor<'e>,
    task_id: Uuid,
) -> Result<Vec<ResourceLock>> {
    let locks = sqlx::query_as::<_, ResourceLock>(
        "DELETE FROM resource_locks WHERE holder_task = $1 RETURNING *",
    )
    .bind(task_id)
    .fetch_all(ex)
    .await
    .context("failed to release locks for task")?;

    Ok(locks)
}

/// Number of active leases, for health summaries.
pub async fn count_active(pool: &PgPool) -> Result<i64> {
    let row: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM resource_locks WHERE expires_at > now()")
            .fetch_one(pool)
            .await
            .context("failed to count active locks")?;

    Ok(row.0)
}
