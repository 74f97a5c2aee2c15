//! Resource-lock coordinator: named leases with retry/backoff, TTL
//! expiry, and monotonic versioning.
//!
//! Acquisition runs in a serializable transaction: evict expired leases
//! for the key, check compatibility (exclusive excludes everything,
//! shared coexists with shared), insert. Incompatibility rolls back and
//! retries with exponential backoff plus jitter. A holder crash is
//! resolved by TTL expiry during the next acquisition attempt or the
//! periodic expiry sweep.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use sqlx::PgPool;
use tokio::time::Duration;
use uuid::Uuid;

use conductor_db::models::{LockType, ResourceLock};
use conductor_db::queries::locks as db;

use crate::bus::{EventBus, topics};
use crate::config::LockConfig;
use crate::error::{EngineError, EngineResult};

/// Proof of a held lease. Needed to release or extend it; the version
/// check prevents releasing a lease that expired and was re-granted.
#[derive(Debug, Clone)]
pub struct LockHandle {
    pub resource_key: String,
    pub task_id: Uuid,
    pub agent_id: Uuid,
    pub lock_type: LockType,
    pub version: i64,
    pub expires_at: DateTime<Utc>,
}

impl From<ResourceLock> for LockHandle {
    fn from(lock: ResourceLock) -> Self {
        Self {
            resource_key: lock.resource_key,
            task_id: lock.holder_task,
            agent_id: lock.holder_agent,
            lock_type: lock.lock_type,
            version: lock.version,
            expires_at: lock.expires_at,
        }
    }
}

/// Result of an acquisition attempt sequence. Unavailability is an
/// expected outcome, not an error; the caller decides whether to requeue
/// or fail the parent task.
#[derive(Debug)]
pub enum AcquireOutcome {
    Acquired(LockHandle),
    Unavailable { attempts: u32, waited_ms: u64 },
}

impl AcquireOutcome {
    /// The handle, if acquisition succeeded.
    pub fn handle(self) -> Option<LockHandle> {
        match self {
            Self::Acquired(handle) => Some(handle),
            Self::Unavailable { .. } => None,
        }
    }
}

/// Exponential backoff before retry `attempt` (0-based), without jitter.
fn backoff_ms(base_ms: u64, attempt: u32) -> u64 {
    base_ms.saturating_mul(1u64 << attempt.min(16))
}

/// Whether an active lease set admits a new lock of `requested` type.
fn compatible(active: &[ResourceLock], requested: LockType) -> bool {
    match requested {
        LockType::Exclusive => active.is_empty(),
        LockType::Shared => active.iter().all(|l| l.lock_type == LockType::Shared),
    }
}

/// Coordinates mutual exclusion over opaque resource keys.
#[derive(Clone)]
pub struct LockCoordinator {
    pool: PgPool,
    bus: EventBus,
    config: LockConfig,
}

impl LockCoordinator {
    pub fn new(pool: PgPool, bus: EventBus, config: LockConfig) -> Self {
        Self { pool, bus, config }
    }

    /// Acquire a lease on `key` for a (task, agent) pair.
    ///
    /// Retries with `base_backoff × 2^attempt + jitter` up to the
    /// configured retry budget, then reports
    /// [`AcquireOutcome::Unavailable`]. Emits `lock.wait_time` telemetry
    /// for every attempt sequence, successful or abandoned.
    pub async fn acquire(
        &self,
        key: &str,
        task_id: Uuid,
        agent_id: Uuid,
        lock_type: LockType,
        ttl_seconds: Option<i64>,
    ) -> EngineResult<AcquireOutcome> {
        let ttl = ttl_seconds.unwrap_or(self.config.default_ttl_seconds);
        if ttl <= 0 {
            return Err(EngineError::InvalidInput(format!(
                "lock ttl must be positive, got {ttl}"
            )));
        }

        let mut waited_ms: u64 = 0;
        let max_attempts = self.config.max_retries + 1;

        for attempt in 0..max_attempts {
            match self
                .try_acquire_once(key, task_id, agent_id, lock_type, ttl)
                .await?
            {
                Some(lock) => {
                    let handle = LockHandle::from(lock);
                    self.emit_wait_time(key, attempt + 1, waited_ms, true).await;
                    let _ = self
                        .bus
                        .emit(
                            topics::LOCK_ACQUIRED,
                            "resource",
                            key,
                            serde_json::json!({
                                "task_id": task_id,
                                "agent_id": agent_id,
                                "lock_type": lock_type,
                                "version": handle.version,
                                "expires_at": handle.expires_at,
                            }),
                        )
                        .await;
                    return Ok(AcquireOutcome::Acquired(handle));
                }
                None if attempt + 1 < max_attempts => {
                    let base = backoff_ms(self.config.base_backoff_ms, attempt);
                    let jitter = rand::rng().random_range(0..=self.config.base_backoff_ms.max(1));
                    let sleep_ms = base + jitter;
                    waited_ms += sleep_ms;
                    tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
                }
                None => {}
            }
        }

        self.emit_wait_time(key, max_attempts, waited_ms, false).await;
        Ok(AcquireOutcome::Unavailable {
            attempts: max_attempts,
            waited_ms,
        })
    }

    /// One serializable acquisition attempt. Returns `None` when the key
    /// is held incompatibly (or the transaction lost a serialization
    /// race, which is the same thing for the caller).
    async fn try_acquire_once(
        &self,
        key: &str,
        task_id: Uuid,
        agent_id: Uuid,
        lock_type: LockType,
        ttl: i64,
    ) -> Result<Option<ResourceLock>, EngineError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin lock transaction")?;

        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await
            .context("failed to set transaction isolation")?;

        db::evict_expired_for_key(&mut *tx, key).await?;
        let active = db::active_locks(&mut *tx, key).await?;

        if !compatible(&active, lock_type) {
            tx.rollback()
                .await
                .context("failed to roll back lock transaction")?;
            return Ok(None);
        }

        let lock = match db::insert_lock(&mut *tx, key, task_id, agent_id, lock_type, ttl).await {
            Ok(lock) => lock,
            Err(e) if is_serialization_failure(&e) => {
                // Lost the race against a concurrent acquirer; retry.
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        match tx.commit().await {
            Ok(()) => Ok(Some(lock)),
            Err(e) if is_sqlx_serialization_failure(&e) => Ok(None),
            Err(e) => Err(EngineError::Internal(
                anyhow::Error::new(e).context("failed to commit lock transaction"),
            )),
        }
    }

    /// Release a held lease. Fails with `conflict` if the (key, task,
    /// version) triple no longer matches, meaning the lease expired and
    /// was reclaimed.
    pub async fn release(&self, handle: &LockHandle) -> EngineResult<()> {
        let rows = db::release(
            &self.pool,
            &handle.resource_key,
            handle.task_id,
            handle.version,
        )
        .await?;

        if rows == 0 {
            return Err(EngineError::Conflict(format!(
                "lock on {} version {} no longer held by task {}",
                handle.resource_key, handle.version, handle.task_id
            )));
        }

        let _ = self
            .bus
            .emit(
                topics::LOCK_RELEASED,
                "resource",
                &handle.resource_key,
                serde_json::json!({
                    "task_id": handle.task_id,
                    "version": handle.version,
                    "reason": "released",
                }),
            )
            .await;
        Ok(())
    }

    /// Extend a lease's TTL, only while the holder still matches.
    pub async fn extend(&self, handle: &LockHandle, ttl_seconds: i64) -> EngineResult<()> {
        let rows = db::extend(
            &self.pool,
            &handle.resource_key,
            handle.task_id,
            handle.version,
            ttl_seconds,
        )
        .await?;

        if rows == 0 {
            return Err(EngineError::Conflict(format!(
                "cannot extend lock on {}: lease version {} expired or reclaimed",
                handle.resource_key, handle.version
            )));
        }
        Ok(())
    }

    /// Release every lease held by a task (completion/cancellation
    /// cleanup). Emits one `lock.released` per lease.
    pub async fn release_all_for_task(&self, task_id: Uuid) -> EngineResult<usize> {
        let released = db::release_all_for_task(&self.pool, task_id).await?;
        for lock in &released {
            let _ = self
                .bus
                .emit(
                    topics::LOCK_RELEASED,
                    "resource",
                    &lock.resource_key,
                    serde_json::json!({
                        "task_id": task_id,
                        "version": lock.version,
                        "reason": "holder_finished",
                    }),
                )
                .await;
        }
        Ok(released.len())
    }

    /// Reclaim every expired lease. Run periodically by the engine.
    pub async fn expiry_sweep(&self) -> EngineResult<usize> {
        let reclaimed = db::evict_all_expired(&self.pool).await?;
        for lock in &reclaimed {
            tracing::info!(
                resource_key = %lock.resource_key,
                holder_task = %lock.holder_task,
                version = lock.version,
                "reclaimed expired lock"
            );
            let _ = self
                .bus
                .emit(
                    topics::LOCK_RELEASED,
                    "resource",
                    &lock.resource_key,
                    serde_json::json!({
                        "task_id": lock.holder_task,
                        "version": lock.version,
                        "reason": "expired",
                    }),
                )
                .await;
        }
        Ok(reclaimed.len())
    }

    async fn emit_wait_time(&self, key: &str, attempts: u32, waited_ms: u64, acquired: bool) {
        let _ = self
            .bus
            .emit(
                topics::LOCK_WAIT_TIME,
                "resource",
                key,
                serde_json::json!({
                    "attempts": attempts,
                    "waited_ms": waited_ms,
                    "acquired": acquired,
                }),
            )
            .await;
    }
}

/// Serialization failures (SQLSTATE 40001) are retryable conflicts, not
/// errors.
fn is_serialization_failure(err: &anyhow::Error) -> bool {
    err.downcast_ref::<sqlx::Error>()
        .is_some_and(is_sqlx_serialization_failure)
}

fn is_sqlx_serialization_failure(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == "40001")
}
