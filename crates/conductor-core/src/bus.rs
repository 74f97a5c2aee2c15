//! In-process publish/subscribe event bus.
//!
//! Every published event is appended to the `events` table first (the
//! audit/replay log), then fanned out to in-process subscribers over a
//! lag-tolerant broadcast channel. Delivery is best-effort within the
//! process; subscribers must be idempotent. Ordering is preserved per
//! entity by the log's sequence column, not globally.

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use sqlx::PgPool;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use conductor_db::models::EventRow;
use conductor_db::queries::events::{self, NewEvent};

/// Stable wire names for every event the engine emits.
pub mod topics {
    pub const TICKET_CREATED: &str = "ticket.created";
    pub const TICKET_PHASE_TRANSITIONED: &str = "ticket.phase_transitioned";
    pub const TICKET_BLOCKED: &str = "ticket.blocked";
    pub const TICKET_DONE: &str = "ticket.done";
    pub const TASK_CREATED: &str = "task.created";
    pub const TASK_READY: &str = "task.ready";
    pub const TASK_ASSIGNED: &str = "task.assigned";
    pub const TASK_STARTED: &str = "task.started";
    pub const TASK_COMPLETED: &str = "task.completed";
    pub const TASK_FAILED_TRANSIENT: &str = "task.failed.transient";
    pub const TASK_FAILED_PERMANENT: &str = "task.failed.permanent";
    pub const TASK_CANCELLED: &str = "task.cancelled";
    pub const TASK_TIMED_OUT: &str = "task.timed_out";
    pub const TASK_SPAWNED_FROM_DISCOVERY: &str = "task.spawned_from_discovery";
    pub const AGENT_REGISTERED: &str = "agent.registered";
    pub const AGENT_HEARTBEAT: &str = "agent.heartbeat";
    pub const AGENT_STALE_DETECTED: &str = "agent.stale.detected";
    pub const LOCK_ACQUIRED: &str = "lock.acquired";
    pub const LOCK_RELEASED: &str = "lock.released";
    pub const LOCK_WAIT_TIME: &str = "lock.wait_time";
    pub const DISCOVERY_RECORDED: &str = "discovery.recorded";
    pub const GUARDIAN_INTERVENTION_ISSUED: &str = "guardian.intervention.issued";
    pub const WORKFLOW_STUCK_DETECTED: &str = "workflow.stuck.detected";
    pub const SYSTEM_INCOHERENCE_DETECTED: &str = "system.incoherence.detected";
}

/// Match an event type against a subscription pattern.
///
/// Supported forms: `"*"` (everything), a trailing-wildcard prefix like
/// `"task.*"`, or an exact name.
fn matches_pattern(pattern: &str, event_type: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) => event_type.starts_with(prefix),
        None => pattern == event_type,
    }
}

/// The in-process event bus.
///
/// Cheap to clone; all clones share one broadcast channel and pool.
#[derive(Clone)]
pub struct EventBus {
    pool: PgPool,
    tx: Arc<broadcast::Sender<EventRow>>,
}

impl EventBus {
    /// Create a bus with the given broadcast ring-buffer capacity.
    pub fn new(pool: PgPool, capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self {
            pool,
            tx: Arc::new(tx),
        }
    }

    /// Persist an event to the log, then broadcast it to subscribers.
    ///
    /// The returned row carries the server-assigned id, sequence number,
    /// and timestamp. Broadcast lag is tolerated: slow subscribers miss
    /// events rather than blocking the publisher.
    pub async fn publish(&self, new: NewEvent) -> Result<EventRow> {
        let row = events::insert_event(&self.pool, &new).await?;
        let _ = self.tx.send(row.clone());
        Ok(row)
    }

    /// Convenience wrapper around [`EventBus::publish`] without an actor.
    pub async fn emit(
        &self,
        event_type: &str,
        entity_type: &str,
        entity_id: impl ToString,
        payload: serde_json::Value,
    ) -> Result<EventRow> {
        self.publish(NewEvent {
            event_type: event_type.to_owned(),
            entity_type: entity_type.to_owned(),
            entity_id: entity_id.to_string(),
            payload,
            actor: None,
        })
        .await
    }

    /// Like [`EventBus::emit`] but attributed to an actor.
    pub async fn emit_by(
        &self,
        event_type: &str,
        entity_type: &str,
        entity_id: impl ToString,
        payload: serde_json::Value,
        actor: &str,
    ) -> Result<EventRow> {
        self.publish(NewEvent {
            event_type: event_type.to_owned(),
            entity_type: entity_type.to_owned(),
            entity_id: entity_id.to_string(),
            payload,
            actor: Some(actor.to_owned()),
        })
        .await
    }

    /// Subscribe to events whose type matches `pattern`.
    pub fn subscribe(&self, pattern: &str) -> EventSubscription {
        EventSubscription {
            pattern: pattern.to_owned(),
            stream: BroadcastStream::new(self.tx.subscribe()),
        }
    }

    /// Spawn a consumer task that invokes `handler` for every matching
    /// event. Handler errors are logged and never propagate to other
    /// handlers or the publisher.
    pub fn subscribe_handler<F, Fut>(&self, pattern: &str, handler: F) -> JoinHandle<()>
    where
        F: Fn(EventRow) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let mut sub = self.subscribe(pattern);
        let pattern = pattern.to_owned();
        tokio::spawn(async move {
            while let Some(event) = sub.next().await {
                let event_type = event.event_type.clone();
                if let Err(e) = handler(event).await {
                    tracing::warn!(
                        pattern = %pattern,
                        event_type = %event_type,
                        error = %e,
                        "event handler failed"
                    );
                }
            }
        })
    }

    /// Events for one entity since a timestamp, from the persistent log.
    pub async fn recent(&self, entity_id: &str, since: DateTime<Utc>) -> Result<Vec<EventRow>> {
        events::recent_for_entity(&self.pool, entity_id, since).await
    }

    /// Number of live in-process subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// A filtered live event stream.
pub struct EventSubscription {
    pattern: String,
    stream: BroadcastStream<EventRow>,
}

impl EventSubscription {
    /// Next matching event, or `None` once the bus is dropped.
    ///
    /// Lagged gaps are skipped silently; subscribers that care about
    /// completeness must read the persistent log instead.
    pub async fn next(&mut self) -> Option<EventRow> {
        loop {
            match self.stream.next().await {
                Some(Ok(event)) => {
                    if matches_pattern(&self.pattern, &event.event_type) {
                        return Some(event);
                    }
                }
                Some(Err(BroadcastStreamRecvError::Lagged(missed))) => {
                    tracing::debug!(pattern = %self.pattern, missed, "subscriber lagged");
                }
                None => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_matches_everything() {
        assert!(matches_pattern("*", "task.completed"));
        assert!(matches_pattern("*", "agent.heartbeat"));
    }

    #[test]
    fn prefix_pattern_matches_family() {
        assert!(matches_pattern("task.*", "task.completed"));
        assert!(matches_pattern("task.*", "task.failed.transient"));
        assert!(!matches_pattern("task.*", "ticket.created"));
    }

    #[test]
    fn exact_pattern_matches_only_itself() {
        assert!(matches_pattern("lock.acquired", "lock.acquired"));
        assert!(!matches_pattern("lock.acquired", "lock.released"));
    }

    #[test]
    fn nested_prefix_pattern() {
        assert!(matches_pattern("task.failed.*", "task.failed.transient"));
        assert!(!matches_pattern("task.failed.*", "task.completed"));
    }
}
