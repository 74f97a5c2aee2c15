//! Phase state machine: drives tickets through the workflow graph with
//! gated transitions, context accumulation, append-only history, and
//! template materialization.
//!
//! A transition is one database transaction: edge validation, gate
//! evaluation, context aggregation, history append, phase swap, and task
//! materialization either all commit or all roll back. Events are
//! published after commit.

pub mod gate;
pub mod templates;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use conductor_db::models::{PhaseHistoryEntry, Priority, Task, Ticket, TicketStatus};
use conductor_db::queries::phases as phase_db;
use conductor_db::queries::phases::{NewArtifact, NewPhaseHistory};
use conductor_db::queries::tasks as task_db;
use conductor_db::queries::tasks::NewTask;
use conductor_db::queries::tickets as ticket_db;
use conductor_db::queries::tickets::NewTicket;

use crate::bus::{EventBus, topics};
use crate::error::{EngineError, EngineResult};
use gate::GateReport;
use templates::{PhaseDefinition, WorkflowDefinition};

/// Upper bound on generated context summaries.
const SUMMARY_MAX_CHARS: usize = 512;

/// Produces the bounded summary stored on the ticket after each
/// transition. Production wires an LLM; tests inject a deterministic
/// stub.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, context: &serde_json::Value, max_chars: usize) -> Result<String>;
}

/// Deterministic fallback summarizer: compact-renders the context and
/// truncates.
pub struct DigestSummarizer;

#[async_trait]
impl Summarizer for DigestSummarizer {
    async fn summarize(&self, context: &serde_json::Value, max_chars: usize) -> Result<String> {
        let rendered = match context.as_object() {
            Some(obj) => {
                let mut keys: Vec<&str> = obj.keys().map(String::as_str).collect();
                keys.sort_unstable();
                format!("context[{}]: {}", keys.len(), keys.join(", "))
            }
            None => context.to_string(),
        };
        Ok(truncate_chars(&rendered, max_chars))
    }
}

/// Truncate a string to at most `max_chars` characters, appending "..."
/// if truncated.
fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_owned();
    }
    let mut truncated: String = s.chars().take(max_chars).collect();
    truncated.push_str("...");
    truncated
}

/// Caller-facing ticket specification.
#[derive(Debug, Clone)]
pub struct NewTicketSpec {
    pub title: String,
    pub description: String,
    pub owner: String,
    pub priority: Priority,
    /// Defaults to the workflow's entry phase.
    pub initial_phase: Option<String>,
}

/// The phase state machine component.
#[derive(Clone)]
pub struct PhaseMachine {
    pool: PgPool,
    bus: EventBus,
    workflow: Arc<WorkflowDefinition>,
    summarizer: Arc<dyn Summarizer>,
}

impl PhaseMachine {
    pub fn new(
        pool: PgPool,
        bus: EventBus,
        workflow: Arc<WorkflowDefinition>,
        summarizer: Arc<dyn Summarizer>,
    ) -> Self {
        Self {
            pool,
            bus,
            workflow,
            summarizer,
        }
    }

    /// The workflow this machine drives.
    pub fn workflow(&self) -> &WorkflowDefinition {
        &self.workflow
    }

    /// Upsert every phase definition into the `phases` table. Run once at
    /// startup; definitions are immutable while tickets traverse them.
    pub async fn sync_definitions(&self) -> EngineResult<()> {
        for phase in &self.workflow.phases {
            let definition = serde_json::to_value(phase)
                .context("failed to serialize phase definition")?;
            phase_db::upsert_phase(&self.pool, &phase.id, phase.position, &definition).await?;
        }
        Ok(())
    }

    /// Create a ticket in its initial phase and materialize that phase's
    /// task templates.
    pub async fn create_ticket(&self, spec: NewTicketSpec) -> EngineResult<Ticket> {
        if spec.title.trim().is_empty() {
            return Err(EngineError::InvalidInput("ticket title is empty".into()));
        }

        let initial = match &spec.initial_phase {
            Some(id) => self
                .workflow
                .get(id)
                .ok_or_else(|| EngineError::InvalidInput(format!("unknown phase {id:?}")))?,
            None => self.workflow.initial_phase(),
        };

        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin ticket transaction")?;

        let ticket = ticket_db::insert_ticket(
            &mut *tx,
            &NewTicket {
                title: spec.title,
                description: spec.description,
                owner: spec.owner,
                current_phase: initial.id.clone(),
                priority: spec.priority,
            },
        )
        .await?;

        let generated = materialize_templates(&mut *tx, &ticket, initial).await?;

        tx.commit()
            .await
            .context("failed to commit ticket transaction")?;

        let _ = self
            .bus
            .emit_by(
                topics::TICKET_CREATED,
                "ticket",
                ticket.id,
                serde_json::json!({
                    "title": ticket.title,
                    "phase": ticket.current_phase,
                    "priority": ticket.priority,
                }),
                &ticket.owner,
            )
            .await;
        self.announce_generated(&generated).await;

        Ok(ticket)
    }

    /// Fetch one ticket.
    pub async fn get_ticket(&self, id: Uuid) -> EngineResult<Ticket> {
        ticket_db::get_ticket(&self.pool, id)
            .await?
            .ok_or(EngineError::NotFound {
                entity: "ticket",
                id: id.to_string(),
            })
    }

    /// List tickets, optionally by status.
    pub async fn list_tickets(&self, status: Option<TicketStatus>) -> EngineResult<Vec<Ticket>> {
        Ok(ticket_db::list_tickets(&self.pool, status).await?)
    }

    /// A ticket's phase transition history, oldest first.
    pub async fn history(&self, ticket_id: Uuid) -> EngineResult<Vec<PhaseHistoryEntry>> {
        Ok(phase_db::history_for_ticket(&self.pool, ticket_id).await?)
    }

    /// Record gate evidence for a ticket's phase.
    pub async fn record_artifact(
        &self,
        ticket_id: Uuid,
        phase_id: Option<String>,
        artifact_kind: String,
        payload: serde_json::Value,
        collected_by: Option<Uuid>,
    ) -> EngineResult<()> {
        let ticket = self.get_ticket(ticket_id).await?;
        let phase_id = phase_id.unwrap_or(ticket.current_phase);
        if self.workflow.get(&phase_id).is_none() {
            return Err(EngineError::InvalidInput(format!(
                "unknown phase {phase_id:?}"
            )));
        }
        phase_db::insert_artifact(
            &self.pool,
            &NewArtifact {
                ticket_id,
                phase_id,
                artifact_kind,
                payload,
                collected_by,
            },
        )
        .await?;
        Ok(())
    }

    /// Evaluate a phase gate without transitioning.
    pub async fn validate_gate(
        &self,
        ticket_id: Uuid,
        phase_id: Option<String>,
    ) -> EngineResult<GateReport> {
        let ticket = self.get_ticket(ticket_id).await?;
        let phase_id = phase_id.unwrap_or_else(|| ticket.current_phase.clone());
        let phase = self
            .workflow
            .get(&phase_id)
            .ok_or_else(|| EngineError::InvalidInput(format!("unknown phase {phase_id:?}")))?;

        let mut conn = self
            .pool
            .acquire()
            .await
            .context("failed to acquire connection")?;
        Ok(gate::evaluate(&mut conn, &ticket, phase).await?)
    }

    /// Transition a ticket to another phase.
    ///
    /// Runs as one transaction: edge check, gate evaluation (skipped when
    /// the target bypasses gates), context aggregation + summary, history
    /// append, atomic phase swap, and materialization of the target
    /// phase's templates. Events are published after commit.
    pub async fn transition(
        &self,
        ticket_id: Uuid,
        to_phase: &str,
        reason: &str,
        actor: &str,
    ) -> EngineResult<Ticket> {
        let to_def = self
            .workflow
            .get(to_phase)
            .ok_or_else(|| EngineError::InvalidInput(format!("unknown phase {to_phase:?}")))?;

        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin transition transaction")?;

        // Row lock serializes concurrent transitions on the same ticket.
        let ticket = ticket_db::get_ticket_for_update(&mut *tx, ticket_id)
            .await?
            .ok_or(EngineError::NotFound {
                entity: "ticket",
                id: ticket_id.to_string(),
            })?;

        if matches!(ticket.status, TicketStatus::Done | TicketStatus::Archived) {
            return Err(EngineError::Conflict(format!(
                "ticket {ticket_id} is {} and cannot transition",
                ticket.status
            )));
        }

        let from_phase = ticket.current_phase.clone();
        let from_def = self
            .workflow
            .get(&from_phase)
            .ok_or_else(|| EngineError::InvalidInput(format!("unknown phase {from_phase:?}")))?;

        if !self.workflow.can_transition(&from_phase, to_phase) {
            return Err(EngineError::Conflict(format!(
                "invalid transition: {from_phase} -> {to_phase}"
            )));
        }

        // Gate the exit unless the target is the escape hatch.
        if !to_def.bypass_gate {
            let report = gate::evaluate(&mut *tx, &ticket, from_def).await?;
            if !report.passed() {
                return Err(EngineError::GateNotSatisfied {
                    missing: report.missing(),
                });
            }
        }

        // Aggregate the finished phase into the ticket's context document.
        let artifacts = phase_db::artifacts_for(&mut *tx, ticket_id, &from_phase).await?;
        let artifact_summary: Vec<serde_json::Value> = artifacts
            .iter()
            .map(|a| serde_json::json!({ "kind": a.artifact_kind, "payload": a.payload }))
            .collect();
        let mut patch_map = serde_json::Map::new();
        patch_map.insert(
            format!("phase:{from_phase}"),
            serde_json::json!({
                "reason": reason,
                "artifacts": artifact_summary.clone(),
            }),
        );
        let patch = serde_json::Value::Object(patch_map);

        let mut merged = ticket.context.clone();
        if let (Some(obj), Some(patch_obj)) = (merged.as_object_mut(), patch.as_object()) {
            for (k, v) in patch_obj {
                obj.insert(k.clone(), v.clone());
            }
        }
        let summary = self
            .summarizer
            .summarize(&merged, SUMMARY_MAX_CHARS)
            .await
            .context("summarizer failed")?;
        ticket_db::merge_context(&mut *tx, ticket_id, &patch, &summary).await?;

        phase_db::insert_history(
            &mut *tx,
            &NewPhaseHistory {
                ticket_id,
                from_phase: from_phase.clone(),
                to_phase: to_phase.to_owned(),
                reason: reason.to_owned(),
                actor: actor.to_owned(),
                artifacts: serde_json::Value::Array(artifact_summary),
            },
        )
        .await?;

        let rows = ticket_db::update_phase(&mut *tx, ticket_id, &from_phase, to_phase).await?;
        if rows == 0 {
            return Err(EngineError::Conflict(format!(
                "ticket {ticket_id} transitioned concurrently"
            )));
        }

        // Status follows the phase: entering the escape hatch blocks the
        // ticket, entering a terminal phase finishes it, leaving the
        // escape hatch reactivates it.
        if to_def.bypass_gate {
            let reasons = serde_json::json!([{ "reason": reason, "actor": actor }]);
            ticket_db::set_blocked(&mut *tx, ticket_id, &reasons).await?;
        } else if to_def.terminal {
            ticket_db::set_status(&mut *tx, ticket_id, TicketStatus::Done).await?;
        } else if from_def.bypass_gate {
            ticket_db::set_active(&mut *tx, ticket_id).await?;
        }

        let updated = ticket_db::get_ticket(&mut *tx, ticket_id)
            .await?
            .ok_or(EngineError::NotFound {
                entity: "ticket",
                id: ticket_id.to_string(),
            })?;
        let generated = materialize_templates(&mut *tx, &updated, to_def).await?;

        tx.commit()
            .await
            .context("failed to commit transition transaction")?;

        let _ = self
            .bus
            .emit_by(
                topics::TICKET_PHASE_TRANSITIONED,
                "ticket",
                ticket_id,
                serde_json::json!({
                    "from": from_phase,
                    "to": to_phase,
                    "reason": reason,
                }),
                actor,
            )
            .await;
        if to_def.bypass_gate {
            let _ = self
                .bus
                .emit(
                    topics::TICKET_BLOCKED,
                    "ticket",
                    ticket_id,
                    serde_json::json!({ "reason": reason }),
                )
                .await;
        } else if to_def.terminal {
            let _ = self
                .bus
                .emit(
                    topics::TICKET_DONE,
                    "ticket",
                    ticket_id,
                    serde_json::json!({}),
                )
                .await;
        }
        self.announce_generated(&generated).await;

        Ok(updated)
    }

    /// Archive a ticket (external cancellation). Task cleanup is the
    /// scheduler's job; the engine sequences both.
    pub async fn archive_ticket(&self, ticket_id: Uuid, reason: &str) -> EngineResult<Ticket> {
        let ticket = self.get_ticket(ticket_id).await?;
        if matches!(ticket.status, TicketStatus::Archived) {
            return Ok(ticket);
        }
        tracing::info!(ticket_id = %ticket_id, reason = %reason, "archiving ticket");
        ticket_db::set_status(&self.pool, ticket_id, TicketStatus::Archived).await?;
        self.get_ticket(ticket_id).await
    }

    async fn announce_generated(&self, tasks: &[Task]) {
        for task in tasks {
            let _ = self
                .bus
                .emit(
                    topics::TASK_CREATED,
                    "task",
                    task.id,
                    serde_json::json!({
                        "ticket_id": task.ticket_id,
                        "phase_id": task.phase_id,
                        "task_type": task.task_type,
                        "from_template": true,
                    }),
                )
                .await;
        }
    }
}

/// Materialize a phase's task templates for a ticket, resolving
/// template-local dependency names to the freshly-created task ids.
async fn materialize_templates(
    conn: &mut PgConnection,
    ticket: &Ticket,
    phase: &PhaseDefinition,
) -> EngineResult<Vec<Task>> {
    let mut created: Vec<Task> = Vec::with_capacity(phase.tasks.len());
    let mut by_name: std::collections::HashMap<&str, Uuid> = std::collections::HashMap::new();

    for template in &phase.tasks {
        let task = task_db::insert_task(
            &mut *conn,
            &NewTask {
                ticket_id: ticket.id,
                phase_id: phase.id.clone(),
                task_type: template.task_type.clone(),
                description: if template.description.is_empty() {
                    template.name.clone()
                } else {
                    template.description.clone()
                },
                priority: template.priority.unwrap_or(ticket.priority),
                optional: template.optional,
                max_retries: template.max_retries.unwrap_or(3),
                timeout_seconds: template.timeout_seconds,
                required_resources: template.required_resources.clone(),
                required_capabilities: template.required_capabilities.clone(),
            },
        )
        .await?;
        by_name.insert(template.name.as_str(), task.id);
        created.push(task);
    }

    for template in &phase.tasks {
        let task_id = by_name[template.name.as_str()];
        for dep_name in &template.depends_on {
            // Validation guaranteed the name resolves.
            let dep_id = by_name[dep_name.as_str()];
            task_db::insert_dependency(&mut *conn, task_id, dep_id).await?;
        }
    }

    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_short_string_unchanged() {
        assert_eq!(truncate_chars("hello", 10), "hello");
    }

    #[test]
    fn truncate_long_string_with_ellipsis() {
        assert_eq!(truncate_chars("abcdefghij", 5), "abcde...");
    }

    #[test]
    fn truncate_empty_string() {
        assert_eq!(truncate_chars("", 10), "");
    }

    #[tokio::test]
    async fn digest_summarizer_is_bounded_and_deterministic() {
        let ctx = serde_json::json!({
            "phase:requirements": { "artifacts": [] },
            "phase:design": { "artifacts": [] },
        });
        let a = DigestSummarizer.summarize(&ctx, 64).await.unwrap();
        let b = DigestSummarizer.summarize(&ctx, 64).await.unwrap();
        assert_eq!(a, b);
        assert!(a.chars().count() <= 64 + 3);
        assert!(a.contains("phase:design"));
    }
}
