//! Phase gate evaluation.
//!
//! A gate is the set of predicates that must hold before a ticket may
//! leave its current phase: every declared done definition, every
//! expected output artifact, and completion of all non-optional tasks.
//! Gate failure is an expected outcome reported as a value, itemizing
//! each unsatisfied check.

use anyhow::Result;
use sqlx::PgConnection;

use conductor_db::models::Ticket;
use conductor_db::queries::phases as phase_db;
use conductor_db::queries::tasks as task_db;

use super::templates::{DoneDefinition, PhaseDefinition};

/// One gate predicate and its evaluation result.
#[derive(Debug, Clone)]
pub struct GateCheck {
    /// What the predicate requires, e.g. `artifact requirements_doc`.
    pub requirement: String,
    pub satisfied: bool,
    /// Why the check failed (empty when satisfied).
    pub detail: String,
}

/// Outcome of evaluating every gate predicate for one (ticket, phase).
#[derive(Debug, Clone)]
pub struct GateReport {
    pub phase_id: String,
    pub checks: Vec<GateCheck>,
}

impl GateReport {
    /// Whether every check passed.
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.satisfied)
    }

    /// Human-readable list of the unsatisfied checks.
    pub fn missing(&self) -> Vec<String> {
        self.checks
            .iter()
            .filter(|c| !c.satisfied)
            .map(|c| {
                if c.detail.is_empty() {
                    c.requirement.clone()
                } else {
                    format!("{}: {}", c.requirement, c.detail)
                }
            })
            .collect()
    }
}

/// Evaluate the gate of `phase` for `ticket`.
///
/// Takes an open connection so transition can run it inside its
/// transaction and see a consistent snapshot.
pub async fn evaluate(
    conn: &mut PgConnection,
    ticket: &Ticket,
    phase: &PhaseDefinition,
) -> Result<GateReport> {
    let mut checks = Vec::new();

    let artifact_kinds = phase_db::artifact_kinds(&mut *conn, ticket.id, &phase.id).await?;

    for done in &phase.done {
        match done {
            DoneDefinition::Artifact { artifact_kind } => {
                let present = artifact_kinds.iter().any(|k| k == artifact_kind);
                checks.push(GateCheck {
                    requirement: format!("artifact {artifact_kind}"),
                    satisfied: present,
                    detail: if present {
                        String::new()
                    } else {
                        "no artifact of this kind collected".into()
                    },
                });
            }
            // Folded into the unconditional required-tasks check below.
            DoneDefinition::TasksComplete => {}
            DoneDefinition::ContextKey { key } => {
                let present = ticket
                    .context
                    .as_object()
                    .is_some_and(|obj| obj.contains_key(key));
                checks.push(GateCheck {
                    requirement: format!("context key {key}"),
                    satisfied: present,
                    detail: if present {
                        String::new()
                    } else {
                        "key absent from accumulated context".into()
                    },
                });
            }
        }
    }

    for output in &phase.expected_outputs {
        let present = artifact_kinds.iter().any(|k| k == output);
        checks.push(GateCheck {
            requirement: format!("expected output {output}"),
            satisfied: present,
            detail: if present {
                String::new()
            } else {
                "required artifact kind missing".into()
            },
        });
    }

    let open = task_db::incomplete_required_count(&mut *conn, ticket.id, &phase.id).await?;
    checks.push(GateCheck {
        requirement: "all required tasks completed".into(),
        satisfied: open == 0,
        detail: if open == 0 {
            String::new()
        } else {
            format!("{open} required task(s) not completed")
        },
    });

    Ok(GateReport {
        phase_id: phase.id.clone(),
        checks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(requirement: &str, satisfied: bool, detail: &str) -> GateCheck {
        GateCheck {
            requirement: requirement.into(),
            satisfied,
            detail: detail.into(),
        }
    }

    #[test]
    fn report_passes_only_when_all_checks_pass() {
        let passing = GateReport {
            phase_id: "design".into(),
            checks: vec![check("a", true, ""), check("b", true, "")],
        };
        assert!(passing.passed());

        let failing = GateReport {
            phase_id: "design".into(),
            checks: vec![check("a", true, ""), check("b", false, "missing")],
        };
        assert!(!failing.passed());
    }

    #[test]
    fn missing_itemizes_only_failures() {
        let report = GateReport {
            phase_id: "design".into(),
            checks: vec![
                check("artifact design_doc", false, "no artifact of this kind collected"),
                check("all required tasks completed", true, ""),
                check("context key api_shape", false, "key absent from accumulated context"),
            ],
        };
        let missing = report.missing();
        assert_eq!(missing.len(), 2);
        assert!(missing[0].contains("design_doc"));
        assert!(missing[1].contains("api_shape"));
    }

    #[test]
    fn empty_report_passes() {
        let report = GateReport {
            phase_id: "backlog".into(),
            checks: vec![],
        };
        assert!(report.passed());
        assert!(report.missing().is_empty());
    }
}
