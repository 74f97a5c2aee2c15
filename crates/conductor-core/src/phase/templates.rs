//! Declarative workflow definition: phases, allowed transitions, task
//! templates, and gate criteria, parsed from TOML and validated at
//! startup.
//!
//! Validation rules:
//! - At least one phase; ids unique; positions unique.
//! - Every `next` reference names an existing phase.
//! - Template names are unique within a phase and `depends_on` references
//!   resolve within the same phase.
//! - The per-phase template dependency graph is acyclic.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use conductor_db::models::Priority;

/// Errors produced while parsing or validating a workflow definition.
#[derive(Debug, Error)]
pub enum WorkflowParseError {
    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("workflow must contain at least one phase")]
    NoPhases,

    #[error("duplicate phase id: {0:?}")]
    DuplicatePhase(String),

    #[error("duplicate phase position {position} on phase {phase:?}")]
    DuplicatePosition { phase: String, position: i32 },

    #[error("phase {phase:?} lists unknown next phase {next:?}")]
    UnknownNextPhase { phase: String, next: String },

    #[error("duplicate template name {template:?} in phase {phase:?}")]
    DuplicateTemplateName { phase: String, template: String },

    #[error("template {template:?} in phase {phase:?} depends on unknown template {dependency:?}")]
    UnknownTemplateDependency {
        phase: String,
        template: String,
        dependency: String,
    },

    #[error("template dependency cycle in phase {phase:?} involving: {templates}")]
    TemplateCycle { phase: String, templates: String },
}

/// A gate predicate that must hold before leaving a phase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DoneDefinition {
    /// An artifact of this kind must have been collected.
    Artifact { artifact_kind: String },
    /// Every non-optional task of the phase must be completed. (Checked
    /// unconditionally by the gate; declaring it is documentation.)
    TasksComplete,
    /// The ticket's accumulated context must contain this key.
    ContextKey { key: String },
}

/// A task materialized into every ticket entering the phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskTemplate {
    pub name: String,
    pub task_type: String,
    #[serde(default)]
    pub description: String,
    /// Names of other templates in the same phase that must complete
    /// first; resolved to concrete task ids at materialization.
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub optional: bool,
    pub priority: Option<Priority>,
    #[serde(default)]
    pub required_resources: Vec<String>,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    pub timeout_seconds: Option<i32>,
    pub max_retries: Option<i32>,
}

/// One node in the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseDefinition {
    pub id: String,
    pub position: i32,
    /// Phases a ticket may transition to from here.
    #[serde(default)]
    pub next: Vec<String>,
    /// Guidance text supplied to workers executing tasks of this phase.
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub mandatory_steps: Vec<String>,
    /// Artifact kinds that must exist before the gate opens.
    #[serde(default)]
    pub expected_outputs: Vec<String>,
    #[serde(default)]
    pub done: Vec<DoneDefinition>,
    #[serde(default)]
    pub tasks: Vec<TaskTemplate>,
    /// Terminal phases end the ticket; no transitions out.
    #[serde(default)]
    pub terminal: bool,
    /// Entering this phase skips the gate of the phase being left (the
    /// escape hatch for blocked tickets).
    #[serde(default)]
    pub bypass_gate: bool,
}

/// The validated workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub phases: Vec<PhaseDefinition>,
}

impl WorkflowDefinition {
    /// Parse and validate a workflow TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self, WorkflowParseError> {
        let workflow: WorkflowDefinition = toml::from_str(content)?;
        workflow.validate()?;
        Ok(workflow)
    }

    /// The built-in workflow: backlog → requirements → design →
    /// implementation → testing → deployment → done, with a blocked
    /// detour reachable from every working phase.
    pub fn standard() -> Self {
        let phase = |id: &str, position: i32, next: &[&str]| PhaseDefinition {
            id: id.to_owned(),
            position,
            next: next.iter().map(|s| s.to_string()).collect(),
            prompt: String::new(),
            mandatory_steps: vec![],
            expected_outputs: vec![],
            done: vec![DoneDefinition::TasksComplete],
            tasks: vec![],
            terminal: false,
            bypass_gate: false,
        };

        let mut blocked = phase(
            "blocked",
            6,
            &["requirements", "design", "implementation", "testing"],
        );
        blocked.bypass_gate = true;
        blocked.done = vec![];

        let mut done = phase("done", 7, &[]);
        done.terminal = true;
        done.done = vec![];

        let workflow = Self {
            phases: vec![
                phase("backlog", 0, &["requirements"]),
                phase("requirements", 1, &["design", "blocked"]),
                phase("design", 2, &["implementation", "blocked"]),
                phase("implementation", 3, &["testing", "blocked"]),
                phase("testing", 4, &["deployment", "implementation", "blocked"]),
                phase("deployment", 5, &["done", "blocked"]),
                blocked,
                done,
            ],
        };
        debug_assert!(workflow.validate().is_ok());
        workflow
    }

    /// Look up a phase by id.
    pub fn get(&self, id: &str) -> Option<&PhaseDefinition> {
        self.phases.iter().find(|p| p.id == id)
    }

    /// The entry phase (lowest position).
    pub fn initial_phase(&self) -> &PhaseDefinition {
        self.phases
            .iter()
            .min_by_key(|p| p.position)
            .expect("validated workflow has at least one phase")
    }

    /// Whether `from -> to` is a permitted transition edge.
    pub fn can_transition(&self, from: &str, to: &str) -> bool {
        self.get(from)
            .is_some_and(|p| p.next.iter().any(|n| n == to))
    }

    /// Validate the structure. Called by the parsing constructors.
    pub fn validate(&self) -> Result<(), WorkflowParseError> {
        if self.phases.is_empty() {
            return Err(WorkflowParseError::NoPhases);
        }

        let mut ids = HashSet::new();
        let mut positions = HashSet::new();
        for phase in &self.phases {
            if !ids.insert(phase.id.as_str()) {
                return Err(WorkflowParseError::DuplicatePhase(phase.id.clone()));
            }
            if !positions.insert(phase.position) {
                return Err(WorkflowParseError::DuplicatePosition {
                    phase: phase.id.clone(),
                    position: phase.position,
                });
            }
        }

        for phase in &self.phases {
            for next in &phase.next {
                if !ids.contains(next.as_str()) {
                    return Err(WorkflowParseError::UnknownNextPhase {
                        phase: phase.id.clone(),
                        next: next.clone(),
                    });
                }
            }
            validate_templates(phase)?;
        }

        Ok(())
    }
}

/// Validate a phase's template set: unique names, resolvable
/// dependencies, acyclic graph (Kahn's algorithm).
fn validate_templates(phase: &PhaseDefinition) -> Result<(), WorkflowParseError> {
    let mut seen = HashSet::new();
    for template in &phase.tasks {
        if !seen.insert(template.name.as_str()) {
            return Err(WorkflowParseError::DuplicateTemplateName {
                phase: phase.id.clone(),
                template: template.name.clone(),
            });
        }
    }

    for template in &phase.tasks {
        for dep in &template.depends_on {
            if !seen.contains(dep.as_str()) {
                return Err(WorkflowParseError::UnknownTemplateDependency {
                    phase: phase.id.clone(),
                    template: template.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    // Kahn's algorithm over template indices.
    let names: Vec<&str> = phase.tasks.iter().map(|t| t.name.as_str()).collect();
    let name_to_idx: HashMap<&str, usize> = names
        .iter()
        .enumerate()
        .map(|(i, name)| (*name, i))
        .collect();

    let n = names.len();
    let mut in_degree = vec![0usize; n];
    let mut adj: Vec<Vec<usize>> = vec![vec![]; n];

    for template in &phase.tasks {
        let task_idx = name_to_idx[template.name.as_str()];
        for dep_name in &template.depends_on {
            let dep_idx = name_to_idx[dep_name.as_str()];
            adj[dep_idx].push(task_idx);
            in_degree[task_idx] += 1;
        }
    }

    let mut queue: VecDeque<usize> = (0..n).filter(|i| in_degree[*i] == 0).collect();
    let mut sorted_count = 0usize;
    while let Some(node) = queue.pop_front() {
        sorted_count += 1;
        for &neighbor in &adj[node] {
            in_degree[neighbor] -= 1;
            if in_degree[neighbor] == 0 {
                queue.push_back(neighbor);
            }
        }
    }

    if sorted_count != n {
        let cyclic: Vec<&str> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, deg)| **deg > 0)
            .map(|(i, _)| names[i])
            .collect();
        return Err(WorkflowParseError::TemplateCycle {
            phase: phase.id.clone(),
            templates: cyclic.join(", "),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_workflow_validates() {
        let wf = WorkflowDefinition::standard();
        assert!(wf.validate().is_ok());
        assert_eq!(wf.initial_phase().id, "backlog");
    }

    #[test]
    fn standard_workflow_transition_table() {
        let wf = WorkflowDefinition::standard();
        assert!(wf.can_transition("backlog", "requirements"));
        assert!(wf.can_transition("requirements", "design"));
        assert!(wf.can_transition("requirements", "blocked"));
        assert!(wf.can_transition("testing", "implementation"));
        assert!(wf.can_transition("deployment", "done"));
        assert!(wf.can_transition("blocked", "implementation"));
        assert!(!wf.can_transition("backlog", "design"));
        assert!(!wf.can_transition("done", "backlog"));
        assert!(!wf.can_transition("requirements", "deployment"));
    }

    #[test]
    fn blocked_phase_bypasses_gate_and_done_is_terminal() {
        let wf = WorkflowDefinition::standard();
        assert!(wf.get("blocked").unwrap().bypass_gate);
        assert!(wf.get("done").unwrap().terminal);
        assert!(wf.get("done").unwrap().next.is_empty());
    }

    #[test]
    fn parse_valid_workflow_toml() {
        let toml_str = r#"
[[phases]]
id = "draft"
position = 0
next = ["review"]
prompt = "Write the thing."

[[phases.tasks]]
name = "outline"
task_type = "analysis"

[[phases.tasks]]
name = "write"
task_type = "code"
depends_on = ["outline"]

[[phases]]
id = "review"
position = 1
terminal = true

[[phases.done]]
kind = "artifact"
artifact_kind = "review_notes"
"#;
        let wf = WorkflowDefinition::from_toml_str(toml_str).expect("should parse");
        assert_eq!(wf.phases.len(), 2);
        assert_eq!(wf.get("draft").unwrap().tasks.len(), 2);
        assert_eq!(
            wf.get("review").unwrap().done,
            vec![DoneDefinition::Artifact {
                artifact_kind: "review_notes".into()
            }]
        );
    }

    #[test]
    fn rejects_unknown_next_phase() {
        let toml_str = r#"
[[phases]]
id = "a"
position = 0
next = ["missing"]
"#;
        let err = WorkflowDefinition::from_toml_str(toml_str).unwrap_err();
        assert!(matches!(err, WorkflowParseError::UnknownNextPhase { .. }));
    }

    #[test]
    fn rejects_duplicate_phase_id() {
        let toml_str = r#"
[[phases]]
id = "a"
position = 0

[[phases]]
id = "a"
position = 1
"#;
        let err = WorkflowDefinition::from_toml_str(toml_str).unwrap_err();
        assert!(matches!(err, WorkflowParseError::DuplicatePhase(_)));
    }

    #[test]
    fn rejects_template_cycle() {
        let toml_str = r#"
[[phases]]
id = "a"
position = 0

[[phases.tasks]]
name = "x"
task_type = "code"
depends_on = ["y"]

[[phases.tasks]]
name = "y"
task_type = "code"
depends_on = ["x"]
"#;
        let err = WorkflowDefinition::from_toml_str(toml_str).unwrap_err();
        assert!(matches!(err, WorkflowParseError::TemplateCycle { .. }));
    }

    #[test]
    fn rejects_unknown_template_dependency() {
        let toml_str = r#"
[[phases]]
id = "a"
position = 0

[[phases.tasks]]
name = "x"
task_type = "code"
depends_on = ["ghost"]
"#;
        let err = WorkflowDefinition::from_toml_str(toml_str).unwrap_err();
        assert!(matches!(
            err,
            WorkflowParseError::UnknownTemplateDependency { .. }
        ));
    }

    #[test]
    fn rejects_empty_workflow() {
        let err = WorkflowDefinition::from_toml_str("phases = []").unwrap_err();
        assert!(matches!(err, WorkflowParseError::NoPhases));
    }
}
