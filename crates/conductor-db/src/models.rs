use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Active,
    Blocked,
    Done,
    Archived,
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Blocked => "blocked",
            Self::Done => "done",
            Self::Archived => "archived",
        };
        f.write_str(s)
    }
}

impl FromStr for TicketStatus {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "blocked" => Ok(Self::Blocked),
            "done" => Ok(Self::Done),
            "archived" => Ok(Self::Archived),
            other => Err(EnumParseError::new("ticket status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl TaskStatus {
    /// Whether the task can never change status again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "ready" => Ok(Self::Ready),
            "assigned" => Ok(Self::Assigned),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "timed_out" => Ok(Self::TimedOut),
            other => Err(EnumParseError::new("task status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Priority level shared by tickets and tasks. Higher sorts first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl Priority {
    /// One level up, saturating at [`Priority::Critical`].
    pub fn boosted(self) -> Self {
        match self {
            Self::Low => Self::Normal,
            Self::Normal => Self::High,
            Self::High | Self::Critical => Self::Critical,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

impl FromStr for Priority {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(EnumParseError::new("priority", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Status of an agent registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Busy,
    Unreachable,
    Disabled,
}

impl AgentStatus {
    /// Whether an agent in this status may be considered for dispatch.
    pub fn is_dispatchable(self) -> bool {
        matches!(self, Self::Idle | Self::Busy)
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Unreachable => "unreachable",
            Self::Disabled => "disabled",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentStatus {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "busy" => Ok(Self::Busy),
            "unreachable" => Ok(Self::Unreachable),
            "disabled" => Ok(Self::Disabled),
            other => Err(EnumParseError::new("agent status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Kind of a resource lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LockType {
    Exclusive,
    Shared,
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Exclusive => "exclusive",
            Self::Shared => "shared",
        };
        f.write_str(s)
    }
}

impl FromStr for LockType {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exclusive" => Ok(Self::Exclusive),
            "shared" => Ok(Self::Shared),
            other => Err(EnumParseError::new("lock type", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Kind of a discovery recorded by a running task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryType {
    BugFound,
    Optimization,
    ClarificationNeeded,
    MissingDependency,
    ScopeChange,
    StalledWorkflow,
}

impl fmt::Display for DiscoveryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::BugFound => "bug_found",
            Self::Optimization => "optimization",
            Self::ClarificationNeeded => "clarification_needed",
            Self::MissingDependency => "missing_dependency",
            Self::ScopeChange => "scope_change",
            Self::StalledWorkflow => "stalled_workflow",
        };
        f.write_str(s)
    }
}

impl FromStr for DiscoveryType {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bug_found" => Ok(Self::BugFound),
            "optimization" => Ok(Self::Optimization),
            "clarification_needed" => Ok(Self::ClarificationNeeded),
            "missing_dependency" => Ok(Self::MissingDependency),
            "scope_change" => Ok(Self::ScopeChange),
            "stalled_workflow" => Ok(Self::StalledWorkflow),
            other => Err(EnumParseError::new("discovery type", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Resolution status of a discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryResolution {
    Open,
    Resolved,
    Dismissed,
}

impl fmt::Display for DiscoveryResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Open => "open",
            Self::Resolved => "resolved",
            Self::Dismissed => "dismissed",
        };
        f.write_str(s)
    }
}

impl FromStr for DiscoveryResolution {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "resolved" => Ok(Self::Resolved),
            "dismissed" => Ok(Self::Dismissed),
            other => Err(EnumParseError::new("discovery resolution", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Kind of a guardian steering intervention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SteeringKind {
    Stuck,
    Drifting,
    ViolatingConstraints,
    Idle,
    MissedSteps,
    Emergency,
}

impl fmt::Display for SteeringKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stuck => "stuck",
            Self::Drifting => "drifting",
            Self::ViolatingConstraints => "violating_constraints",
            Self::Idle => "idle",
            Self::MissedSteps => "missed_steps",
            Self::Emergency => "emergency",
        };
        f.write_str(s)
    }
}

impl FromStr for SteeringKind {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stuck" => Ok(Self::Stuck),
            "drifting" => Ok(Self::Drifting),
            "violating_constraints" => Ok(Self::ViolatingConstraints),
            "idle" => Ok(Self::Idle),
            "missed_steps" => Ok(Self::MissedSteps),
            "emergency" => Ok(Self::Emergency),
            other => Err(EnumParseError::new("steering kind", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Outcome of a delivered guardian intervention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InterventionOutcome {
    Delivered,
    Ignored,
    Resolved,
}

impl fmt::Display for InterventionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Delivered => "delivered",
            Self::Ignored => "ignored",
            Self::Resolved => "resolved",
        };
        f.write_str(s)
    }
}

impl FromStr for InterventionOutcome {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "delivered" => Ok(Self::Delivered),
            "ignored" => Ok(Self::Ignored),
            "resolved" => Ok(Self::Resolved),
            other => Err(EnumParseError::new("intervention outcome", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Error returned when parsing an invalid enum string.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid {what}: {value:?}")]
pub struct EnumParseError {
    what: &'static str,
    value: String,
}

impl EnumParseError {
    fn new(what: &'static str, value: &str) -> Self {
        Self {
            what,
            value: value.to_owned(),
        }
    }
}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A ticket -- the top-level unit of user-requested work.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Ticket {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub owner: String,
    pub current_phase: String,
    pub previous_phase: Option<String>,
    pub priority: Priority,
    pub status: TicketStatus,
    pub context: serde_json::Value,
    pub context_summary: Option<String>,
    pub blocking_reasons: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A task -- a unit of work assignable to one agent.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub ticket_id: Uuid,
    pub phase_id: String,
    pub task_type: String,
    pub description: String,
    pub status: TaskStatus,
    pub priority: Priority,
    pub optional: bool,
    pub assigned_agent: Option<Uuid>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub timeout_seconds: Option<i32>,
    pub required_resources: Vec<String>,
    pub required_capabilities: Vec<String>,
    pub not_before: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error_kind: Option<String>,
    pub error_detail: Option<String>,
    pub cancel_reason: Option<String>,
    pub cancel_requested_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// An edge in the task dependency DAG.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskDependency {
    pub task_id: Uuid,
    pub depends_on: Uuid,
}

/// A phase definition row, synced from the workflow config at startup.
///
/// The full declarative definition (templates, done definitions, prompt)
/// is stored as a document; the engine deserializes it into its own types.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PhaseRow {
    pub id: String,
    pub position: i32,
    pub definition: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

/// An append-only record of one phase transition.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PhaseHistoryEntry {
    pub id: Uuid,
    pub ticket_id: Uuid,
    pub from_phase: String,
    pub to_phase: String,
    pub reason: String,
    pub actor: String,
    pub artifacts: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

/// Evidence collected during a phase, checked by gate validation.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PhaseGateArtifact {
    pub id: Uuid,
    pub ticket_id: Uuid,
    pub phase_id: String,
    pub artifact_kind: String,
    pub payload: serde_json::Value,
    pub collected_by: Option<Uuid>,
    pub recorded_at: DateTime<Utc>,
}

/// A registered agent worker.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Agent {
    pub id: Uuid,
    pub name: String,
    pub status: AgentStatus,
    pub capabilities: Vec<String>,
    pub capacity: i32,
    pub current_load: i32,
    pub tags: Vec<String>,
    pub health_score: f64,
    pub attributes: serde_json::Value,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

/// A mutual-exclusion lease on a named resource.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ResourceLock {
    pub id: Uuid,
    pub resource_key: String,
    pub holder_task: Uuid,
    pub holder_agent: Uuid,
    pub lock_type: LockType,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub version: i64,
}

/// A recorded branching event.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskDiscovery {
    pub id: Uuid,
    pub source_task: Uuid,
    pub discovery_type: DiscoveryType,
    pub description: String,
    pub spawned_task: Option<Uuid>,
    pub spawned_phase: Option<String>,
    pub priority_boost: bool,
    pub resolution: DiscoveryResolution,
    pub recorded_at: DateTime<Utc>,
}

/// A row in the append-only event log.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EventRow {
    pub id: Uuid,
    pub seq: i64,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub payload: serde_json::Value,
    pub actor: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// A guardian steering message or recovery action.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct GuardianIntervention {
    pub id: Uuid,
    pub agent_id: Option<Uuid>,
    pub ticket_id: Option<Uuid>,
    pub kind: SteeringKind,
    pub message: String,
    pub evidence: serde_json::Value,
    pub confidence: f64,
    pub outcome: InterventionOutcome,
    pub issued_at: DateTime<Utc>,
}

/// Cached trajectory context for one agent, re-derivable from the event
/// log.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TrajectoryContextRow {
    pub agent_id: Uuid,
    pub context: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
