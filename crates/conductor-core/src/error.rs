//! Typed errors surfaced at the engine's public boundary.
//!
//! Expected outcomes (gate not satisfied, lock unavailable, cycles) are
//! values of this enum, not panics or stringly anyhow chains. Internal
//! helpers use `anyhow` and fold into [`EngineError::Internal`] at the
//! boundary.

use thiserror::Error;

/// Error returned by public engine operations.
///
/// Each variant carries a stable kind code (see [`EngineError::kind`])
/// that callers can match on regardless of the human-readable message.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Input validation failed; never retried.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A referenced entity does not exist.
    #[error("{entity} {id} not found")]
    NotFound {
        /// Entity kind, e.g. "ticket" or "agent".
        entity: &'static str,
        /// The identifier that failed to resolve.
        id: String,
    },

    /// The requested state change conflicts with current state: an
    /// invalid transition, a dependency cycle, a duplicate registration,
    /// or a lost optimistic-lock race.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A phase transition was blocked by its gate. `missing` itemizes
    /// every unsatisfied check.
    #[error("phase gate not satisfied: {}", missing.join("; "))]
    GateNotSatisfied {
        /// Human-readable description of each failed gate check.
        missing: Vec<String>,
    },

    /// A resource lease could not be acquired within the retry budget.
    /// Transient: the dispatcher skips the task and retries later.
    #[error("lock unavailable for {resource_key} after {attempts} attempts")]
    LockUnavailable {
        resource_key: String,
        attempts: u32,
    },

    /// The assigned agent stopped heartbeating.
    #[error("agent {agent_id} unreachable")]
    AgentUnreachable { agent_id: String },

    /// An operation exceeded its time budget.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The trajectory analyzer failed; the guardian downgrades this to
    /// "no verdict".
    #[error("analyzer unavailable: {0}")]
    AnalyzerUnavailable(String),

    /// Unexpected failure. Logged with full context; the affected task is
    /// failed permanently rather than retried forever.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// Stable machine-readable kind code for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::NotFound { .. } => "not_found",
            Self::Conflict(_) => "conflict",
            Self::GateNotSatisfied { .. } => "gate_not_satisfied",
            Self::LockUnavailable { .. } => "lock_unavailable",
            Self::AgentUnreachable { .. } => "agent_unreachable",
            Self::Timeout(_) => "timeout",
            Self::AnalyzerUnavailable(_) => "analyzer_unavailable",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether retrying the same operation later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::LockUnavailable { .. } | Self::AgentUnreachable { .. } | Self::Timeout(_)
        )
    }
}

/// Convenience alias used throughout the engine.
pub type EngineResult<T> = Result<T, EngineError>;
