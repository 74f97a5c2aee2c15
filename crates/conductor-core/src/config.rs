//! Engine configuration.
//!
//! Every tunable has a serde default so a partial TOML file (or none at
//! all) yields a fully-populated config. Values here are suggestions the
//! operator may override; nothing in the engine hardcodes them.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level engine configuration, grouped by subsystem.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub dispatcher: DispatcherConfig,
    pub locks: LockConfig,
    pub agents: AgentConfig,
    pub tasks: TaskConfig,
    pub guardian: GuardianConfig,
}

impl EngineConfig {
    /// Parse a TOML string. Missing keys fall back to defaults.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).context("failed to parse engine config")
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content)
    }
}

/// Dispatcher tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Upper bound on concurrently assigned tasks. `None` means "total
    /// registered agent capacity", resolved at dispatch time.
    pub max_concurrent_tasks: Option<usize>,
    /// How many ready tasks to pull per scheduling pass.
    pub batch_size: i64,
    /// After this many consecutive priority-ordered assignments, prefer
    /// the oldest ready task regardless of priority.
    pub fairness_window: u32,
    /// Delay between scheduling passes when nothing was assignable.
    pub idle_poll_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: None,
            batch_size: 16,
            fairness_window: 8,
            idle_poll_ms: 250,
        }
    }
}

/// Resource-lock coordinator tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Lease TTL when the caller does not specify one.
    pub default_ttl_seconds: i64,
    /// Acquisition attempts before reporting the lease unavailable.
    pub max_retries: u32,
    /// Base of the exponential acquisition backoff.
    pub base_backoff_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: 300,
            max_retries: 5,
            base_backoff_ms: 100,
        }
    }
}

/// Agent liveness tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Interval workers are expected to heartbeat at.
    pub heartbeat_interval_seconds: u64,
    /// Silence beyond this marks an agent unreachable.
    pub stale_timeout_seconds: i64,
    /// Minimum health score for dispatch eligibility.
    pub min_health: f64,
    /// Grace period after cancellation before an unresponsive worker's
    /// agent is marked unreachable.
    pub cancel_grace_seconds: i64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_seconds: 30,
            stale_timeout_seconds: 90,
            min_health: 0.5,
            cancel_grace_seconds: 30,
        }
    }
}

/// Task retry tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Retry budget when the caller does not specify one.
    pub default_max_retries: i32,
    /// Base of the exponential retry backoff (1s, 2s, 4s, ...).
    pub retry_backoff_base_ms: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
            retry_backoff_base_ms: 1000,
        }
    }
}

/// Guardian monitoring tuning. The thresholds are suggested defaults,
/// not normative values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardianConfig {
    /// Interval of the trajectory-analysis and stuck-detection loops.
    pub interval_seconds: u64,
    /// Interval of the system-coherence loop.
    pub coherence_interval_seconds: u64,
    /// A gated-but-complete phase older than this is stuck.
    pub stuck_threshold_seconds: i64,
    /// Minimum gap between interventions on the same (agent, kind).
    pub intervention_cooldown_seconds: i64,
    /// Steering recommendations below this confidence are ignored.
    pub confidence_threshold: f64,
    /// Alignment below this counts as drifting.
    pub alignment_threshold: f64,
    /// Alignment below this escalates to an emergency intervention.
    pub emergency_threshold: f64,
    /// How many recent events go into a trajectory snapshot.
    pub event_window: i64,
    /// Verdict cache capacity (entries, one per agent).
    pub verdict_cache_size: usize,
}

impl Default for GuardianConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 60,
            coherence_interval_seconds: 300,
            stuck_threshold_seconds: 300,
            intervention_cooldown_seconds: 60,
            confidence_threshold: 0.7,
            alignment_threshold: 0.5,
            emergency_threshold: 0.2,
            event_window: 50,
            verdict_cache_size: 256,
        }
    }
}

impl GuardianConfig {
    /// Trajectory/stuck loop cadence as a [`Duration`].
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    /// Coherence loop cadence as a [`Duration`].
    pub fn coherence_interval(&self) -> Duration {
        Duration::from_secs(self.coherence_interval_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.dispatcher.batch_size, 16);
        assert_eq!(cfg.dispatcher.fairness_window, 8);
        assert!(cfg.dispatcher.max_concurrent_tasks.is_none());
        assert_eq!(cfg.locks.default_ttl_seconds, 300);
        assert_eq!(cfg.locks.max_retries, 5);
        assert_eq!(cfg.locks.base_backoff_ms, 100);
        assert_eq!(cfg.agents.heartbeat_interval_seconds, 30);
        assert_eq!(cfg.agents.stale_timeout_seconds, 90);
        assert_eq!(cfg.tasks.default_max_retries, 3);
        assert_eq!(cfg.tasks.retry_backoff_base_ms, 1000);
        assert_eq!(cfg.guardian.interval_seconds, 60);
        assert_eq!(cfg.guardian.stuck_threshold_seconds, 300);
        assert_eq!(cfg.guardian.intervention_cooldown_seconds, 60);
        assert_eq!(cfg.guardian.alignment_threshold, 0.5);
        assert_eq!(cfg.guardian.emergency_threshold, 0.2);
    }

    #[test]
    fn partial_toml_keeps_defaults_elsewhere() {
        let cfg = EngineConfig::from_toml_str(
            r#"
[dispatcher]
batch_size = 4

[guardian]
stuck_threshold_seconds = 10
"#,
        )
        .expect("should parse");
        assert_eq!(cfg.dispatcher.batch_size, 4);
        assert_eq!(cfg.dispatcher.fairness_window, 8);
        assert_eq!(cfg.guardian.stuck_threshold_seconds, 10);
        assert_eq!(cfg.guardian.interval_seconds, 60);
    }

    #[test]
    fn empty_toml_is_all_defaults() {
        let cfg = EngineConfig::from_toml_str("").expect("should parse");
        assert_eq!(cfg.locks.max_retries, 5);
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(EngineConfig::from_toml_str("[dispatcher").is_err());
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("conductor.toml");
        std::fs::write(&path, "[locks]\nmax_retries = 9\n").unwrap();

        let cfg = EngineConfig::load(&path).expect("should load");
        assert_eq!(cfg.locks.max_retries, 9);

        assert!(EngineConfig::load(&dir.path().join("missing.toml")).is_err());
    }
}
