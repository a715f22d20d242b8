//! Core types and error definitions for the recac control plane.
//!
//! This crate provides the foundational types shared across all recac crates:
//! the unified error enum, the feature/observation domain model, the signal
//! taxonomy, configuration, the secret scanner, and the clock capability.
//!
//! # Main types
//!
//! - [`RecacError`] — Unified error enum for all recac subsystems.
//! - [`RecacResult`] — Convenience alias for `Result<T, RecacError>`.
//! - [`AgentRole`] — Author role attached to persisted observations.
//! - [`Observation`] — Append-only history entry for a project.
//! - [`feature::Feature`] — A planned unit of work with exclusive write paths.
//! - [`signal`] — Lifecycle signal keys and the privileged/unprivileged split.

/// Runtime configuration loaded from TOML and CLI flags.
pub mod config;
/// Feature list domain model (`feature_list.json`).
pub mod feature;
/// Secret scanner applied to model output before execution.
pub mod scanner;
/// Lifecycle signal keys and privilege taxonomy.
pub mod signal;

mod clock;

pub use clock::{Clock, ManualClock, SystemClock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// --- Error types ---

/// Top-level error type for the recac control plane.
///
/// Subsystem variants carry a context string; lifecycle variants are the
/// terminal outcomes a session run loop can surface to the CLI.
#[derive(Debug, thiserror::Error)]
pub enum RecacError {
    /// An error from the persistent store (SQLite).
    #[error("Store error: {0}")]
    Store(String),

    /// An error from a model provider client.
    #[error("Model error: {0}")]
    Model(String),

    /// An error from the sandbox executor.
    #[error("Sandbox error: {0}")]
    Sandbox(String),

    /// An error from the version-control client.
    #[error("VCS error: {0}")]
    Vcs(String),

    /// An error from a notifier (chat/ticket) integration.
    #[error("Notify error: {0}")]
    Notify(String),

    /// An error raised by the session state machine.
    #[error("Session error: {0}")]
    Session(String),

    /// An error from the multi-agent orchestrator.
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A security finding blocked the iteration.
    #[error("Security error: {0}")]
    Security(String),

    /// The session exhausted its iteration budget.
    #[error("Session reached maximum iterations ({0})")]
    MaxIterations(u32),

    /// The agent produced no executable commands too many times in a row.
    #[error("Session terminated: {0} consecutive iterations without commands")]
    NoOp(u32),

    /// The passing-feature count stopped advancing.
    #[error("Session stalled: no feature progress for {0} iterations")]
    Stalled(u32),

    /// The agent reported a blocker it cannot resolve itself.
    #[error("Blocker reported: {0}")]
    Blocker(String),

    /// The run was cancelled cooperatively.
    #[error("Cancelled")]
    Cancelled,

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`RecacError`].
pub type RecacResult<T> = Result<T, RecacError>;

impl RecacError {
    /// True for the terminal budget outcomes (`MaxIterations`, `NoOp`,
    /// `Stalled`) that end a session with a failure notification.
    pub fn is_budget_exhausted(&self) -> bool {
        matches!(
            self,
            RecacError::MaxIterations(_) | RecacError::NoOp(_) | RecacError::Stalled(_)
        )
    }
}

// --- Observation types ---

/// The author role attached to a persisted [`Observation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    /// The coding agent working the feature list.
    Agent,
    /// The manager agent reviewing overall progress.
    Manager,
    /// The QA agent validating completed work.
    Qa,
    /// The cleanup agent run before final termination.
    Cleaner,
    /// The control plane itself (command output, lifecycle notes).
    System,
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentRole::Agent => write!(f, "agent"),
            AgentRole::Manager => write!(f, "manager"),
            AgentRole::Qa => write!(f, "qa"),
            AgentRole::Cleaner => write!(f, "cleaner"),
            AgentRole::System => write!(f, "system"),
        }
    }
}

impl std::str::FromStr for AgentRole {
    type Err = RecacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "agent" => Ok(AgentRole::Agent),
            "manager" => Ok(AgentRole::Manager),
            "qa" => Ok(AgentRole::Qa),
            "cleaner" => Ok(AgentRole::Cleaner),
            "system" => Ok(AgentRole::System),
            other => Err(RecacError::Store(format!("unknown agent role: {other}"))),
        }
    }
}

/// An append-only history entry scoped to a project.
///
/// Retrieval returns entries most-recent-first with a bounded limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    /// Project identifier this entry belongs to.
    pub project: String,
    /// Who authored the entry.
    pub role: AgentRole,
    /// The observation body.
    pub content: String,
    /// UTC insertion timestamp; monotone per project.
    pub created_at: DateTime<Utc>,
}

// --- Lock types ---

/// A leased exclusive-path lock held by one agent at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathLock {
    /// Repository-relative path the lock covers.
    pub path: String,
    /// Identifier of the current holder (e.g. `agent-feat-auth`).
    pub holder: String,
    /// When the lease was granted.
    pub acquired_at: DateTime<Utc>,
    /// Lease duration; an expired lease is not active.
    pub lease: std::time::Duration,
}

impl PathLock {
    /// Whether the lease is still live at `now`.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        let lease = chrono::Duration::from_std(self.lease).unwrap_or(chrono::Duration::MAX);
        now < self.acquired_at + lease
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_role_roundtrip() {
        for role in [
            AgentRole::Agent,
            AgentRole::Manager,
            AgentRole::Qa,
            AgentRole::Cleaner,
            AgentRole::System,
        ] {
            let parsed: AgentRole = role.to_string().parse().unwrap();
            assert_eq!(parsed, role);
        }
    }

    #[test]
    fn test_agent_role_rejects_unknown() {
        assert!("auditor".parse::<AgentRole>().is_err());
    }

    #[test]
    fn test_lock_expiry() {
        let lock = PathLock {
            path: "src/main.rs".into(),
            holder: "agent-feat-1".into(),
            acquired_at: Utc::now() - chrono::Duration::seconds(120),
            lease: std::time::Duration::from_secs(60),
        };
        assert!(!lock.is_active(Utc::now()));

        let fresh = PathLock {
            acquired_at: Utc::now(),
            ..lock
        };
        assert!(fresh.is_active(Utc::now()));
    }

    #[test]
    fn test_budget_error_classification() {
        assert!(RecacError::MaxIterations(200).is_budget_exhausted());
        assert!(RecacError::NoOp(3).is_budget_exhausted());
        assert!(RecacError::Stalled(50).is_budget_exhausted());
        assert!(!RecacError::Blocker("waiting on credentials".into()).is_budget_exhausted());
        assert!(!RecacError::Cancelled.is_budget_exhausted());
    }
}
