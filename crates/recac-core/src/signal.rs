//! Lifecycle signal keys and the privileged/unprivileged split.
//!
//! Signals are key-value flags scoped per project and persisted in the store.
//! Privileged keys drive lifecycle transitions and must originate from
//! trusted code: a workspace file of the same name is never honored as proof
//! of a privileged signal. Unprivileged keys may be set by an agent, and a
//! legacy workspace file is migrated into the store on first sight.

/// All features implemented; requests the QA gate.
pub const COMPLETED: &str = "COMPLETED";
/// QA validated the project; requests the manager gate.
pub const QA_PASSED: &str = "QA_PASSED";
/// Manager signed the project off; requests merge and publication.
pub const PROJECT_SIGNED_OFF: &str = "PROJECT_SIGNED_OFF";
/// Force a QA run on the next lifecycle check.
pub const TRIGGER_QA: &str = "TRIGGER_QA";
/// Force a manager run on the next prompt selection.
pub const TRIGGER_MANAGER: &str = "TRIGGER_MANAGER";

/// Agent-reported blocker; halts the iteration.
pub const BLOCKER: &str = "BLOCKER";
/// Chat thread identifier for the project's notification thread.
pub const SLACK_THREAD_TS: &str = "SLACK_THREAD_TS";
/// Set when the stalled circuit breaker crosses its warning threshold.
pub const STALLED_WARNING: &str = "STALLED_WARNING";
/// Requests a cleanup pass before the orchestrator resumes.
pub const CLEANUP_REQUIRED: &str = "CLEANUP_REQUIRED";

/// Keys that drive lifecycle transitions and must come from trusted code.
pub const PRIVILEGED: &[&str] = &[
    COMPLETED,
    QA_PASSED,
    PROJECT_SIGNED_OFF,
    TRIGGER_QA,
    TRIGGER_MANAGER,
];

/// Signals that halt orchestrator task submission (the lifecycle barrier).
pub const BARRIER: &[&str] = &[
    PROJECT_SIGNED_OFF,
    QA_PASSED,
    COMPLETED,
    TRIGGER_MANAGER,
    TRIGGER_QA,
    CLEANUP_REQUIRED,
];

/// Whether `name` belongs to the privileged set.
pub fn is_privileged(name: &str) -> bool {
    PRIVILEGED.contains(&name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_privileged_membership() {
        assert!(is_privileged(PROJECT_SIGNED_OFF));
        assert!(is_privileged(QA_PASSED));
        assert!(is_privileged(COMPLETED));
        assert!(is_privileged(TRIGGER_QA));
        assert!(is_privileged(TRIGGER_MANAGER));
    }

    #[test]
    fn test_agent_settable_keys_are_unprivileged() {
        assert!(!is_privileged(BLOCKER));
        assert!(!is_privileged(SLACK_THREAD_TS));
        assert!(!is_privileged(STALLED_WARNING));
        assert!(!is_privileged(CLEANUP_REQUIRED));
    }

    #[test]
    fn test_barrier_includes_cleanup() {
        assert!(BARRIER.contains(&CLEANUP_REQUIRED));
        assert!(BARRIER.contains(&PROJECT_SIGNED_OFF));
    }
}
