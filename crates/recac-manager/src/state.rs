//! Background session state persisted as one JSON file per session.

use chrono::{DateTime, Utc};
use recac_core::{RecacError, RecacResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Status of a background session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackgroundStatus {
    /// Process is (believed to be) alive.
    Running,
    /// Suspended with SIGSTOP.
    Paused,
    /// Terminated by the operator.
    Stopped,
    /// Exited on its own, successfully.
    Completed,
    /// Exited on its own, unsuccessfully.
    Failed,
}

impl BackgroundStatus {
    /// Whether the process may still exist.
    pub fn is_active(self) -> bool {
        matches!(self, BackgroundStatus::Running | BackgroundStatus::Paused)
    }
}

impl std::fmt::Display for BackgroundStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackgroundStatus::Running => write!(f, "running"),
            BackgroundStatus::Paused => write!(f, "paused"),
            BackgroundStatus::Stopped => write!(f, "stopped"),
            BackgroundStatus::Completed => write!(f, "completed"),
            BackgroundStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One background session's directory entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    /// Session name (`^[A-Za-z0-9_.-]+$`).
    pub name: String,
    /// Child process id.
    pub pid: u32,
    /// Current status.
    pub status: BackgroundStatus,
    /// The command line the session runs.
    pub command: Vec<String>,
    /// Workspace directory the command runs in.
    pub workspace: PathBuf,
    /// Log file capturing the child's stdout and stderr.
    pub log_file: PathBuf,
    /// HEAD commit when the session started, if the workspace is a repo.
    #[serde(default)]
    pub start_commit: Option<String>,
    /// HEAD commit when the session ended, if recorded.
    #[serde(default)]
    pub end_commit: Option<String>,
    /// What the session is trying to achieve.
    pub goal: String,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// End time, once terminal.
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl SessionState {
    /// Load from a JSON state file.
    pub fn load(path: &Path) -> RecacResult<Self> {
        let data = std::fs::read_to_string(path)?;
        serde_json::from_str(&data)
            .map_err(|e| RecacError::Session(format!("corrupt session file {}: {e}", path.display())))
    }

    /// Persist to a JSON state file.
    pub fn save(&self, path: &Path) -> RecacResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nightly.json");
        let state = SessionState {
            name: "nightly".into(),
            pid: 4242,
            status: BackgroundStatus::Running,
            command: vec!["recac".into(), "run".into()],
            workspace: PathBuf::from("/work/demo"),
            log_file: tmp.path().join("nightly.log"),
            start_commit: Some("abc123".into()),
            end_commit: None,
            goal: "ship the todo app".into(),
            started_at: Utc::now(),
            ended_at: None,
        };
        state.save(&path).unwrap();

        let loaded = SessionState::load(&path).unwrap();
        assert_eq!(loaded.name, "nightly");
        assert_eq!(loaded.status, BackgroundStatus::Running);
        assert_eq!(loaded.command, vec!["recac", "run"]);
    }

    #[test]
    fn test_active_statuses() {
        assert!(BackgroundStatus::Running.is_active());
        assert!(BackgroundStatus::Paused.is_active());
        assert!(!BackgroundStatus::Stopped.is_active());
        assert!(!BackgroundStatus::Completed.is_active());
        assert!(!BackgroundStatus::Failed.is_active());
    }
}
