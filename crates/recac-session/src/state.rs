//! Agent scratch-pad state persisted across iterations.
//!
//! One file per session (`.agent_state.json`); a session focused on a single
//! task writes `.agent_state_<task-id>.json` instead so parallel child
//! sessions never clobber each other.

use recac_core::{RecacError, RecacResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Rough bytes-per-token estimate used for budget accounting.
const BYTES_PER_TOKEN: usize = 4;

/// One prompt/reply exchange kept in the agent's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Who produced the content (`prompt` or `reply`).
    pub role: String,
    /// The content itself.
    pub content: String,
}

/// Persisted per-agent working state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    /// Free-form memory items the agent accumulates.
    #[serde(default)]
    pub memory: Vec<String>,
    /// Prompt/reply history, oldest first.
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    /// Estimated tokens consumed over the session lifetime.
    #[serde(default)]
    pub total_tokens: u64,
    /// Estimated tokens currently held in history.
    #[serde(default)]
    pub context_tokens: u64,
    /// Budget above which history is truncated.
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: u64,
    /// Number of times history has been truncated.
    #[serde(default)]
    pub truncations: u32,
}

fn default_max_context_tokens() -> u64 {
    120_000
}

impl Default for AgentState {
    fn default() -> Self {
        Self {
            memory: Vec::new(),
            history: Vec::new(),
            total_tokens: 0,
            context_tokens: 0,
            max_context_tokens: default_max_context_tokens(),
            truncations: 0,
        }
    }
}

impl AgentState {
    /// Load state from `path`; a missing file yields the default state.
    pub fn load(path: &Path) -> RecacResult<Self> {
        match std::fs::read_to_string(path) {
            Ok(data) => serde_json::from_str(&data)
                .map_err(|e| RecacError::Session(format!("corrupt agent state: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(RecacError::from(e)),
        }
    }

    /// Persist to `path`.
    pub fn save(&self, path: &Path) -> RecacResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Record a prompt/reply exchange and update token accounting, dropping
    /// the oldest history entries once over budget.
    pub fn record_exchange(&mut self, prompt: &str, reply: &str) {
        let cost = ((prompt.len() + reply.len()) / BYTES_PER_TOKEN) as u64;
        self.total_tokens += cost;
        self.context_tokens += cost;
        self.history.push(HistoryEntry {
            role: "prompt".into(),
            content: prompt.to_string(),
        });
        self.history.push(HistoryEntry {
            role: "reply".into(),
            content: reply.to_string(),
        });

        while self.context_tokens > self.max_context_tokens && !self.history.is_empty() {
            let dropped = self.history.remove(0);
            let dropped_cost = (dropped.content.len() / BYTES_PER_TOKEN) as u64;
            self.context_tokens = self.context_tokens.saturating_sub(dropped_cost);
            self.truncations += 1;
        }
    }
}

/// Path of the agent-state file for a session, task-suffixed when the
/// session is focused on one feature.
pub fn state_file_path(workspace: &Path, selected_task: Option<&str>) -> PathBuf {
    match selected_task {
        Some(task) => workspace.join(format!(".agent_state_{task}.json")),
        None => workspace.join(".agent_state.json"),
    }
}
