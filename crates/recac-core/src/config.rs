//! Runtime configuration.
//!
//! Loaded from `recac.toml`; every field has a serde default so a partial
//! file (or none at all) yields a runnable configuration. CLI flags override
//! file values after loading. Credentials are never stored here — provider
//! clients read them from the environment at construction.

use crate::{RecacError, RecacResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment-variable name prefixes propagated into the sandbox.
pub const ENV_PREFIXES: &[&str] = &[
    "GIT_",
    "JIRA_",
    "RECAC_",
    "OPENROUTER_",
    "OPENAI_",
    "ANTHROPIC_",
    "GEMINI_",
];

/// Variable injected into every sandbox with the project identifier.
pub const PROJECT_ID_ENV: &str = "RECAC_PROJECT_ID";

/// Top-level configuration for a session run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecacConfig {
    /// Project identifier; scopes store rows and signals.
    #[serde(default)]
    pub project: String,

    /// Workspace directory holding `app_spec.txt` and the repository.
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,

    /// Hard cap on session iterations.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Number of parallel coding agents; above 1 enables the orchestrator.
    #[serde(default = "default_max_agents")]
    pub max_agents: usize,

    /// Run the manager agent every N iterations.
    #[serde(default = "default_manager_frequency")]
    pub manager_frequency: u32,

    /// Skip the QA gate and sign off directly on `COMPLETED`.
    #[serde(default)]
    pub skip_qa: bool,

    /// Merge the feature branch into the base branch on sign-off.
    #[serde(default)]
    pub auto_merge: bool,

    /// Delete the remote feature branch after a successful auto-merge.
    #[serde(default)]
    pub delete_branch_on_merge: bool,

    /// Base branch to merge from/into; `None` disables base-branch handling.
    #[serde(default)]
    pub base_branch: Option<String>,

    /// Timeout for each extracted bash block, in seconds.
    #[serde(default = "default_bash_timeout_secs")]
    pub bash_timeout_secs: u64,

    /// Orchestrator tick interval, in milliseconds.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Per-task retry budget in the orchestrator.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Exclusive-path lock lease, in seconds.
    #[serde(default = "default_lock_lease_secs")]
    pub lock_lease_secs: u64,

    /// Stalled circuit breaker: fail after this many flat iterations.
    #[serde(default = "default_stalled_threshold")]
    pub stalled_threshold: u32,

    /// Stalled circuit breaker: warn the manager from this count on.
    #[serde(default = "default_stalled_warning")]
    pub stalled_warning: u32,

    /// No-op circuit breaker: fail after this many commandless iterations.
    #[serde(default = "default_no_op_limit")]
    pub no_op_limit: u32,

    /// Pause between iterations, in milliseconds.
    #[serde(default = "default_iteration_delay_ms")]
    pub iteration_delay_ms: u64,

    /// Model provider settings.
    #[serde(default)]
    pub model: ModelSettings,

    /// Sandbox settings.
    #[serde(default)]
    pub sandbox: SandboxSettings,

    /// Notifier settings; absent means notifications are no-ops.
    #[serde(default)]
    pub slack: Option<SlackSettings>,
}

/// Which provider backend to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelProvider {
    /// Anthropic messages API.
    Claude,
    /// OpenRouter chat-completions API.
    OpenRouter,
}

/// Model provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// Provider backend.
    #[serde(default = "default_provider")]
    pub provider: ModelProvider,
    /// Provider model identifier.
    #[serde(default = "default_model_id")]
    pub model_id: String,
    /// Response token cap per request.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Stream responses chunk-by-chunk when the provider supports it.
    #[serde(default)]
    pub streaming: bool,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model_id: default_model_id(),
            max_tokens: default_max_tokens(),
            streaming: false,
        }
    }
}

/// Sandbox settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSettings {
    /// Default image when the workspace supplies no Dockerfile.
    #[serde(default = "default_image")]
    pub image: String,
    /// Working directory inside the container.
    #[serde(default = "default_working_dir")]
    pub working_dir: String,
    /// Memory limit in megabytes.
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: u64,
    /// CPU core limit.
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: f64,
    /// Whether networking is enabled inside the container.
    #[serde(default = "default_network_enabled")]
    pub network_enabled: bool,
    /// Run commands in the host workspace instead of a container.
    #[serde(default)]
    pub local: bool,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            image: default_image(),
            working_dir: default_working_dir(),
            memory_limit_mb: default_memory_limit_mb(),
            cpu_limit: default_cpu_limit(),
            network_enabled: default_network_enabled(),
            local: false,
        }
    }
}

/// Slack notifier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlackSettings {
    /// Channel id to post project threads into.
    pub channel: String,
}

fn default_workspace() -> PathBuf {
    PathBuf::from(".")
}

fn default_max_iterations() -> u32 {
    200
}

fn default_max_agents() -> usize {
    1
}

fn default_manager_frequency() -> u32 {
    10
}

fn default_bash_timeout_secs() -> u64 {
    120
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_max_retries() -> u32 {
    3
}

fn default_lock_lease_secs() -> u64 {
    60
}

fn default_stalled_threshold() -> u32 {
    50
}

fn default_stalled_warning() -> u32 {
    30
}

fn default_no_op_limit() -> u32 {
    3
}

fn default_iteration_delay_ms() -> u64 {
    2000
}

fn default_provider() -> ModelProvider {
    ModelProvider::Claude
}

fn default_model_id() -> String {
    "claude-sonnet-4-20250514".to_string()
}

fn default_max_tokens() -> u32 {
    8192
}

fn default_image() -> String {
    "ubuntu:22.04".to_string()
}

fn default_working_dir() -> String {
    "/workspace".to_string()
}

fn default_memory_limit_mb() -> u64 {
    2048
}

fn default_cpu_limit() -> f64 {
    2.0
}

fn default_network_enabled() -> bool {
    true
}

impl Default for RecacConfig {
    fn default() -> Self {
        Self {
            project: String::new(),
            workspace: default_workspace(),
            max_iterations: default_max_iterations(),
            max_agents: default_max_agents(),
            manager_frequency: default_manager_frequency(),
            skip_qa: false,
            auto_merge: false,
            delete_branch_on_merge: false,
            base_branch: None,
            bash_timeout_secs: default_bash_timeout_secs(),
            tick_interval_ms: default_tick_interval_ms(),
            max_retries: default_max_retries(),
            lock_lease_secs: default_lock_lease_secs(),
            stalled_threshold: default_stalled_threshold(),
            stalled_warning: default_stalled_warning(),
            no_op_limit: default_no_op_limit(),
            iteration_delay_ms: default_iteration_delay_ms(),
            model: ModelSettings::default(),
            sandbox: SandboxSettings::default(),
            slack: None,
        }
    }
}

impl RecacConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> RecacResult<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| RecacError::Config(format!("cannot read {}: {e}", path.display())))?;
        toml::from_str(&data)
            .map_err(|e| RecacError::Config(format!("invalid config {}: {e}", path.display())))
    }

    /// Load from `path` if it exists, otherwise return defaults.
    pub fn load_or_default(path: &Path) -> RecacResult<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> RecacResult<()> {
        if self.project.is_empty() {
            return Err(RecacError::Config("project id must not be empty".into()));
        }
        if self.max_agents == 0 {
            return Err(RecacError::Config("max_agents must be at least 1".into()));
        }
        if self.auto_merge && self.base_branch.is_none() {
            return Err(RecacError::Config(
                "auto_merge requires base_branch to be set".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_yields_defaults() {
        let config: RecacConfig = toml::from_str("").unwrap();
        assert_eq!(config.max_iterations, 200);
        assert_eq!(config.max_agents, 1);
        assert_eq!(config.bash_timeout_secs, 120);
        assert_eq!(config.no_op_limit, 3);
        assert_eq!(config.stalled_warning, 30);
        assert!(config.base_branch.is_none());
        assert!(config.slack.is_none());
    }

    #[test]
    fn test_partial_toml_overrides() {
        let config: RecacConfig = toml::from_str(
            r#"
            project = "demo"
            max_agents = 4
            base_branch = "main"
            auto_merge = true

            [model]
            provider = "openrouter"
            model_id = "qwen/qwen-2.5-coder-32b"
            "#,
        )
        .unwrap();
        assert_eq!(config.project, "demo");
        assert_eq!(config.max_agents, 4);
        assert_eq!(config.base_branch.as_deref(), Some("main"));
        assert_eq!(config.model.provider, ModelProvider::OpenRouter);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_project() {
        let config = RecacConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_auto_merge_without_base() {
        let mut config = RecacConfig {
            project: "demo".into(),
            ..RecacConfig::default()
        };
        config.auto_merge = true;
        assert!(config.validate().is_err());
        config.base_branch = Some("main".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let config = RecacConfig::load_or_default(&tmp.path().join("recac.toml")).unwrap();
        assert_eq!(config.max_iterations, 200);
    }

    #[test]
    fn test_env_prefix_set() {
        assert!(ENV_PREFIXES.contains(&"ANTHROPIC_"));
        assert!(ENV_PREFIXES.contains(&"RECAC_"));
        assert!(!ENV_PREFIXES.contains(&"HOME"));
    }
}
