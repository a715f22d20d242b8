//! Environment propagation into the sandbox.
//!
//! Only variables with an allowed name prefix cross into the execution
//! environment, plus an injected project-id variable. Everything else on the
//! host stays invisible to the agent.

use recac_core::config::{ENV_PREFIXES, PROJECT_ID_ENV};

/// Filter `vars` down to the allowed prefixes and inject the project id.
///
/// Returns `KEY=VALUE` pairs ready for a container or child-process spec.
pub fn filtered_env(
    vars: impl IntoIterator<Item = (String, String)>,
    project: &str,
) -> Vec<String> {
    let mut out: Vec<String> = vars
        .into_iter()
        .filter(|(key, _)| ENV_PREFIXES.iter().any(|prefix| key.starts_with(prefix)))
        .filter(|(key, _)| key != PROJECT_ID_ENV)
        .map(|(key, value)| format!("{key}={value}"))
        .collect();
    out.sort();
    out.push(format!("{PROJECT_ID_ENV}={project}"));
    out
}

/// [`filtered_env`] over the current process environment.
pub fn filtered_process_env(project: &str) -> Vec<String> {
    filtered_env(std::env::vars(), project)
}
