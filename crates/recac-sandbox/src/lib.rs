//! Sandboxed command execution.
//!
//! Every command an agent produces runs through the [`Sandbox`] capability:
//! either inside a Docker container ([`DockerSandbox`]) or directly in the
//! host workspace ([`LocalSandbox`], for trusted environments and tests).
//! The sandbox also answers file reads so callers can inspect agent-written
//! marker files without touching the host filesystem layout.

pub mod env;

mod docker;
mod fake;
mod local;

pub use docker::DockerSandbox;
pub use fake::{FakeSandbox, SandboxCall};
pub use local::LocalSandbox;

use async_trait::async_trait;
use recac_core::RecacResult;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Result of executing a command inside the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResult {
    /// Process exit code (0 means success, -1 when unknown).
    pub exit_code: i64,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// True when the command was cut off by the timeout.
    #[serde(default)]
    pub timed_out: bool,
}

impl ExecResult {
    /// Whether the command completed successfully.
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// Stdout and stderr concatenated for transcripts.
    pub fn combined_output(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
            (false, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (true, true) => String::new(),
        }
    }
}

/// Capability for running agent-produced commands in isolation.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Identifier of the backing environment (container id), if started.
    fn id(&self) -> Option<String>;

    /// Ensure the execution environment exists and is running.
    async fn ensure_ready(&self) -> RecacResult<()>;

    /// Execute `argv` with the given timeout.
    ///
    /// A timeout is not an `Err`: it returns an [`ExecResult`] with
    /// `timed_out` set so the caller can record the failure and continue.
    async fn exec(&self, argv: &[String], timeout: Duration) -> RecacResult<ExecResult>;

    /// Read a file from inside the environment; `None` when absent.
    async fn read_file(&self, path: &str) -> RecacResult<Option<String>>;

    /// Tear down the environment, releasing resources. Idempotent.
    async fn cleanup(&self) -> RecacResult<()>;
}

/// Build the argv for a shell command body the way the response processor
/// expects: `/bin/sh -c` for one-liners, `/bin/bash -c` for multi-line
/// scripts.
pub fn shell_argv(body: &str) -> Vec<String> {
    let shell = if body.trim_end().contains('\n') {
        "/bin/bash"
    } else {
        "/bin/sh"
    };
    vec![shell.to_string(), "-c".to_string(), body.to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_argv_single_line() {
        let argv = shell_argv("echo hello");
        assert_eq!(argv[0], "/bin/sh");
        assert_eq!(argv[1], "-c");
        assert_eq!(argv[2], "echo hello");
    }

    #[test]
    fn test_shell_argv_multi_line() {
        let argv = shell_argv("set -e\ncargo test");
        assert_eq!(argv[0], "/bin/bash");
    }

    #[test]
    fn test_trailing_newline_is_not_multi_line() {
        let argv = shell_argv("echo hello\n");
        assert_eq!(argv[0], "/bin/sh");
    }

    #[test]
    fn test_combined_output() {
        let result = ExecResult {
            exit_code: 1,
            stdout: "out".into(),
            stderr: "err".into(),
            timed_out: false,
        };
        assert_eq!(result.combined_output(), "out\nerr");
        assert!(!result.success());
    }

    #[test]
    fn test_timed_out_is_not_success() {
        let result = ExecResult {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            timed_out: true,
        };
        assert!(!result.success());
    }
}
