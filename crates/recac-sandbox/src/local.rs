//! Host-local sandbox.
//!
//! Runs commands directly in the workspace directory with the filtered
//! environment. Used when the operator opts out of containers and as the
//! execution backend for integration tests.

use crate::{ExecResult, Sandbox};
use async_trait::async_trait;
use recac_core::{RecacError, RecacResult};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tracing::debug;

/// Sandbox that executes commands as child processes in the workspace.
pub struct LocalSandbox {
    workspace: PathBuf,
    env: Vec<(String, String)>,
}

impl LocalSandbox {
    /// Create a local sandbox rooted at `workspace` with `KEY=VALUE` env
    /// pairs (the output of [`crate::env::filtered_env`]).
    pub fn new(workspace: PathBuf, env: Vec<String>) -> Self {
        let env = env
            .into_iter()
            .filter_map(|pair| {
                pair.split_once('=')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
            })
            .collect();
        Self { workspace, env }
    }

    /// The workspace directory commands run in.
    pub fn workspace(&self) -> &Path {
        &self.workspace
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    fn id(&self) -> Option<String> {
        None
    }

    async fn ensure_ready(&self) -> RecacResult<()> {
        if self.workspace.is_dir() {
            Ok(())
        } else {
            Err(RecacError::Sandbox(format!(
                "workspace {} does not exist",
                self.workspace.display()
            )))
        }
    }

    async fn exec(&self, argv: &[String], timeout: Duration) -> RecacResult<ExecResult> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| RecacError::Sandbox("empty argv".into()))?;

        let mut command = tokio::process::Command::new(program);
        command
            .args(args)
            .current_dir(&self.workspace)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command
            .spawn()
            .map_err(|e| RecacError::Sandbox(format!("spawn {program} failed: {e}")))?;

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let result = ExecResult {
                    exit_code: output.status.code().map(i64::from).unwrap_or(-1),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    timed_out: false,
                };
                debug!(exit_code = result.exit_code, "local exec finished");
                Ok(result)
            }
            Ok(Err(e)) => Err(RecacError::Sandbox(format!("exec failed: {e}"))),
            Err(_) => Ok(ExecResult {
                exit_code: -1,
                stdout: String::new(),
                stderr: String::new(),
                timed_out: true,
            }),
        }
    }

    async fn read_file(&self, path: &str) -> RecacResult<Option<String>> {
        let full = self.workspace.join(path);
        match tokio::fs::read_to_string(&full).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(RecacError::Sandbox(format!(
                "read {} failed: {e}",
                full.display()
            ))),
        }
    }

    async fn cleanup(&self) -> RecacResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell_argv;

    fn sandbox(dir: &Path) -> LocalSandbox {
        LocalSandbox::new(dir.to_path_buf(), vec!["RECAC_PROJECT_ID=demo".into()])
    }

    #[tokio::test]
    async fn test_exec_captures_stdout() {
        let tmp = tempfile::tempdir().unwrap();
        let sandbox = sandbox(tmp.path());
        let result = sandbox
            .exec(&shell_argv("echo hello"), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(result.success());
        assert_eq!(result.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_exec_reports_exit_code() {
        let tmp = tempfile::tempdir().unwrap();
        let sandbox = sandbox(tmp.path());
        let result = sandbox
            .exec(&shell_argv("exit 3"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result.exit_code, 3);
        assert!(!result.success());
    }

    #[tokio::test]
    async fn test_exec_times_out() {
        let tmp = tempfile::tempdir().unwrap();
        let sandbox = sandbox(tmp.path());
        let result = sandbox
            .exec(&shell_argv("sleep 5"), Duration::from_millis(100))
            .await
            .unwrap();
        assert!(result.timed_out);
        assert!(!result.success());
    }

    #[tokio::test]
    async fn test_env_is_propagated() {
        let tmp = tempfile::tempdir().unwrap();
        let sandbox = sandbox(tmp.path());
        let result = sandbox
            .exec(&shell_argv("echo $RECAC_PROJECT_ID"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result.stdout.trim(), "demo");
    }

    #[tokio::test]
    async fn test_read_file() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("blockers.txt"), "stuck on auth").unwrap();
        let sandbox = sandbox(tmp.path());
        assert_eq!(
            sandbox.read_file("blockers.txt").await.unwrap().as_deref(),
            Some("stuck on auth")
        );
        assert!(sandbox.read_file("missing.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ensure_ready_requires_workspace() {
        let sandbox = LocalSandbox::new(PathBuf::from("/nonexistent/recac"), Vec::new());
        assert!(sandbox.ensure_ready().await.is_err());
    }
}
