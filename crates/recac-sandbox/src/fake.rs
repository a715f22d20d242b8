//! Fake sandbox for deterministic testing.

use crate::{ExecResult, Sandbox};
use async_trait::async_trait;
use parking_lot::Mutex;
use recac_core::RecacResult;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Recorded call to [`FakeSandbox`].
#[derive(Debug, Clone)]
pub enum SandboxCall {
    /// An exec with the full argv.
    Exec(Vec<String>),
    /// A file read.
    ReadFile(String),
}

/// Sandbox that records calls and plays back scripted results.
///
/// Unscripted execs succeed with empty output, so tests only script the
/// commands they care about.
#[derive(Clone, Default)]
pub struct FakeSandbox {
    inner: Arc<Mutex<FakeState>>,
}

#[derive(Default)]
struct FakeState {
    calls: Vec<SandboxCall>,
    results: Vec<ExecResult>,
    files: HashMap<String, String>,
    slow_secs: Option<u64>,
}

impl FakeSandbox {
    /// Empty fake: all execs succeed, no files exist.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the result for the next unscripted exec.
    pub fn push_result(&self, result: ExecResult) {
        self.inner.lock().results.push(result);
    }

    /// Provide a file the sandbox will report on `read_file`.
    pub fn put_file(&self, path: impl Into<String>, content: impl Into<String>) {
        self.inner.lock().files.insert(path.into(), content.into());
    }

    /// Make every exec behave as if it ran for `secs` seconds, so shorter
    /// timeouts report a timeout.
    pub fn set_exec_duration(&self, secs: u64) {
        self.inner.lock().slow_secs = Some(secs);
    }

    /// All recorded calls, in order.
    pub fn calls(&self) -> Vec<SandboxCall> {
        self.inner.lock().calls.clone()
    }

    /// The script bodies of every exec call (the last argv element).
    pub fn exec_bodies(&self) -> Vec<String> {
        self.inner
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                SandboxCall::Exec(argv) => argv.last().cloned(),
                SandboxCall::ReadFile(_) => None,
            })
            .collect()
    }

    /// Number of exec calls issued.
    pub fn exec_count(&self) -> usize {
        self.inner
            .lock()
            .calls
            .iter()
            .filter(|c| matches!(c, SandboxCall::Exec(_)))
            .count()
    }
}

#[async_trait]
impl Sandbox for FakeSandbox {
    fn id(&self) -> Option<String> {
        Some("fake".to_string())
    }

    async fn ensure_ready(&self) -> RecacResult<()> {
        Ok(())
    }

    async fn exec(&self, argv: &[String], timeout: Duration) -> RecacResult<ExecResult> {
        let mut state = self.inner.lock();
        state.calls.push(SandboxCall::Exec(argv.to_vec()));

        if let Some(secs) = state.slow_secs {
            if Duration::from_secs(secs) > timeout {
                return Ok(ExecResult {
                    exit_code: -1,
                    stdout: String::new(),
                    stderr: String::new(),
                    timed_out: true,
                });
            }
        }

        if state.results.is_empty() {
            Ok(ExecResult {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
                timed_out: false,
            })
        } else {
            Ok(state.results.remove(0))
        }
    }

    async fn read_file(&self, path: &str) -> RecacResult<Option<String>> {
        let mut state = self.inner.lock();
        state.calls.push(SandboxCall::ReadFile(path.to_string()));
        Ok(state.files.get(path).cloned())
    }

    async fn cleanup(&self) -> RecacResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell_argv;

    #[tokio::test]
    async fn test_records_and_scripts() {
        let sandbox = FakeSandbox::new();
        sandbox.push_result(ExecResult {
            exit_code: 1,
            stdout: "nope".into(),
            stderr: String::new(),
            timed_out: false,
        });
        let first = sandbox
            .exec(&shell_argv("cargo test"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(first.exit_code, 1);

        let second = sandbox
            .exec(&shell_argv("echo ok"), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(second.success());
        assert_eq!(sandbox.exec_count(), 2);
        assert_eq!(sandbox.exec_bodies(), vec!["cargo test", "echo ok"]);
    }

    #[tokio::test]
    async fn test_slow_exec_times_out() {
        let sandbox = FakeSandbox::new();
        sandbox.set_exec_duration(2);
        let result = sandbox
            .exec(&shell_argv("sleep 2"), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(result.timed_out);
    }

    #[tokio::test]
    async fn test_file_playback() {
        let sandbox = FakeSandbox::new();
        sandbox.put_file("blockers.txt", "need API credentials");
        assert_eq!(
            sandbox.read_file("blockers.txt").await.unwrap().as_deref(),
            Some("need API credentials")
        );
        assert!(sandbox.read_file("other.txt").await.unwrap().is_none());
    }
}
