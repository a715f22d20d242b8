//! Fake VCS for deterministic testing.

use crate::Vcs;
use async_trait::async_trait;
use parking_lot::Mutex;
use recac_core::{RecacError, RecacResult};
use std::collections::HashMap;
use std::sync::Arc;

/// Recorded call to [`FakeVcs`] — the operation name plus its argument.
pub type VcsCall = (String, String);

/// VCS fake that records operations and fails scripted operations a set
/// number of times before succeeding (for merge-retry scenarios).
#[derive(Clone, Default)]
pub struct FakeVcs {
    inner: Arc<Mutex<FakeState>>,
}

#[derive(Default)]
struct FakeState {
    calls: Vec<VcsCall>,
    failures: HashMap<String, u32>,
    branch: Option<String>,
    commits: u64,
}

impl FakeVcs {
    /// Fake where every operation succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `op` (e.g. `"merge"`) fail the next `times` calls.
    pub fn fail_times(&self, op: &str, times: u32) {
        self.inner.lock().failures.insert(op.to_string(), times);
    }

    /// All recorded calls, in order.
    pub fn calls(&self) -> Vec<VcsCall> {
        self.inner.lock().calls.clone()
    }

    /// How many times `op` was invoked.
    pub fn count(&self, op: &str) -> usize {
        self.inner.lock().calls.iter().filter(|(name, _)| name == op).count()
    }

    fn record(&self, op: &str, arg: impl Into<String>) -> RecacResult<()> {
        let mut state = self.inner.lock();
        state.calls.push((op.to_string(), arg.into()));
        if let Some(remaining) = state.failures.get_mut(op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(RecacError::Vcs(format!("{op} failed (scripted)")));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Vcs for FakeVcs {
    async fn ensure_repo(&self) -> RecacResult<()> {
        self.record("ensure_repo", "")
    }

    async fn current_branch(&self) -> RecacResult<String> {
        self.record("current_branch", "")?;
        Ok(self
            .inner
            .lock()
            .branch
            .clone()
            .unwrap_or_else(|| "recac/work".to_string()))
    }

    async fn head_commit(&self) -> RecacResult<String> {
        self.record("head_commit", "")?;
        Ok(format!("{:040x}", self.inner.lock().commits))
    }

    async fn commit_all(&self, message: &str) -> RecacResult<Option<String>> {
        self.record("commit_all", message)?;
        let mut state = self.inner.lock();
        state.commits += 1;
        Ok(Some(format!("{:040x}", state.commits)))
    }

    async fn checkout(&self, branch: &str) -> RecacResult<()> {
        self.record("checkout", branch)?;
        self.inner.lock().branch = Some(branch.to_string());
        Ok(())
    }

    async fn merge(&self, branch: &str) -> RecacResult<()> {
        self.record("merge", branch)
    }

    async fn fetch(&self, remote: &str, branch: &str) -> RecacResult<()> {
        self.record("fetch", format!("{remote}/{branch}"))
    }

    async fn push(&self, remote: &str, branch: &str) -> RecacResult<()> {
        self.record("push", format!("{remote}/{branch}"))
    }

    async fn delete_remote_branch(&self, remote: &str, branch: &str) -> RecacResult<()> {
        self.record("delete_remote_branch", format!("{remote}/{branch}"))
    }

    async fn abort_merge(&self) -> RecacResult<()> {
        self.record("abort_merge", "")
    }

    async fn recover_dangling_locks(&self) -> RecacResult<()> {
        self.record("recover_dangling_locks", "")
    }

    async fn clean_workdir(&self, aggressive: bool) -> RecacResult<()> {
        self.record("clean_workdir", aggressive.to_string())
    }

    async fn hard_reset(&self, reference: &str) -> RecacResult<()> {
        self.record("hard_reset", reference)
    }

    async fn configure_identity(&self, name: &str, email: &str) -> RecacResult<()> {
        self.record("configure_identity", format!("{name} <{email}>"))
    }

    async fn write_ignores(&self) -> RecacResult<()> {
        self.record("write_ignores", "")
    }

    async fn diff_stat(&self, from: &str, to: &str) -> RecacResult<String> {
        self.record("diff_stat", format!("{from}..{to}"))?;
        Ok("1 file changed".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_calls() {
        let vcs = FakeVcs::new();
        vcs.ensure_repo().await.unwrap();
        vcs.checkout("feature/x").await.unwrap();
        assert_eq!(vcs.current_branch().await.unwrap(), "feature/x");
        assert_eq!(vcs.count("checkout"), 1);
    }

    #[tokio::test]
    async fn test_scripted_failures_then_success() {
        let vcs = FakeVcs::new();
        vcs.fail_times("merge", 2);
        assert!(vcs.merge("main").await.is_err());
        assert!(vcs.merge("main").await.is_err());
        assert!(vcs.merge("main").await.is_ok());
        assert_eq!(vcs.count("merge"), 3);
    }
}
