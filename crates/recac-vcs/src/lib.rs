//! Version-control capability.
//!
//! Sessions never shell out to `git`; they go through the [`Vcs`] trait so
//! tests can inject a recording fake. The real implementation ([`GitVcs`])
//! uses libgit2 and opens the repository per operation, which keeps the
//! handle `Send + Sync` without caching a non-`Sync` `Repository`.

mod fake;
mod git;

pub use fake::{FakeVcs, VcsCall};
pub use git::GitVcs;

use async_trait::async_trait;
use recac_core::RecacResult;

/// Ignore patterns enforced in every workspace so agent-produced artifacts
/// are never tracked.
pub const IGNORE_PATTERNS: &[&str] = &[
    ".agent_state.json",
    ".agent_state_*.json",
    ".recac.db*",
    ".qa_result",
    "blockers.txt",
    "questions.txt",
    "node_modules/",
    "target/",
    "build/",
    "dist/",
    "__pycache__/",
    "*.log",
    ".env",
    ".env.*",
];

/// The version-control capability.
#[async_trait]
pub trait Vcs: Send + Sync {
    /// Make sure the workspace is a repository; init plus an initial commit
    /// when absent.
    async fn ensure_repo(&self) -> RecacResult<()>;

    /// Name of the currently checked-out branch.
    async fn current_branch(&self) -> RecacResult<String>;

    /// Commit id of HEAD.
    async fn head_commit(&self) -> RecacResult<String>;

    /// Stage everything and commit; `None` when the tree is unchanged.
    async fn commit_all(&self, message: &str) -> RecacResult<Option<String>>;

    /// Check out `branch`, creating it from HEAD if missing.
    async fn checkout(&self, branch: &str) -> RecacResult<()>;

    /// Merge `branch` into the current branch. Conflicts are an error and
    /// leave merge state behind for [`Vcs::abort_merge`].
    async fn merge(&self, branch: &str) -> RecacResult<()>;

    /// Fetch `branch` from `remote`.
    async fn fetch(&self, remote: &str, branch: &str) -> RecacResult<()>;

    /// Push `branch` to `remote`.
    async fn push(&self, remote: &str, branch: &str) -> RecacResult<()>;

    /// Delete `branch` on `remote`.
    async fn delete_remote_branch(&self, remote: &str, branch: &str) -> RecacResult<()>;

    /// Drop in-progress merge state and restore the index to HEAD.
    async fn abort_merge(&self) -> RecacResult<()>;

    /// Remove stale lock files a crashed process may have left in `.git`.
    async fn recover_dangling_locks(&self) -> RecacResult<()>;

    /// Delete untracked files; `aggressive` also removes ignored files and
    /// untracked directories.
    async fn clean_workdir(&self, aggressive: bool) -> RecacResult<()>;

    /// `reset --hard` to the given branch (or `HEAD`).
    async fn hard_reset(&self, reference: &str) -> RecacResult<()>;

    /// Set the repository-local author identity.
    async fn configure_identity(&self, name: &str, email: &str) -> RecacResult<()>;

    /// Append missing [`IGNORE_PATTERNS`] to the workspace `.gitignore` and
    /// the repository's `info/exclude`.
    async fn write_ignores(&self) -> RecacResult<()>;

    /// Human-readable diff stat between two commit ids.
    async fn diff_stat(&self, from: &str, to: &str) -> RecacResult<String>;
}
