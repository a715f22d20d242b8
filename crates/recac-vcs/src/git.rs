//! libgit2-backed [`Vcs`] implementation.

use crate::{Vcs, IGNORE_PATTERNS};
use async_trait::async_trait;
use git2::build::CheckoutBuilder;
use git2::{
    BranchType, Cred, DiffStatsFormat, FetchOptions, PushOptions, RemoteCallbacks, Repository,
    ResetType, Signature, StatusOptions,
};
use recac_core::{RecacError, RecacResult};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Lock files libgit2 or a crashed process can leave behind.
const DANGLING_LOCKS: &[&str] = &["index.lock", "HEAD.lock", "MERGE_HEAD.lock", "config.lock"];

/// Git implementation of the [`Vcs`] capability.
pub struct GitVcs {
    workdir: PathBuf,
}

impl GitVcs {
    /// Create a handle for the repository at `workdir`.
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// The workspace directory.
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn open(&self) -> RecacResult<Repository> {
        Repository::open(&self.workdir)
            .map_err(|e| RecacError::Vcs(format!("open {}: {e}", self.workdir.display())))
    }

    fn signature(repo: &Repository) -> RecacResult<Signature<'static>> {
        repo.signature()
            .or_else(|_| Signature::now("recac", "agent@recac.dev"))
            .map_err(|e| RecacError::Vcs(format!("signature: {e}")))
    }

    fn callbacks<'a>() -> RemoteCallbacks<'a> {
        let mut callbacks = RemoteCallbacks::new();
        callbacks.credentials(|_url, username, _allowed| {
            Cred::ssh_key_from_agent(username.unwrap_or("git")).or_else(|_| Cred::default())
        });
        callbacks
    }

    fn append_missing(path: &Path, patterns: &[&str]) -> RecacResult<()> {
        let existing = std::fs::read_to_string(path).unwrap_or_default();
        let mut additions = String::new();
        for pattern in patterns {
            if !existing.lines().any(|line| line.trim() == *pattern) {
                additions.push_str(pattern);
                additions.push('\n');
            }
        }
        if additions.is_empty() {
            return Ok(());
        }
        let mut content = existing;
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(&additions);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }
}

fn vcs_err(context: &str, e: git2::Error) -> RecacError {
    RecacError::Vcs(format!("{context}: {e}"))
}

#[async_trait]
impl Vcs for GitVcs {
    async fn ensure_repo(&self) -> RecacResult<()> {
        if Repository::open(&self.workdir).is_ok() {
            return Ok(());
        }
        info!(workdir = %self.workdir.display(), "initializing repository");
        let repo = Repository::init(&self.workdir)
            .map_err(|e| vcs_err("init", e))?;

        let sig = Self::signature(&repo)?;
        let tree_id = {
            let mut index = repo.index().map_err(|e| vcs_err("index", e))?;
            index
                .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
                .map_err(|e| vcs_err("add_all", e))?;
            index.write().map_err(|e| vcs_err("index write", e))?;
            index.write_tree().map_err(|e| vcs_err("write_tree", e))?
        };
        let tree = repo.find_tree(tree_id).map_err(|e| vcs_err("find_tree", e))?;
        repo.commit(Some("HEAD"), &sig, &sig, "Initial commit", &tree, &[])
            .map_err(|e| vcs_err("initial commit", e))?;
        Ok(())
    }

    async fn current_branch(&self) -> RecacResult<String> {
        let repo = self.open()?;
        let head = repo.head().map_err(|e| vcs_err("head", e))?;
        head.shorthand()
            .map(ToString::to_string)
            .ok_or_else(|| RecacError::Vcs("detached HEAD".into()))
    }

    async fn head_commit(&self) -> RecacResult<String> {
        let repo = self.open()?;
        let head = repo.head().map_err(|e| vcs_err("head", e))?;
        let commit = head.peel_to_commit().map_err(|e| vcs_err("peel", e))?;
        Ok(commit.id().to_string())
    }

    async fn commit_all(&self, message: &str) -> RecacResult<Option<String>> {
        let repo = self.open()?;
        let mut index = repo.index().map_err(|e| vcs_err("index", e))?;
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .map_err(|e| vcs_err("add_all", e))?;
        index.write().map_err(|e| vcs_err("index write", e))?;
        let tree_id = index.write_tree().map_err(|e| vcs_err("write_tree", e))?;

        let parent = repo
            .head()
            .ok()
            .and_then(|h| h.peel_to_commit().ok());
        if let Some(parent) = &parent {
            if parent.tree_id() == tree_id {
                debug!("nothing to commit");
                return Ok(None);
            }
        }

        let tree = repo.find_tree(tree_id).map_err(|e| vcs_err("find_tree", e))?;
        let sig = Self::signature(&repo)?;
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let oid = repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
            .map_err(|e| vcs_err("commit", e))?;
        Ok(Some(oid.to_string()))
    }

    async fn checkout(&self, branch: &str) -> RecacResult<()> {
        let repo = self.open()?;
        if repo.find_branch(branch, BranchType::Local).is_err() {
            let head = repo
                .head()
                .and_then(|h| h.peel_to_commit())
                .map_err(|e| vcs_err("head", e))?;
            repo.branch(branch, &head, false)
                .map_err(|e| vcs_err("branch", e))?;
        }
        let refname = format!("refs/heads/{branch}");
        let obj = repo
            .revparse_single(&refname)
            .map_err(|e| vcs_err("revparse", e))?;
        repo.checkout_tree(&obj, Some(CheckoutBuilder::new().safe()))
            .map_err(|e| vcs_err("checkout_tree", e))?;
        repo.set_head(&refname).map_err(|e| vcs_err("set_head", e))?;
        Ok(())
    }

    async fn merge(&self, branch: &str) -> RecacResult<()> {
        let repo = self.open()?;
        let reference = repo
            .find_branch(branch, BranchType::Local)
            .map(|b| b.into_reference())
            .or_else(|_| repo.find_reference(&format!("refs/remotes/{branch}")))
            .map_err(|e| vcs_err("find branch", e))?;
        let annotated = repo
            .reference_to_annotated_commit(&reference)
            .map_err(|e| vcs_err("annotated", e))?;

        let (analysis, _) = repo
            .merge_analysis(&[&annotated])
            .map_err(|e| vcs_err("merge_analysis", e))?;

        if analysis.is_up_to_date() {
            return Ok(());
        }

        if analysis.is_fast_forward() {
            let mut head = repo.head().map_err(|e| vcs_err("head", e))?;
            head.set_target(annotated.id(), "fast-forward")
                .map_err(|e| vcs_err("fast-forward", e))?;
            repo.checkout_head(Some(CheckoutBuilder::new().force()))
                .map_err(|e| vcs_err("checkout_head", e))?;
            return Ok(());
        }

        repo.merge(&[&annotated], None, None)
            .map_err(|e| vcs_err("merge", e))?;

        let mut index = repo.index().map_err(|e| vcs_err("index", e))?;
        if index.has_conflicts() {
            return Err(RecacError::Vcs(format!("merge of {branch} has conflicts")));
        }

        let tree_id = index.write_tree_to(&repo).map_err(|e| vcs_err("write_tree", e))?;
        let tree = repo.find_tree(tree_id).map_err(|e| vcs_err("find_tree", e))?;
        let sig = Self::signature(&repo)?;
        let head_commit = repo
            .head()
            .and_then(|h| h.peel_to_commit())
            .map_err(|e| vcs_err("head", e))?;
        let merged_commit = repo
            .find_commit(annotated.id())
            .map_err(|e| vcs_err("find_commit", e))?;
        repo.commit(
            Some("HEAD"),
            &sig,
            &sig,
            &format!("Merge {branch}"),
            &tree,
            &[&head_commit, &merged_commit],
        )
        .map_err(|e| vcs_err("merge commit", e))?;
        repo.cleanup_state().map_err(|e| vcs_err("cleanup_state", e))?;
        Ok(())
    }

    async fn fetch(&self, remote: &str, branch: &str) -> RecacResult<()> {
        let repo = self.open()?;
        let mut remote = repo
            .find_remote(remote)
            .map_err(|e| vcs_err("find_remote", e))?;
        let mut options = FetchOptions::new();
        options.remote_callbacks(Self::callbacks());
        remote
            .fetch(&[branch], Some(&mut options), None)
            .map_err(|e| vcs_err("fetch", e))?;
        Ok(())
    }

    async fn push(&self, remote: &str, branch: &str) -> RecacResult<()> {
        let repo = self.open()?;
        let mut remote = repo
            .find_remote(remote)
            .map_err(|e| vcs_err("find_remote", e))?;
        let mut options = PushOptions::new();
        options.remote_callbacks(Self::callbacks());
        let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
        remote
            .push(&[&refspec], Some(&mut options))
            .map_err(|e| vcs_err("push", e))?;
        Ok(())
    }

    async fn delete_remote_branch(&self, remote: &str, branch: &str) -> RecacResult<()> {
        let repo = self.open()?;
        let mut remote = repo
            .find_remote(remote)
            .map_err(|e| vcs_err("find_remote", e))?;
        let mut options = PushOptions::new();
        options.remote_callbacks(Self::callbacks());
        // an empty source side deletes the remote ref
        let refspec = format!(":refs/heads/{branch}");
        remote
            .push(&[&refspec], Some(&mut options))
            .map_err(|e| vcs_err("delete remote branch", e))?;
        Ok(())
    }

    async fn abort_merge(&self) -> RecacResult<()> {
        let repo = self.open()?;
        repo.cleanup_state().map_err(|e| vcs_err("cleanup_state", e))?;
        if let Ok(head) = repo.head().and_then(|h| h.peel_to_commit()) {
            repo.reset(head.as_object(), ResetType::Hard, None)
                .map_err(|e| vcs_err("reset", e))?;
        }
        Ok(())
    }

    async fn recover_dangling_locks(&self) -> RecacResult<()> {
        let repo = self.open()?;
        let git_dir = repo.path().to_path_buf();
        for lock in DANGLING_LOCKS {
            let path = git_dir.join(lock);
            if path.exists() {
                warn!(lock = %path.display(), "removing dangling lock file");
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    async fn clean_workdir(&self, aggressive: bool) -> RecacResult<()> {
        let repo = self.open()?;
        let workdir = repo
            .workdir()
            .ok_or_else(|| RecacError::Vcs("bare repository".into()))?
            .to_path_buf();

        let mut options = StatusOptions::new();
        options
            .include_untracked(true)
            .include_ignored(aggressive)
            .recurse_untracked_dirs(true);
        let statuses = repo
            .statuses(Some(&mut options))
            .map_err(|e| vcs_err("statuses", e))?;

        for entry in statuses.iter() {
            let status = entry.status();
            let removable = status.is_wt_new() || (aggressive && status.is_ignored());
            if !removable {
                continue;
            }
            let Some(rel) = entry.path() else { continue };
            let path = workdir.join(rel);
            if path.is_dir() {
                let _ = std::fs::remove_dir_all(&path);
            } else {
                let _ = std::fs::remove_file(&path);
            }
        }
        Ok(())
    }

    async fn hard_reset(&self, reference: &str) -> RecacResult<()> {
        let repo = self.open()?;
        let target = if reference == "HEAD" {
            repo.head()
                .and_then(|h| h.peel_to_commit())
                .map_err(|e| vcs_err("head", e))?
        } else {
            repo.revparse_single(&format!("refs/heads/{reference}"))
                .and_then(|obj| obj.peel_to_commit())
                .map_err(|e| vcs_err("revparse", e))?
        };
        repo.reset(target.as_object(), ResetType::Hard, None)
            .map_err(|e| vcs_err("reset", e))?;
        Ok(())
    }

    async fn configure_identity(&self, name: &str, email: &str) -> RecacResult<()> {
        let repo = self.open()?;
        let mut config = repo.config().map_err(|e| vcs_err("config", e))?;
        config
            .set_str("user.name", name)
            .map_err(|e| vcs_err("user.name", e))?;
        config
            .set_str("user.email", email)
            .map_err(|e| vcs_err("user.email", e))?;
        Ok(())
    }

    async fn write_ignores(&self) -> RecacResult<()> {
        let repo = self.open()?;
        let workdir = repo
            .workdir()
            .ok_or_else(|| RecacError::Vcs("bare repository".into()))?;
        Self::append_missing(&workdir.join(".gitignore"), IGNORE_PATTERNS)?;
        Self::append_missing(&repo.path().join("info/exclude"), IGNORE_PATTERNS)?;
        Ok(())
    }

    async fn diff_stat(&self, from: &str, to: &str) -> RecacResult<String> {
        let repo = self.open()?;
        let from_tree = repo
            .revparse_single(from)
            .and_then(|o| o.peel_to_commit())
            .map_err(|e| vcs_err("revparse from", e))?
            .tree()
            .map_err(|e| vcs_err("tree", e))?;
        let to_tree = repo
            .revparse_single(to)
            .and_then(|o| o.peel_to_commit())
            .map_err(|e| vcs_err("revparse to", e))?
            .tree()
            .map_err(|e| vcs_err("tree", e))?;
        let diff = repo
            .diff_tree_to_tree(Some(&from_tree), Some(&to_tree), None)
            .map_err(|e| vcs_err("diff", e))?;
        let stats = diff.stats().map_err(|e| vcs_err("stats", e))?;
        let buf = stats
            .to_buf(DiffStatsFormat::FULL, 80)
            .map_err(|e| vcs_err("stats buf", e))?;
        Ok(buf.as_str().unwrap_or_default().to_string())
    }
}
