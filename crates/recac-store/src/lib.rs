//! Persistent coordination store for the recac control plane.
//!
//! The store is the coordination authority: lifecycle state lives here, not
//! in process-wide globals or workspace files. One SQLite database per
//! deployment holds observations, signals, features, exclusive-path locks,
//! and specifications, each scoped by project id.
//!
//! Operations are serializable per key (a single connection behind a mutex),
//! and [`Store::acquire_lock`] is an atomic compare-and-set: the lock is
//! granted iff no live holder exists.

mod sqlite;

pub use sqlite::SqliteStore;

use async_trait::async_trait;
use recac_core::feature::FeatureStatus;
use recac_core::{signal, AgentRole, Observation, PathLock, RecacResult};
use std::time::Duration;

/// The store capability.
///
/// Sessions share a handle (`Arc<dyn Store>`); the parent session owns the
/// underlying resource and is the only caller of [`Store::close`], which is
/// idempotent.
#[async_trait]
pub trait Store: Send + Sync {
    /// Append an observation to the project history.
    async fn save_observation(
        &self,
        project: &str,
        role: AgentRole,
        content: &str,
    ) -> RecacResult<()>;

    /// Return up to `limit` observations, most recent first.
    async fn query_history(&self, project: &str, limit: usize) -> RecacResult<Vec<Observation>>;

    /// Read a signal value, if set.
    async fn get_signal(&self, project: &str, key: &str) -> RecacResult<Option<String>>;

    /// Set a signal value, replacing any previous value.
    async fn set_signal(&self, project: &str, key: &str, value: &str) -> RecacResult<()>;

    /// Delete a signal; deleting an absent signal is not an error.
    async fn delete_signal(&self, project: &str, key: &str) -> RecacResult<()>;

    /// Persist the feature-list JSON document for a project.
    async fn save_features(&self, project: &str, json: &str) -> RecacResult<()>;

    /// Read the feature-list JSON document, if present.
    async fn get_features(&self, project: &str) -> RecacResult<Option<String>>;

    /// Update one feature's status and passes flag inside the stored document.
    async fn update_feature_status(
        &self,
        project: &str,
        id: &str,
        status: FeatureStatus,
        passes: bool,
    ) -> RecacResult<()>;

    /// Atomically acquire a leased lock on `path` for `holder`.
    ///
    /// Returns `true` iff the lock was granted: no live holder existed, or
    /// the previous lease had expired. Re-acquiring an own live lock renews
    /// the lease and returns `true`.
    async fn acquire_lock(&self, path: &str, holder: &str, lease: Duration) -> RecacResult<bool>;

    /// Release a lock if `holder` still owns it.
    async fn release_lock(&self, path: &str, holder: &str) -> RecacResult<()>;

    /// All locks with a live lease; expired rows are swept.
    async fn get_active_locks(&self) -> RecacResult<Vec<PathLock>>;

    /// Release every lock held by `holder`.
    async fn release_all_locks(&self, holder: &str) -> RecacResult<()>;

    /// Persist the project specification text.
    async fn save_spec(&self, project: &str, content: &str) -> RecacResult<()>;

    /// Read the project specification text, if present.
    async fn get_spec(&self, project: &str) -> RecacResult<Option<String>>;

    /// Drop observations beyond the newest `keep` rows.
    async fn prune_observations(&self, project: &str, keep: usize) -> RecacResult<()>;

    /// Close the underlying resource. Idempotent; only the owner calls this.
    async fn close(&self) -> RecacResult<()>;

    /// The project's chat-thread identifier, if one was created.
    async fn get_thread(&self, project: &str) -> RecacResult<Option<String>> {
        self.get_signal(project, signal::SLACK_THREAD_TS).await
    }

    /// Persist the project's chat-thread identifier.
    async fn set_thread(&self, project: &str, ts: &str) -> RecacResult<()> {
        self.set_signal(project, signal::SLACK_THREAD_TS, ts).await
    }
}
