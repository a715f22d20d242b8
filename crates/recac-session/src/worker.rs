//! Child-session adapter for the orchestrator.
//!
//! The orchestrator executes features through the [`FeatureWorker`] seam;
//! this implementation spawns a nested [`Session`] focused on the feature
//! id, sharing the parent's store and sandbox and replying into the parent's
//! notification thread. Children never re-delegate: their agent count is
//! forced to one.

use crate::session::{Session, SessionDeps};
use async_trait::async_trait;
use recac_core::config::RecacConfig;
use recac_core::RecacResult;
use recac_orchestrator::FeatureWorker;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Runs one feature by spawning a focused child session.
pub struct ChildSessionRunner {
    config: RecacConfig,
    deps: SessionDeps,
    parent_thread: Option<String>,
}

impl ChildSessionRunner {
    /// Template for child sessions of one parent.
    pub fn new(config: RecacConfig, deps: SessionDeps, parent_thread: Option<String>) -> Self {
        Self {
            config,
            deps,
            parent_thread,
        }
    }
}

#[async_trait]
impl FeatureWorker for ChildSessionRunner {
    async fn run_feature(&self, feature_id: &str, cancel: CancellationToken) -> RecacResult<()> {
        info!(feature = feature_id, "spawning child session");

        let mut config = self.config.clone();
        config.max_agents = 1;

        let mut session = Session::new(config, self.deps.clone())
            .with_selected_task(feature_id)
            .share_resources()
            .quiet()
            .with_cancel(cancel);
        if let Some(ts) = &self.parent_thread {
            session = session.with_parent_thread(ts.clone());
        }
        session.run().await
    }
}
