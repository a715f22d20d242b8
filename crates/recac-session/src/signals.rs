//! Typed signal access with legacy filesystem migration.
//!
//! The store is the only authority for privileged signals: a workspace file
//! named after one is ignored (and logged), so an agent cannot manufacture
//! lifecycle progress by touching a file. Unprivileged signal files left by
//! older agents are migrated into the store and removed on first sight.

use recac_core::{signal, RecacResult};
use recac_store::Store;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Project-scoped signal access over a shared store.
#[derive(Clone)]
pub struct SignalLayer {
    store: Arc<dyn Store>,
    project: String,
    workspace: PathBuf,
}

impl SignalLayer {
    /// Signal layer for one project and its workspace.
    pub fn new(store: Arc<dyn Store>, project: impl Into<String>, workspace: PathBuf) -> Self {
        Self {
            store,
            project: project.into(),
            workspace,
        }
    }

    /// Whether `name` is set.
    ///
    /// Checks the store first. When absent, a workspace file of the same
    /// name counts only for unprivileged signals, and is migrated into the
    /// store (value `"true"`) and deleted.
    pub async fn has(&self, name: &str) -> RecacResult<bool> {
        if self.store.get_signal(&self.project, name).await?.is_some() {
            return Ok(true);
        }

        let file = self.workspace.join(name);
        if !file.exists() {
            return Ok(false);
        }

        if signal::is_privileged(name) {
            warn!(
                signal = name,
                file = %file.display(),
                "ignoring workspace file for privileged signal"
            );
            return Ok(false);
        }

        info!(signal = name, "migrating legacy signal file into store");
        self.store.set_signal(&self.project, name, "true").await?;
        std::fs::remove_file(&file)?;
        Ok(true)
    }

    /// The signal's stored value, if set (no file fallback).
    pub async fn value(&self, name: &str) -> RecacResult<Option<String>> {
        self.store.get_signal(&self.project, name).await
    }

    /// Set `name` in the store. Files are never written.
    pub async fn create(&self, name: &str) -> RecacResult<()> {
        self.store.set_signal(&self.project, name, "true").await
    }

    /// Clear `name` from the store and remove any lingering workspace file.
    pub async fn clear(&self, name: &str) -> RecacResult<()> {
        self.store.delete_signal(&self.project, name).await?;
        let file = self.workspace.join(name);
        if file.exists() {
            std::fs::remove_file(&file)?;
        }
        Ok(())
    }

    /// The project this layer is scoped to.
    pub fn project(&self) -> &str {
        &self.project
    }
}
