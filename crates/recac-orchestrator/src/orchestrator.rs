//! Long-lived multi-agent dispatcher.
//!
//! The orchestrator owns a task graph and a worker pool, refreshes the graph
//! from the store-held feature list, claims ready tasks whose exclusive
//! paths are free, and runs each through the [`FeatureWorker`] seam (the
//! session crate plugs child sessions in there). Lifecycle signals form a
//! strict barrier: once one is observed no further work is submitted and the
//! pool drains before return.

use crate::task_graph::{TaskGraph, TaskStatus};
use crate::worker_pool::{PoolTask, WorkerNotifier, WorkerPool};
use async_trait::async_trait;
use futures_util::FutureExt;
use recac_core::{signal, RecacError, RecacResult};
use recac_store::Store;
use recac_vcs::Vcs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Seam through which the orchestrator executes one feature.
///
/// The session crate implements this by spawning a nested session focused on
/// the feature id.
#[async_trait]
pub trait FeatureWorker: Send + Sync {
    /// Run the feature to completion or error.
    async fn run_feature(&self, feature_id: &str, cancel: CancellationToken) -> RecacResult<()>;
}

/// Orchestrator tuning knobs.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Project identifier used for store scoping.
    pub project: String,
    /// Upper bound on parallel agents.
    pub max_agents: usize,
    /// Tick-loop interval.
    pub tick_interval: Duration,
    /// Per-task retry budget.
    pub max_retries: u32,
    /// Exclusive-path lock lease.
    pub lock_lease: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            project: String::new(),
            max_agents: 1,
            tick_interval: Duration::from_secs(1),
            max_retries: 3,
            lock_lease: Duration::from_secs(60),
        }
    }
}

/// Dependency-aware dispatcher over a worker pool.
pub struct Orchestrator {
    config: OrchestratorConfig,
    store: Arc<dyn Store>,
    vcs: Arc<dyn Vcs>,
    worker: Arc<dyn FeatureWorker>,
    graph: Arc<RwLock<TaskGraph>>,
    cancel: CancellationToken,
    contention: Arc<AtomicU64>,
    notifier: parking_lot::Mutex<Option<WorkerNotifier>>,
}

impl Orchestrator {
    /// Build an orchestrator over shared capabilities.
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn Store>,
        vcs: Arc<dyn Vcs>,
        worker: Arc<dyn FeatureWorker>,
    ) -> Self {
        Self {
            config,
            store,
            vcs,
            worker,
            graph: Arc::new(RwLock::new(TaskGraph::new())),
            cancel: CancellationToken::new(),
            contention: Arc::new(AtomicU64::new(0)),
            notifier: parking_lot::Mutex::new(None),
        }
    }

    /// Install a worker-success notifier before `run`.
    pub fn set_notifier(&self, notifier: WorkerNotifier) {
        *self.notifier.lock() = Some(notifier);
    }

    /// Request cooperative cancellation of the current run.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// The shared task graph.
    pub fn graph(&self) -> Arc<RwLock<TaskGraph>> {
        self.graph.clone()
    }

    /// Number of lock-contention incidents observed so far.
    pub fn contention_count(&self) -> u64 {
        self.contention.load(Ordering::SeqCst)
    }

    /// Refresh the graph from the store-held feature list.
    async fn refresh_graph(&self) -> RecacResult<()> {
        let Some(json) = self.store.get_features(&self.config.project).await? else {
            return Ok(());
        };
        let list = recac_core::feature::FeatureList::from_json(&json)?;
        self.graph.write().await.merge_features(&list);
        Ok(())
    }

    /// First lifecycle barrier signal currently set, if any.
    async fn barrier_signal(&self) -> RecacResult<Option<&'static str>> {
        for key in signal::BARRIER {
            if self
                .store
                .get_signal(&self.config.project, key)
                .await?
                .is_some()
            {
                return Ok(Some(key));
            }
        }
        Ok(None)
    }

    /// Whether every exclusive path is free against the union of live store
    /// locks and in-memory paths of in-progress tasks.
    async fn can_acquire_immediate(&self, paths: &[String]) -> RecacResult<bool> {
        if paths.is_empty() {
            return Ok(true);
        }
        let held: Vec<String> = self
            .store
            .get_active_locks()
            .await?
            .into_iter()
            .map(|l| l.path)
            .collect();
        let in_memory = self.graph.read().await.in_progress_paths();
        Ok(paths
            .iter()
            .all(|p| !held.contains(p) && !in_memory.contains(p)))
    }

    /// Run one barrier-terminated sprint over the current feature list.
    pub async fn run(&self) -> RecacResult<()> {
        self.vcs.ensure_repo().await?;
        self.refresh_graph().await?;

        // one-shot concurrency clamp: no point starting more workers than
        // there are initially-ready tasks
        let initially_ready = self.graph.read().await.ready_tasks().len();
        let pool_size = self.config.max_agents.min(initially_ready.max(1));
        if pool_size < self.config.max_agents {
            info!(
                configured = self.config.max_agents,
                clamped = pool_size,
                "clamping worker pool to initially-ready task count"
            );
        }
        let pool = Arc::new(WorkerPool::new(pool_size));
        if let Some(notifier) = self.notifier.lock().clone() {
            pool.set_notifier(notifier);
        }
        pool.start().await;

        let result = self.tick_loop(&pool).await;
        pool.wait().await;
        pool.stop().await;
        result
    }

    async fn tick_loop(&self, pool: &Arc<WorkerPool>) -> RecacResult<()> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(RecacError::Cancelled);
            }

            let (pending, ready_count, in_progress, failed, total) = {
                let graph = self.graph.read().await;
                (
                    graph.count(TaskStatus::Pending),
                    graph.count(TaskStatus::Ready),
                    graph.count(TaskStatus::InProgress),
                    graph.count(TaskStatus::Failed),
                    graph.len(),
                )
            };

            if total > 2 && failed * 2 > total {
                warn!(failed, total, "high failure rate, requesting manager review");
                self.store
                    .set_signal(&self.config.project, signal::TRIGGER_MANAGER, "true")
                    .await?;
            }

            if pending + ready_count + in_progress == 0 {
                if failed > 0 {
                    self.store
                        .set_signal(&self.config.project, signal::TRIGGER_MANAGER, "true")
                        .await?;
                }
                info!(total, failed, "all tasks terminal, orchestrator done");
                return Ok(());
            }

            if let Some(key) = self.barrier_signal().await? {
                info!(signal = key, "lifecycle barrier reached, draining pool");
                return Ok(());
            }

            self.refresh_graph().await?;

            // deadlock guard: work remains but nothing can ever become ready
            let ready = {
                let graph = self.graph.read().await;
                graph.ready_tasks()
            };
            if pending > 0 && ready.is_empty() && in_progress == 0 {
                warn!(pending, "no ready or running tasks, failing pending tasks");
                let mut graph = self.graph.write().await;
                let pending_ids: Vec<String> = graph
                    .ids()
                    .iter()
                    .filter(|id| {
                        graph
                            .get(id)
                            .map(|n| n.status == TaskStatus::Pending)
                            .unwrap_or(false)
                    })
                    .cloned()
                    .collect();
                for id in pending_ids {
                    graph.mark_status(&id, TaskStatus::Failed, Some("dependency failure".into()));
                }
                continue;
            }

            for id in ready {
                let paths = {
                    let graph = self.graph.read().await;
                    match graph.get(&id) {
                        Some(node) => node.exclusive_paths.clone(),
                        None => continue,
                    }
                };
                if !self.can_acquire_immediate(&paths).await? {
                    continue;
                }
                self.graph
                    .write()
                    .await
                    .mark_status(&id, TaskStatus::InProgress, None);
                self.submit_task(pool, id).await?;
            }

            tokio::select! {
                () = self.cancel.cancelled() => return Err(RecacError::Cancelled),
                () = tokio::time::sleep(self.config.tick_interval) => {}
            }
        }
    }

    async fn submit_task(&self, pool: &Arc<WorkerPool>, id: String) -> RecacResult<()> {
        let store = self.store.clone();
        let graph = self.graph.clone();
        let worker = self.worker.clone();
        let config = self.config.clone();
        let cancel = self.cancel.clone();
        let contention = self.contention.clone();
        let label = format!("feature:{id}");

        let future = async move {
            Self::execute_task(id, store, graph, worker, config, cancel, contention).await
        }
        .boxed();

        pool.submit(PoolTask::new(label, future)).await
    }

    async fn execute_task(
        id: String,
        store: Arc<dyn Store>,
        graph: Arc<RwLock<TaskGraph>>,
        worker: Arc<dyn FeatureWorker>,
        config: OrchestratorConfig,
        cancel: CancellationToken,
        contention: Arc<AtomicU64>,
    ) -> RecacResult<()> {
        let holder = format!("agent-{id}");
        let paths = {
            let graph = graph.read().await;
            match graph.get(&id) {
                Some(node) => node.exclusive_paths.clone(),
                None => return Ok(()),
            }
        };

        // acquire in list order; all-or-nothing avoids hold-and-wait
        let mut acquired = Vec::new();
        for path in &paths {
            if store.acquire_lock(path, &holder, config.lock_lease).await? {
                acquired.push(path.clone());
            } else {
                contention.fetch_add(1, Ordering::SeqCst);
                warn!(task = %id, path = %path, "lock contention, resetting task to pending");
                for held in &acquired {
                    store.release_lock(held, &holder).await?;
                }
                graph
                    .write()
                    .await
                    .mark_status(&id, TaskStatus::Pending, None);
                return Ok(());
            }
        }

        // claim may have been superseded by a graph refresh
        let still_claimed = graph
            .read()
            .await
            .get(&id)
            .map(|n| n.status == TaskStatus::InProgress)
            .unwrap_or(false);
        if !still_claimed {
            store.release_all_locks(&holder).await?;
            return Ok(());
        }

        let result = worker.run_feature(&id, cancel).await;

        let outcome = match result {
            Ok(()) => {
                graph.write().await.mark_status(&id, TaskStatus::Done, None);
                Ok(())
            }
            Err(e) => {
                let retries = graph.write().await.increment_retry(&id);
                if retries < config.max_retries {
                    warn!(task = %id, retries, error = %e, "task failed, will retry");
                    graph
                        .write()
                        .await
                        .mark_status(&id, TaskStatus::Pending, None);
                } else {
                    warn!(task = %id, retries, error = %e, "task failed permanently");
                    graph
                        .write()
                        .await
                        .mark_status(&id, TaskStatus::Failed, Some(e.to_string()));
                    if let Err(store_err) = store
                        .update_feature_status(
                            &config.project,
                            &id,
                            recac_core::feature::FeatureStatus::Failed,
                            false,
                        )
                        .await
                    {
                        warn!(task = %id, error = %store_err, "could not record feature failure");
                    }
                }
                Err(e)
            }
        };

        store.release_all_locks(&holder).await?;
        outcome
    }
}
