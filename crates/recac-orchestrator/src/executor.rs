//! Single-run execution of a [`TaskGraph`].
//!
//! The executor walks the graph in topological order, submits ready tasks to
//! the worker pool, propagates prerequisite failures to dependents, and
//! rescans on a short ticker until every task is terminal. The prerequisite
//! check and the submission mark happen under one mutex, which is what
//! upholds the edge ordering guarantee.

use crate::task_graph::{TaskGraph, TaskStatus};
use crate::worker_pool::{PoolTask, WorkerPool};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use recac_core::{RecacError, RecacResult};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Task function registered per feature id.
pub type TaskFn =
    Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, RecacResult<()>> + Send + Sync>;

/// Interval between rescans for newly-ready tasks.
const SCAN_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq)]
enum LocalStatus {
    InProgress,
    Done,
    Failed(String),
}

struct ExecState {
    status: HashMap<String, LocalStatus>,
    submitted: HashSet<String>,
}

/// Outcome of claiming a task under the state lock, decided entirely
/// synchronously so the `parking_lot` guard never needs to be held across
/// an `.await`.
enum Claim {
    Skip,
    MarkFailed(String),
    Run(TaskFn),
}

/// Runs a task graph to completion once, honoring dependencies.
pub struct DependencyExecutor {
    graph: Arc<RwLock<TaskGraph>>,
    pool: Arc<WorkerPool>,
    tasks: parking_lot::Mutex<HashMap<String, TaskFn>>,
    cancel: CancellationToken,
}

impl DependencyExecutor {
    /// Executor over a shared graph and pool.
    pub fn new(graph: Arc<RwLock<TaskGraph>>, pool: Arc<WorkerPool>) -> Self {
        Self {
            graph,
            pool,
            tasks: parking_lot::Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Register the function to run for a task id.
    pub fn register(&self, id: impl Into<String>, task: TaskFn) {
        self.tasks.lock().insert(id.into(), task);
    }

    /// Request cancellation; running tasks observe the token and return.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// The cancellation token handed to task functions.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The shared graph this executor drives.
    pub fn graph(&self) -> Arc<RwLock<TaskGraph>> {
        self.graph.clone()
    }

    /// Execute the graph. Returns an aggregate error if any task failed.
    pub async fn execute(&self) -> RecacResult<()> {
        let order = {
            let graph = self.graph.read().await;
            graph.topological_sort()?
        };

        let state = Arc::new(parking_lot::Mutex::new(ExecState {
            status: HashMap::new(),
            submitted: HashSet::new(),
        }));

        let mut ticker = tokio::time::interval(SCAN_INTERVAL);
        loop {
            for id in &order {
                self.check_and_submit(id, &order, &state).await?;
            }

            let terminal = {
                let state = state.lock();
                order.iter().all(|id| {
                    matches!(
                        state.status.get(id),
                        Some(LocalStatus::Done | LocalStatus::Failed(_))
                    )
                })
            };
            if terminal {
                break;
            }
            if self.cancel.is_cancelled() {
                self.pool.wait().await;
                return Err(RecacError::Cancelled);
            }
            ticker.tick().await;
        }

        let failures: Vec<String> = {
            let state = state.lock();
            order
                .iter()
                .filter_map(|id| match state.status.get(id) {
                    Some(LocalStatus::Failed(reason)) => Some(format!("{id}: {reason}")),
                    _ => None,
                })
                .collect()
        };
        if failures.is_empty() {
            Ok(())
        } else {
            Err(RecacError::Orchestrator(format!(
                "{} task(s) failed: {}",
                failures.len(),
                failures.join("; ")
            )))
        }
    }

    async fn check_and_submit(
        &self,
        id: &str,
        order: &[String],
        state: &Arc<parking_lot::Mutex<ExecState>>,
    ) -> RecacResult<()> {
        let prereqs = {
            let graph = self.graph.read().await;
            match graph.get(id) {
                Some(node) => node
                    .prerequisites
                    .iter()
                    .filter(|p| order.contains(p))
                    .cloned()
                    .collect::<Vec<_>>(),
                None => return Ok(()),
            }
        };

        // check and claim under one lock so no dependent can start before
        // its prerequisites are terminal
        let claim = {
            let mut state = state.lock();
            if state.submitted.contains(id)
                || matches!(
                    state.status.get(id),
                    Some(LocalStatus::Done | LocalStatus::Failed(_))
                )
            {
                Claim::Skip
            } else if let Some(failed) = prereqs.iter().find(|p| {
                matches!(state.status.get(p.as_str()), Some(LocalStatus::Failed(_)))
            }) {
                let reason = format!("dependency {failed} failed");
                state.status.insert(id.to_string(), LocalStatus::Failed(reason.clone()));
                state.submitted.insert(id.to_string());
                Claim::MarkFailed(reason)
            } else if !prereqs
                .iter()
                .all(|p| matches!(state.status.get(p.as_str()), Some(LocalStatus::Done)))
            {
                Claim::Skip
            } else {
                state.submitted.insert(id.to_string());
                match self.tasks.lock().get(id).cloned() {
                    Some(task_fn) => {
                        state.status.insert(id.to_string(), LocalStatus::InProgress);
                        Claim::Run(task_fn)
                    }
                    None => {
                        // nothing registered: treat as already satisfied
                        debug!(task = id, "no task function registered, skipping");
                        state.status.insert(id.to_string(), LocalStatus::Done);
                        Claim::Skip
                    }
                }
            }
        };

        let task_fn = match claim {
            Claim::Skip => return Ok(()),
            Claim::MarkFailed(reason) => {
                let mut graph = self.graph.write().await;
                graph.mark_status(id, TaskStatus::Failed, Some(reason));
                return Ok(());
            }
            Claim::Run(task_fn) => task_fn,
        };

        {
            let mut graph = self.graph.write().await;
            graph.mark_status(id, TaskStatus::InProgress, None);
        }

        let task_id = id.to_string();
        let label = task_id.clone();
        let state = state.clone();
        let graph = self.graph.clone();
        let cancel = self.cancel.clone();
        let future = async move {
            let result = task_fn(cancel).await;
            let (local, graph_status, error) = match &result {
                Ok(()) => (LocalStatus::Done, TaskStatus::Done, None),
                Err(e) => {
                    warn!(task = %task_id, error = %e, "task failed");
                    (
                        LocalStatus::Failed(e.to_string()),
                        TaskStatus::Failed,
                        Some(e.to_string()),
                    )
                }
            };
            state.lock().status.insert(task_id.clone(), local);
            graph.write().await.mark_status(&task_id, graph_status, error);
            result
        }
        .boxed();

        self.pool.submit(PoolTask::new(label, future)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn recording_task(
        id: &str,
        log: Arc<Mutex<Vec<String>>>,
        fail: bool,
    ) -> TaskFn {
        let id = id.to_string();
        Arc::new(move |_cancel| {
            let id = id.clone();
            let log = log.clone();
            let fail = fail;
            async move {
                log.lock().push(id.clone());
                if fail {
                    Err(RecacError::Orchestrator(format!("{id} exploded")))
                } else {
                    Ok(())
                }
            }
            .boxed()
        })
    }

    async fn setup(graph: TaskGraph, workers: usize) -> (DependencyExecutor, Arc<WorkerPool>) {
        let pool = Arc::new(WorkerPool::new(workers));
        pool.start().await;
        let executor = DependencyExecutor::new(Arc::new(RwLock::new(graph)), pool.clone());
        (executor, pool)
    }

    #[tokio::test]
    async fn test_prerequisites_complete_before_dependents() {
        let mut graph = TaskGraph::new();
        graph.add_node("a", "", vec![]);
        graph.add_node("b", "", vec!["a".into()]);
        graph.add_node("c", "", vec!["b".into()]);

        let (executor, pool) = setup(graph, 4).await;
        let log = Arc::new(Mutex::new(Vec::new()));
        for id in ["a", "b", "c"] {
            executor.register(id, recording_task(id, log.clone(), false));
        }

        executor.execute().await.unwrap();
        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_cycle_is_rejected() {
        let mut graph = TaskGraph::new();
        graph.add_node("1", "", vec!["3".into()]);
        graph.add_node("2", "", vec!["1".into()]);
        graph.add_node("3", "", vec!["2".into()]);

        let (executor, pool) = setup(graph, 1).await;
        let err = executor.execute().await.unwrap_err();
        assert!(err.to_string().contains("circular dependency"));
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_failure_propagates_to_dependents() {
        let mut graph = TaskGraph::new();
        graph.add_node("a", "", vec![]);
        graph.add_node("b", "", vec!["a".into()]);
        graph.add_node("c", "", vec!["b".into()]);

        let (executor, pool) = setup(graph, 2).await;
        let log = Arc::new(Mutex::new(Vec::new()));
        executor.register("a", recording_task("a", log.clone(), true));
        executor.register("b", recording_task("b", log.clone(), false));
        executor.register("c", recording_task("c", log.clone(), false));

        let err = executor.execute().await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("a exploded"));
        assert!(message.contains("dependency a failed"));
        // only a ever ran
        assert_eq!(*log.lock(), vec!["a"]);

        let graph = executor.graph();
        let graph = graph.read().await;
        assert_eq!(graph.get("b").unwrap().status, TaskStatus::Failed);
        assert_eq!(
            graph.get("c").unwrap().error.as_deref(),
            Some("dependency b failed")
        );
        drop(graph);
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_missing_task_function_is_skipped_as_done() {
        let mut graph = TaskGraph::new();
        graph.add_node("a", "", vec![]);
        graph.add_node("b", "", vec!["a".into()]);

        let (executor, pool) = setup(graph, 1).await;
        let log = Arc::new(Mutex::new(Vec::new()));
        // nothing registered for a; b still runs
        executor.register("b", recording_task("b", log.clone(), false));

        executor.execute().await.unwrap();
        assert_eq!(*log.lock(), vec!["b"]);
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_independent_tasks_run_in_parallel() {
        let mut graph = TaskGraph::new();
        for id in ["a", "b", "c", "d"] {
            graph.add_node(id, "", vec![]);
        }

        let (executor, pool) = setup(graph, 4).await;
        let running = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let peak = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        for id in ["a", "b", "c", "d"] {
            let running = running.clone();
            let peak = peak.clone();
            executor.register(
                id,
                Arc::new(move |_cancel| {
                    let running = running.clone();
                    let peak = peak.clone();
                    async move {
                        let now = running.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                        peak.fetch_max(now, std::sync::atomic::Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        running.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                        Ok(())
                    }
                    .boxed()
                }),
            );
        }

        executor.execute().await.unwrap();
        assert!(peak.load(std::sync::atomic::Ordering::SeqCst) >= 2);
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_stop_cancels_promptly() {
        let mut graph = TaskGraph::new();
        graph.add_node("slow", "", vec![]);
        graph.add_node("never", "", vec!["slow".into()]);

        let (executor, pool) = setup(graph, 1).await;
        let executor = Arc::new(executor);
        executor.register(
            "slow",
            Arc::new(move |cancel: CancellationToken| {
                async move {
                    cancel.cancelled().await;
                    Err(RecacError::Cancelled)
                }
                .boxed()
            }),
        );

        let runner = executor.clone();
        let handle = tokio::spawn(async move { runner.execute().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        executor.stop();

        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_err());
        pool.stop().await;
    }
}
