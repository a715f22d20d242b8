//! Multi-agent orchestration for recac.
//!
//! Four pieces build on each other:
//!
//! - [`TaskGraph`] — DAG of feature tasks with statuses and exclusive paths.
//! - [`WorkerPool`] — bounded-parallelism executor with a notifier hook.
//! - [`DependencyExecutor`] — one-shot graph run honoring dependencies.
//! - [`Orchestrator`] — the long-lived dispatcher: graph refresh from the
//!   store, path-lock claiming, retries, and the lifecycle barrier.

mod executor;
mod orchestrator;
mod task_graph;
mod worker_pool;

pub use executor::{DependencyExecutor, TaskFn};
pub use orchestrator::{FeatureWorker, Orchestrator, OrchestratorConfig};
pub use task_graph::{TaskGraph, TaskNode, TaskStatus};
pub use worker_pool::{PoolTask, WorkerNotifier, WorkerPool};
