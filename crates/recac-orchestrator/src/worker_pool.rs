//! Bounded-parallelism task executor.
//!
//! N workers drain a bounded channel of boxed task futures. Task errors are
//! logged, never propagated through `submit`; successful tasks invoke the
//! current notifier with the worker id. The notifier sits behind a
//! read-write lock so it can be hot-swapped while submissions are in
//! flight. Submitting to a stopped pool is an explicit `pool closed` error.

use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use recac_core::{RecacError, RecacResult};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, error};

/// A unit of work: a label for logging plus the future to drive.
pub struct PoolTask {
    /// Short label used in worker logs.
    pub label: String,
    /// The work itself.
    pub future: BoxFuture<'static, RecacResult<()>>,
}

impl PoolTask {
    /// Wrap a future with a label.
    pub fn new(label: impl Into<String>, future: BoxFuture<'static, RecacResult<()>>) -> Self {
        Self {
            label: label.into(),
            future,
        }
    }
}

/// Callback invoked with the worker id after each successful task.
pub type WorkerNotifier = Arc<dyn Fn(usize) + Send + Sync>;

struct PoolState {
    active: AtomicUsize,
    submitted: AtomicUsize,
    finished: AtomicUsize,
    done: Notify,
    notifier: RwLock<Option<WorkerNotifier>>,
}

/// Fixed-size worker pool over a bounded task channel.
pub struct WorkerPool {
    workers: usize,
    tx: parking_lot::Mutex<Option<mpsc::Sender<PoolTask>>>,
    rx: Mutex<Option<mpsc::Receiver<PoolTask>>>,
    handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    state: Arc<PoolState>,
}

impl WorkerPool {
    /// Pool with `workers` workers and a channel capacity of
    /// `max(100, 10 * workers)`.
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        let capacity = 100.max(10 * workers);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            workers,
            tx: parking_lot::Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            handles: Mutex::new(Vec::new()),
            state: Arc::new(PoolState {
                active: AtomicUsize::new(0),
                submitted: AtomicUsize::new(0),
                finished: AtomicUsize::new(0),
                done: Notify::new(),
                notifier: RwLock::new(None),
            }),
        }
    }

    /// Number of workers.
    pub fn worker_count(&self) -> usize {
        self.workers
    }

    /// Spawn the workers. Calling twice is a no-op.
    pub async fn start(&self) {
        let Some(rx) = self.rx.lock().await.take() else {
            return;
        };
        let rx = Arc::new(Mutex::new(rx));
        let mut handles = self.handles.lock().await;
        for worker_id in 0..self.workers {
            let rx = rx.clone();
            let state = self.state.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let task = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    let Some(task) = task else {
                        debug!(worker_id, "worker pool channel closed, exiting");
                        break;
                    };

                    state.active.fetch_add(1, Ordering::SeqCst);
                    debug!(worker_id, task = %task.label, "task started");
                    let result = task.future.await;
                    state.active.fetch_sub(1, Ordering::SeqCst);

                    match result {
                        Ok(()) => {
                            let notifier = state.notifier.read().clone();
                            if let Some(notify) = notifier {
                                notify(worker_id);
                            }
                            debug!(worker_id, task = %task.label, "task finished");
                        }
                        Err(e) => {
                            error!(worker_id, task = %task.label, error = %e, "task failed");
                        }
                    }

                    state.finished.fetch_add(1, Ordering::SeqCst);
                    state.done.notify_waiters();
                }
            }));
        }
    }

    /// Submit a task; blocks while the channel is full. Returns a `pool
    /// closed` error when the pool has been stopped.
    pub async fn submit(&self, task: PoolTask) -> RecacResult<()> {
        let sender = self
            .tx
            .lock()
            .clone()
            .ok_or_else(|| RecacError::Orchestrator("worker pool closed".into()))?;
        self.state.submitted.fetch_add(1, Ordering::SeqCst);
        if sender.send(task).await.is_err() {
            self.state.submitted.fetch_sub(1, Ordering::SeqCst);
            return Err(RecacError::Orchestrator("worker pool closed".into()));
        }
        Ok(())
    }

    /// Block until every submitted task has run to completion.
    pub async fn wait(&self) {
        loop {
            let notified = self.state.done.notified();
            let submitted = self.state.submitted.load(Ordering::SeqCst);
            let finished = self.state.finished.load(Ordering::SeqCst);
            if finished >= submitted {
                return;
            }
            notified.await;
        }
    }

    /// Close the channel and join the workers. Idempotent.
    pub async fn stop(&self) {
        self.tx.lock().take();
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
    }

    /// Number of tasks currently executing.
    pub fn active_count(&self) -> usize {
        self.state.active.load(Ordering::SeqCst)
    }

    /// Replace the success notifier; safe while submissions are in flight.
    pub fn set_notifier(&self, notifier: WorkerNotifier) {
        *self.state.notifier.write() = Some(notifier);
    }

    /// The current notifier, if any.
    pub fn get_notifier(&self) -> Option<WorkerNotifier> {
        self.state.notifier.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use std::time::Duration;

    fn ok_task(label: &str) -> PoolTask {
        PoolTask::new(label, async { Ok(()) }.boxed())
    }

    #[tokio::test]
    async fn test_runs_submitted_tasks() {
        let pool = WorkerPool::new(2);
        pool.start().await;

        let counter = Arc::new(AtomicUsize::new(0));
        for i in 0..5 {
            let counter = counter.clone();
            pool.submit(PoolTask::new(
                format!("task-{i}"),
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                .boxed(),
            ))
            .await
            .unwrap();
        }

        pool.wait().await;
        assert_eq!(counter.load(Ordering::SeqCst), 5);
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_notifier_counts_successes_only() {
        let pool = WorkerPool::new(1);
        pool.start().await;

        let successes = Arc::new(AtomicUsize::new(0));
        let sink = successes.clone();
        pool.set_notifier(Arc::new(move |_worker_id| {
            sink.fetch_add(1, Ordering::SeqCst);
        }));

        pool.submit(ok_task("good")).await.unwrap();
        pool.submit(PoolTask::new(
            "bad",
            async { Err(RecacError::Orchestrator("boom".into())) }.boxed(),
        ))
        .await
        .unwrap();
        pool.submit(ok_task("good-2")).await.unwrap();

        pool.wait().await;
        assert_eq!(successes.load(Ordering::SeqCst), 2);
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_submit_after_stop_is_error() {
        let pool = WorkerPool::new(1);
        pool.start().await;
        pool.stop().await;

        let err = pool.submit(ok_task("late")).await.unwrap_err();
        assert!(err.to_string().contains("pool closed"));
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_idle() {
        let pool = WorkerPool::new(2);
        pool.start().await;
        // no submissions: wait must not hang
        tokio::time::timeout(Duration::from_secs(1), pool.wait())
            .await
            .unwrap();
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_parallelism_is_bounded_by_workers() {
        let pool = WorkerPool::new(2);
        pool.start().await;

        let peak = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));
        for i in 0..6 {
            let peak = peak.clone();
            let current = current.clone();
            pool.submit(PoolTask::new(
                format!("task-{i}"),
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
                .boxed(),
            ))
            .await
            .unwrap();
        }

        pool.wait().await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_notifier_hot_swap() {
        let pool = WorkerPool::new(1);
        pool.start().await;

        let first = Arc::new(AtomicUsize::new(0));
        let sink = first.clone();
        pool.set_notifier(Arc::new(move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        }));
        pool.submit(ok_task("one")).await.unwrap();
        pool.wait().await;

        let second = Arc::new(AtomicUsize::new(0));
        let sink = second.clone();
        pool.set_notifier(Arc::new(move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        }));
        pool.submit(ok_task("two")).await.unwrap();
        pool.wait().await;

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert!(pool.get_notifier().is_some());
        pool.stop().await;
    }
}
