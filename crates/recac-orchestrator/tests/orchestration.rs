//! End-to-end orchestrator scenarios over a real (in-memory) store.

use async_trait::async_trait;
use parking_lot::Mutex;
use recac_core::{signal, RecacError, RecacResult};
use recac_orchestrator::{FeatureWorker, Orchestrator, OrchestratorConfig, TaskStatus};
use recac_store::{SqliteStore, Store};
use recac_vcs::FakeVcs;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const PROJECT: &str = "demo";

/// Worker that records runs, optionally failing the first attempt of
/// selected features, with a configurable per-run delay.
struct ScriptedWorker {
    fail_once: Mutex<HashSet<String>>,
    runs: Mutex<Vec<String>>,
    delay: Duration,
    concurrent: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedWorker {
    fn new(delay: Duration) -> Self {
        Self {
            fail_once: Mutex::new(HashSet::new()),
            runs: Mutex::new(Vec::new()),
            delay,
            concurrent: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    fn fail_first_attempt(&self, id: &str) {
        self.fail_once.lock().insert(id.to_string());
    }

    fn runs(&self) -> Vec<String> {
        self.runs.lock().clone()
    }

    fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeatureWorker for ScriptedWorker {
    async fn run_feature(&self, feature_id: &str, _cancel: CancellationToken) -> RecacResult<()> {
        self.runs.lock().push(feature_id.to_string());
        let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.concurrent.fetch_sub(1, Ordering::SeqCst);

        if self.fail_once.lock().remove(feature_id) {
            return Err(RecacError::Session(format!("{feature_id} flaked")));
        }
        Ok(())
    }
}

fn config(max_agents: usize) -> OrchestratorConfig {
    OrchestratorConfig {
        project: PROJECT.to_string(),
        max_agents,
        tick_interval: Duration::from_millis(10),
        max_retries: 3,
        lock_lease: Duration::from_secs(60),
    }
}

async fn store_with_features(json: &str) -> Arc<SqliteStore> {
    let store = SqliteStore::open_in_memory().await.unwrap();
    store.save_features(PROJECT, json).await.unwrap();
    Arc::new(store)
}

#[tokio::test]
async fn test_retry_then_success_notifies_per_completed_task() {
    let store = store_with_features(
        r#"{"features":[
            {"id":"A","description":"first"},
            {"id":"B","description":"second",
             "dependencies":{"prerequisites":["A"],"exclusive_write_paths":[],"read_only_paths":[]}}
        ]}"#,
    )
    .await;

    let worker = Arc::new(ScriptedWorker::new(Duration::from_millis(5)));
    worker.fail_first_attempt("A");

    let orchestrator = Orchestrator::new(
        config(2),
        store.clone(),
        Arc::new(FakeVcs::new()),
        worker.clone(),
    );

    let notified = Arc::new(AtomicUsize::new(0));
    let sink = notified.clone();
    orchestrator.set_notifier(Arc::new(move |_worker_id| {
        sink.fetch_add(1, Ordering::SeqCst);
    }));

    tokio::time::timeout(Duration::from_secs(10), orchestrator.run())
        .await
        .unwrap()
        .unwrap();

    let graph = orchestrator.graph();
    let graph = graph.read().await;
    assert_eq!(graph.get("A").unwrap().status, TaskStatus::Done);
    assert_eq!(graph.get("B").unwrap().status, TaskStatus::Done);
    drop(graph);

    // A ran twice (one flake), B once; the notifier fires per success
    assert_eq!(notified.load(Ordering::SeqCst), 2);
    assert_eq!(worker.runs().iter().filter(|r| *r == "A").count(), 2);
    assert_eq!(worker.runs().iter().filter(|r| *r == "B").count(), 1);
}

#[tokio::test]
async fn test_exclusive_paths_are_never_held_concurrently() {
    let store = store_with_features(
        r#"{"features":[
            {"id":"A","description":"writes p",
             "dependencies":{"prerequisites":[],"exclusive_write_paths":["p"],"read_only_paths":[]}},
            {"id":"B","description":"also writes p",
             "dependencies":{"prerequisites":[],"exclusive_write_paths":["p"],"read_only_paths":[]}}
        ]}"#,
    )
    .await;

    let worker = Arc::new(ScriptedWorker::new(Duration::from_millis(50)));
    let orchestrator = Orchestrator::new(
        config(4),
        store.clone(),
        Arc::new(FakeVcs::new()),
        worker.clone(),
    );

    tokio::time::timeout(Duration::from_secs(10), orchestrator.run())
        .await
        .unwrap()
        .unwrap();

    // both ran, but never at the same time: they share an exclusive path
    assert_eq!(worker.runs().len(), 2);
    assert_eq!(worker.peak_concurrency(), 1);

    let graph = orchestrator.graph();
    let graph = graph.read().await;
    assert_eq!(graph.get("A").unwrap().status, TaskStatus::Done);
    assert_eq!(graph.get("B").unwrap().status, TaskStatus::Done);
}

#[tokio::test]
async fn test_lifecycle_barrier_stops_submission() {
    let store = store_with_features(
        r#"{"features":[{"id":"A","description":"never runs"}]}"#,
    )
    .await;
    store
        .set_signal(PROJECT, signal::COMPLETED, "true")
        .await
        .unwrap();

    let worker = Arc::new(ScriptedWorker::new(Duration::from_millis(1)));
    let orchestrator = Orchestrator::new(
        config(2),
        store.clone(),
        Arc::new(FakeVcs::new()),
        worker.clone(),
    );

    tokio::time::timeout(Duration::from_secs(5), orchestrator.run())
        .await
        .unwrap()
        .unwrap();

    assert!(worker.runs().is_empty());
}

#[tokio::test]
async fn test_unresolvable_dependencies_fail_cleanly() {
    // A and B depend on each other: nothing can ever become ready
    let store = store_with_features(
        r#"{"features":[
            {"id":"A","description":"",
             "dependencies":{"prerequisites":["B"],"exclusive_write_paths":[],"read_only_paths":[]}},
            {"id":"B","description":"",
             "dependencies":{"prerequisites":["A"],"exclusive_write_paths":[],"read_only_paths":[]}}
        ]}"#,
    )
    .await;

    let worker = Arc::new(ScriptedWorker::new(Duration::from_millis(1)));
    let orchestrator = Orchestrator::new(
        config(2),
        store.clone(),
        Arc::new(FakeVcs::new()),
        worker.clone(),
    );

    tokio::time::timeout(Duration::from_secs(5), orchestrator.run())
        .await
        .unwrap()
        .unwrap();

    let graph = orchestrator.graph();
    let graph = graph.read().await;
    assert_eq!(graph.get("A").unwrap().status, TaskStatus::Failed);
    assert_eq!(graph.get("B").unwrap().status, TaskStatus::Failed);
    drop(graph);

    // a fully-failed run asks the manager to take a look
    assert!(store
        .get_signal(PROJECT, signal::TRIGGER_MANAGER)
        .await
        .unwrap()
        .is_some());
    assert!(worker.runs().is_empty());
}

#[tokio::test]
async fn test_high_failure_rate_triggers_manager() {
    let store = store_with_features(
        r#"{"features":[
            {"id":"A","description":""},
            {"id":"B","description":""},
            {"id":"C","description":""}
        ]}"#,
    )
    .await;

    let worker = Arc::new(AlwaysFailWorker);
    let mut cfg = config(3);
    cfg.max_retries = 1;
    let orchestrator = Orchestrator::new(cfg, store.clone(), Arc::new(FakeVcs::new()), worker);

    tokio::time::timeout(Duration::from_secs(10), orchestrator.run())
        .await
        .unwrap()
        .unwrap();

    assert!(store
        .get_signal(PROJECT, signal::TRIGGER_MANAGER)
        .await
        .unwrap()
        .is_some());
}

struct AlwaysFailWorker;

#[async_trait]
impl FeatureWorker for AlwaysFailWorker {
    async fn run_feature(&self, feature_id: &str, _cancel: CancellationToken) -> RecacResult<()> {
        Err(RecacError::Session(format!("{feature_id} cannot pass")))
    }
}
