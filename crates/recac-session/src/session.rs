//! The per-project session state machine.
//!
//! A session drives one agent through the iteration loop: select a prompt,
//! send it to the model, execute the reply, inspect lifecycle signals, and
//! apply the circuit breakers. Lifecycle transitions are strictly ordered:
//! sign-off handling first, then the manager gate, then the QA gate, and
//! only then a regular prompt. When coding is delegated to multiple agents
//! the session hands one sprint to an orchestrator running nested sessions.

use crate::breakers::CircuitBreakers;
use crate::processor::{truncate_repetition, ResponseProcessor};
use crate::prompts::{self, PromptKind};
use crate::signals::SignalLayer;
use crate::state::{state_file_path, AgentState};
use crate::worker::ChildSessionRunner;
use recac_core::config::RecacConfig;
use recac_core::feature::{Feature, FeatureList, FeatureStatus};
use recac_core::scanner::SecretScanner;
use recac_core::{signal, AgentRole, Clock, RecacError, RecacResult};
use recac_model::ModelClient;
use recac_notify::{Notifier, REACTION_FAILURE, REACTION_SUCCESS};
use recac_orchestrator::{Orchestrator, OrchestratorConfig};
use recac_sandbox::{shell_argv, Sandbox};
use recac_store::Store;
use recac_vcs::Vcs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Feature id injected when the upstream merge cannot be recovered.
const CONFLICT_FEATURE_ID: &str = "CONFLICT_RES";

/// Capability bundle a session (and its children) runs against.
#[derive(Clone)]
pub struct SessionDeps {
    /// Coordination store (shared with children, owned by the root session).
    pub store: Arc<dyn Store>,
    /// Model provider client.
    pub model: Arc<dyn ModelClient>,
    /// Command execution environment.
    pub sandbox: Arc<dyn Sandbox>,
    /// Version control.
    pub vcs: Arc<dyn Vcs>,
    /// Chat notifier.
    pub notifier: Arc<dyn Notifier>,
    /// Time source; tests inject a manual clock.
    pub clock: Arc<dyn Clock>,
}

struct Shared {
    iteration: parking_lot::RwLock<u32>,
    thread_ts: parking_lot::RwLock<Option<String>>,
    container_id: parking_lot::RwLock<Option<String>>,
}

enum Flow {
    Continue,
    Terminated,
}

struct IterationOutcome {
    executed: usize,
    reply: String,
}

/// One project's agent-lifecycle controller.
pub struct Session {
    config: RecacConfig,
    deps: SessionDeps,
    owns_resources: bool,
    selected_task: Option<String>,
    quiet: bool,
    parent_thread: Option<String>,
    spec_text: Option<String>,
    signals: SignalLayer,
    processor: ResponseProcessor,
    scanner: SecretScanner,
    breakers: parking_lot::Mutex<CircuitBreakers>,
    state: parking_lot::Mutex<AgentState>,
    blocker_streak: std::sync::atomic::AtomicU32,
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl Session {
    /// Session over the given configuration and capabilities.
    pub fn new(config: RecacConfig, deps: SessionDeps) -> Self {
        let signals = SignalLayer::new(
            deps.store.clone(),
            config.project.clone(),
            config.workspace.clone(),
        );
        let processor = ResponseProcessor::new(Duration::from_secs(config.bash_timeout_secs));
        let breakers = CircuitBreakers::new(
            config.no_op_limit,
            config.stalled_threshold,
            config.stalled_warning,
        );
        Self {
            signals,
            processor,
            scanner: SecretScanner::new(),
            breakers: parking_lot::Mutex::new(breakers),
            state: parking_lot::Mutex::new(AgentState::default()),
            blocker_streak: std::sync::atomic::AtomicU32::new(0),
            shared: Arc::new(Shared {
                iteration: parking_lot::RwLock::new(0),
                thread_ts: parking_lot::RwLock::new(None),
                container_id: parking_lot::RwLock::new(None),
            }),
            cancel: CancellationToken::new(),
            owns_resources: true,
            selected_task: None,
            quiet: false,
            parent_thread: None,
            spec_text: None,
            config,
            deps,
        }
    }

    /// Focus the session on a single feature id (nested agent mode).
    pub fn with_selected_task(mut self, id: impl Into<String>) -> Self {
        self.selected_task = Some(id.into());
        self
    }

    /// Mark the store/sandbox as shared: this session will not close them.
    pub fn share_resources(mut self) -> Self {
        self.owns_resources = false;
        self
    }

    /// Suppress start and terminal notifications (child sessions).
    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    /// Reply into an existing notification thread.
    pub fn with_parent_thread(mut self, ts: impl Into<String>) -> Self {
        self.parent_thread = Some(ts.into());
        self
    }

    /// Provide the specification text explicitly (instead of a file).
    pub fn with_spec_text(mut self, spec: impl Into<String>) -> Self {
        self.spec_text = Some(spec.into());
        self
    }

    /// Inherit a cancellation token.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Current iteration count.
    pub fn iteration(&self) -> u32 {
        *self.shared.iteration.read()
    }

    /// Advance the iteration counter; strictly increasing under concurrency.
    pub fn increment_iteration(&self) -> u32 {
        let mut iteration = self.shared.iteration.write();
        *iteration += 1;
        *iteration
    }

    /// The notification thread, once established.
    pub fn thread_ts(&self) -> Option<String> {
        self.shared.thread_ts.read().clone()
    }

    fn spec_path(&self) -> PathBuf {
        self.config.workspace.join("app_spec.txt")
    }

    fn state_path(&self) -> PathBuf {
        state_file_path(&self.config.workspace, self.selected_task.as_deref())
    }

    fn project(&self) -> &str {
        &self.config.project
    }

    /// Run the session to a terminal outcome: start, loop, notify, release.
    pub async fn run(&self) -> RecacResult<()> {
        self.start().await?;
        let result = self.run_loop().await;

        if !self.quiet {
            let thread = self.thread_ts();
            match &result {
                Ok(()) => {
                    let _ = self
                        .deps
                        .notifier
                        .post(thread.as_deref(), "Session completed successfully.")
                        .await;
                    if let Some(ts) = &thread {
                        let _ = self.deps.notifier.add_reaction(ts, REACTION_SUCCESS).await;
                    }
                }
                Err(e) if e.is_budget_exhausted() => {
                    let _ = self
                        .deps
                        .notifier
                        .post(thread.as_deref(), &format!("Session failed: {e}"))
                        .await;
                    if let Some(ts) = &thread {
                        let _ = self.deps.notifier.add_reaction(ts, REACTION_FAILURE).await;
                    }
                }
                Err(e) => {
                    let _ = self
                        .deps
                        .notifier
                        .post(thread.as_deref(), &format!("Session error: {e}"))
                        .await;
                }
            }
        }

        if self.owns_resources {
            if let Err(e) = self.deps.sandbox.cleanup().await {
                warn!(error = %e, "sandbox cleanup failed");
            }
            if let Err(e) = self.deps.store.close().await {
                warn!(error = %e, "store close failed");
            }
        }
        result
    }

    /// Prepare the environment: sandbox, spec, repository, bootstrap script,
    /// and the notification thread.
    pub async fn start(&self) -> RecacResult<()> {
        info!(project = %self.project(), task = ?self.selected_task, "session starting");

        self.deps.sandbox.ensure_ready().await?;
        *self.shared.container_id.write() = self.deps.sandbox.id();

        self.read_spec().await?;

        self.deps.vcs.ensure_repo().await?;
        self.deps
            .vcs
            .configure_identity("recac", "agent@recac.dev")
            .await?;
        self.deps.vcs.write_ignores().await?;

        *self.state.lock() = AgentState::load(&self.state_path())?;

        if self.config.workspace.join("init.sh").exists() {
            let result = self
                .deps
                .sandbox
                .exec(&shell_argv("sh init.sh"), Duration::from_secs(300))
                .await;
            match result {
                Ok(r) if r.success() => info!("init.sh completed"),
                Ok(r) => warn!(exit_code = r.exit_code, "init.sh failed, continuing"),
                Err(e) => warn!(error = %e, "init.sh could not run, continuing"),
            }
        }

        self.restore_thread().await?;
        Ok(())
    }

    /// Spec resolution: workspace file, then explicit text, then the store;
    /// each successful level is propagated back down to the others.
    async fn read_spec(&self) -> RecacResult<Option<String>> {
        let path = self.spec_path();
        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            self.deps.store.save_spec(self.project(), &content).await?;
            return Ok(Some(content));
        }
        if let Some(content) = &self.spec_text {
            std::fs::write(&path, content)?;
            self.deps.store.save_spec(self.project(), content).await?;
            return Ok(Some(content.clone()));
        }
        if let Some(content) = self.deps.store.get_spec(self.project()).await? {
            std::fs::write(&path, &content)?;
            return Ok(Some(content));
        }
        Ok(None)
    }

    async fn restore_thread(&self) -> RecacResult<()> {
        if let Some(ts) = &self.parent_thread {
            *self.shared.thread_ts.write() = Some(ts.clone());
            return Ok(());
        }
        if let Some(ts) = self.deps.store.get_thread(self.project()).await? {
            *self.shared.thread_ts.write() = Some(ts);
            return Ok(());
        }
        if !self.quiet {
            let ts = self
                .deps
                .notifier
                .post(
                    None,
                    &format!("recac session started for project `{}`", self.project()),
                )
                .await?;
            self.deps.store.set_thread(self.project(), &ts).await?;
            *self.shared.thread_ts.write() = Some(ts);
        }
        Ok(())
    }

    /// Load the feature list: a parseable workspace mirror is ingested into
    /// the store (agents communicate plan updates through the file), else
    /// the store copy is used and the mirror re-created.
    async fn load_features(&self) -> RecacResult<FeatureList> {
        let mirror = self.config.workspace.join("feature_list.json");
        if mirror.exists() {
            match FeatureList::load(&mirror) {
                Ok(list) => {
                    self.deps
                        .store
                        .save_features(self.project(), &list.to_json()?)
                        .await?;
                    return Ok(list);
                }
                Err(e) => warn!(error = %e, "feature_list.json is unreadable, using store copy"),
            }
        }
        match self.deps.store.get_features(self.project()).await? {
            Some(json) => {
                let list = FeatureList::from_json(&json)?;
                if !mirror.exists() {
                    let _ = std::fs::write(&mirror, &json);
                }
                Ok(list)
            }
            None => Ok(FeatureList::default()),
        }
    }

    /// The iteration loop. Refuses to run without `app_spec.txt`.
    pub async fn run_loop(&self) -> RecacResult<()> {
        if !self.spec_path().exists() {
            return Err(RecacError::Session(format!(
                "app_spec.txt not found in {}",
                self.config.workspace.display()
            )));
        }

        loop {
            if self.cancel.is_cancelled() {
                return Err(RecacError::Cancelled);
            }

            let iteration = self.increment_iteration();
            if iteration > self.config.max_iterations {
                return Err(RecacError::MaxIterations(self.config.max_iterations));
            }

            let features = self.load_features().await?;
            if let Some(task) = &self.selected_task {
                if features.get(task).map(|f| f.passes).unwrap_or(false) {
                    info!(task = %task, "assigned feature passes, session done");
                    return Ok(());
                }
            }

            let executed_any = if self.signals.has(signal::PROJECT_SIGNED_OFF).await? {
                match self.handle_signed_off().await? {
                    Flow::Terminated => return Ok(()),
                    Flow::Continue => true,
                }
            } else if self.signals.has(signal::QA_PASSED).await? {
                self.run_manager_gate().await?;
                true
            } else if self.signals.has(signal::COMPLETED).await? {
                self.run_qa_gate().await?;
                true
            } else {
                let manager_triggered = self.signals.has(signal::TRIGGER_MANAGER).await?;
                let kind = prompts::select(
                    !features.features.is_empty(),
                    iteration,
                    self.config.manager_frequency,
                    manager_triggered,
                );
                if kind == PromptKind::Manager && manager_triggered {
                    self.signals.clear(signal::TRIGGER_MANAGER).await?;
                }

                if kind == PromptKind::Coding && self.config.max_agents > 1 {
                    self.delegate_to_orchestrator().await?;
                    true
                } else {
                    match self.run_iteration(kind).await {
                        Ok(outcome) => outcome.executed > 0,
                        Err(RecacError::Blocker(reason)) => {
                            self.handle_blocker(&reason).await?;
                            true
                        }
                        Err(RecacError::Security(reason)) => {
                            warn!(reason = %reason, "iteration aborted by security scanner");
                            false
                        }
                        Err(e) => return Err(e),
                    }
                }
            };

            self.after_iteration(iteration, executed_any).await?;
        }
    }

    /// Records this iteration's outcome with the circuit breakers and
    /// reports whether a stall warning is active. Kept synchronous so the
    /// `parking_lot` guard never needs to be held across an `.await`.
    fn record_breakers(&self, executed_any: bool, passing: usize) -> (Option<RecacError>, bool) {
        let mut breakers = self.breakers.lock();
        let tripped = breakers.record(executed_any, passing);
        let stall_warning_active = breakers.stall_warning_active();
        (tripped, stall_warning_active)
    }

    /// Breakers, state persistence, progress push, and the inter-iteration
    /// sleep.
    async fn after_iteration(&self, iteration: u32, executed_any: bool) -> RecacResult<()> {
        let passing = self.load_features().await?.passing_count();
        let (tripped, stall_warning_active) = self.record_breakers(executed_any, passing);
        if stall_warning_active {
            self.signals.create(signal::STALLED_WARNING).await?;
        } else {
            self.signals.clear(signal::STALLED_WARNING).await?;
        }
        if let Some(err) = tripped {
            return Err(err);
        }

        if let Err(e) = self.state.lock().save(&self.state_path()) {
            warn!(error = %e, "could not save agent state");
        }

        self.push_progress(iteration).await;

        self.deps
            .clock
            .sleep(Duration::from_millis(self.config.iteration_delay_ms))
            .await;
        Ok(())
    }

    /// Commit and push progress; never on the base/main branches, never
    /// fatal.
    async fn push_progress(&self, iteration: u32) {
        let branch = match self.deps.vcs.current_branch().await {
            Ok(branch) => branch,
            Err(_) => return,
        };
        let protected = branch == "main"
            || branch == "master"
            || Some(&branch) == self.config.base_branch.as_ref();
        if protected {
            return;
        }
        match self
            .deps
            .vcs
            .commit_all(&format!("Progress: iteration {iteration}"))
            .await
        {
            Ok(Some(_)) => {
                if let Err(e) = self.deps.vcs.push("origin", &branch).await {
                    warn!(error = %e, "progress push failed");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "progress commit failed"),
        }
    }

    /// One model round-trip plus command execution.
    async fn run_iteration(&self, kind: PromptKind) -> RecacResult<IterationOutcome> {
        let features = self.load_features().await?;
        let history = self.deps.store.query_history(self.project(), 20).await?;
        let spec = self
            .deps
            .store
            .get_spec(self.project())
            .await?
            .unwrap_or_default();
        let stall_warning = self.breakers.lock().stall_warning_active();

        let ctx = prompts::PromptContext {
            spec: &spec,
            features: &features,
            history: &history,
            stall_warning,
            selected_task: self.selected_task.as_deref(),
        };
        let prompt = prompts::render(kind, &ctx);

        let reply = if self.config.model.streaming {
            self.deps
                .model
                .send_stream(&prompt, Arc::new(|_chunk: &str| {}))
                .await?
        } else {
            self.deps.model.send(&prompt).await?
        };
        let reply = truncate_repetition(&reply);

        if !self.scanner.is_clean(&reply) {
            // the offending reply is never persisted as an executable plan
            return Err(RecacError::Security(
                "model output contained credential material".into(),
            ));
        }

        let role = match kind {
            PromptKind::Initializer | PromptKind::Coding => AgentRole::Agent,
            PromptKind::Manager => AgentRole::Manager,
            PromptKind::Qa => AgentRole::Qa,
            PromptKind::Cleaner => AgentRole::Cleaner,
        };
        self.deps
            .store
            .save_observation(self.project(), role, &reply)
            .await?;

        let outcome = self
            .processor
            .process(&self.deps.sandbox, &self.deps.store, self.project(), &reply)
            .await?;
        self.deps
            .store
            .save_observation(self.project(), AgentRole::System, &outcome.transcript)
            .await?;

        self.state.lock().record_exchange(&prompt, &reply);
        self.blocker_streak
            .store(0, std::sync::atomic::Ordering::SeqCst);

        Ok(IterationOutcome {
            executed: outcome.executed,
            reply,
        })
    }

    /// Blocker policy: give the manager one turn to resolve it; a second
    /// consecutive blocker terminates the session.
    async fn handle_blocker(&self, reason: &str) -> RecacResult<()> {
        let strikes = self
            .blocker_streak
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            + 1;
        if strikes > 1 {
            return Err(RecacError::Blocker(reason.to_string()));
        }
        warn!(reason = %reason, "blocker reported, routing to manager");
        self.signals.clear(signal::BLOCKER).await?;
        self.signals.create(signal::TRIGGER_MANAGER).await?;
        Ok(())
    }

    /// QA gate: entered while `COMPLETED` is set.
    async fn run_qa_gate(&self) -> RecacResult<()> {
        if self.config.skip_qa {
            info!("QA skipped by configuration, signing off");
            self.signals.create(signal::PROJECT_SIGNED_OFF).await?;
            self.signals.clear(signal::COMPLETED).await?;
            return Ok(());
        }

        match self.run_iteration(PromptKind::Qa).await {
            Ok(outcome) if !prompts::detect_rejection(&outcome.reply) => {
                info!("QA passed");
                self.signals.create(signal::QA_PASSED).await?;
            }
            Ok(_) => {
                info!("QA rejected the current state, resuming coding");
                self.signals.clear(signal::COMPLETED).await?;
            }
            Err(RecacError::Blocker(reason)) => self.handle_blocker(&reason).await?,
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Manager gate: entered while `QA_PASSED` is set.
    async fn run_manager_gate(&self) -> RecacResult<()> {
        match self.run_iteration(PromptKind::Manager).await {
            Ok(outcome) if !prompts::detect_rejection(&outcome.reply) => {
                info!("manager approved, signing off");
                self.signals.create(signal::PROJECT_SIGNED_OFF).await?;
            }
            Ok(_) => {
                info!("manager withheld sign-off");
            }
            Err(RecacError::Blocker(reason)) => self.handle_blocker(&reason).await?,
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Sign-off handling: base merge, the all-passing guardrail, merge or
    /// push, cleaner, terminate.
    async fn handle_signed_off(&self) -> RecacResult<Flow> {
        if let Some(base) = self.config.base_branch.clone() {
            if !self.merge_base_branch(&base).await? {
                return Ok(Flow::Continue);
            }
        }

        // guardrail: sign-off with a non-passing feature is premature
        let features = self.load_features().await?;
        if !features.all_passing() {
            warn!(
                failing = ?features.failing_ids(),
                "premature sign-off, revoking"
            );
            self.signals.clear(signal::PROJECT_SIGNED_OFF).await?;
            self.signals.clear(signal::QA_PASSED).await?;
            self.signals.clear(signal::COMPLETED).await?;
            return Ok(Flow::Continue);
        }

        let branch = self.deps.vcs.current_branch().await?;
        let thread = self.thread_ts();

        if self.config.auto_merge {
            if let Some(base) = self.config.base_branch.clone() {
                self.deps.vcs.commit_all("Final commit before merge").await?;
                self.deps.vcs.checkout(&base).await?;
                self.deps.vcs.merge(&branch).await?;
                self.deps.vcs.push("origin", &base).await?;
                if self.config.delete_branch_on_merge {
                    if let Err(e) = self.deps.vcs.delete_remote_branch("origin", &branch).await {
                        warn!(error = %e, "could not delete remote feature branch");
                    }
                }
                let merge_commit = self.deps.vcs.head_commit().await?;
                info!(commit = %merge_commit, base = %base, "auto-merge complete");
                if !self.quiet {
                    let _ = self
                        .deps
                        .notifier
                        .post(
                            thread.as_deref(),
                            &format!("Merged `{branch}` into `{base}` at {merge_commit}."),
                        )
                        .await;
                }
            }
        } else {
            if let Err(e) = self.deps.vcs.push("origin", &branch).await {
                warn!(error = %e, "feature branch push failed");
            }
            if !self.quiet {
                let _ = self
                    .deps
                    .notifier
                    .post(
                        thread.as_deref(),
                        &format!("Project signed off; work is on branch `{branch}`."),
                    )
                    .await;
            }
        }

        self.run_cleaner().await;
        Ok(Flow::Terminated)
    }

    /// Fetch-and-merge the remote base with recovery, up to three attempts.
    /// Returns false after revoking sign-off on persistent failure.
    async fn merge_base_branch(&self, base: &str) -> RecacResult<bool> {
        const ATTEMPTS: u32 = 3;
        for attempt in 1..=ATTEMPTS {
            let merged = async {
                self.deps.vcs.fetch("origin", base).await?;
                self.deps.vcs.merge(&format!("origin/{base}")).await
            }
            .await;

            match merged {
                Ok(()) => return Ok(true),
                Err(e) => {
                    warn!(attempt, error = %e, "base merge failed, recovering");
                    let _ = self.deps.vcs.abort_merge().await;
                    let _ = self.deps.vcs.recover_dangling_locks().await;
                    let _ = self.deps.vcs.clean_workdir(true).await;
                    if attempt == ATTEMPTS {
                        if let Ok(branch) = self.deps.vcs.current_branch().await {
                            let _ = self.deps.vcs.hard_reset(&branch).await;
                        }
                    } else {
                        self.deps.clock.sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        }

        warn!(base, "upstream merge unrecoverable, revoking sign-off");
        self.signals.clear(signal::PROJECT_SIGNED_OFF).await?;
        self.open_conflict_feature(base).await?;
        self.signals.clear(signal::QA_PASSED).await?;
        self.signals.clear(signal::COMPLETED).await?;
        Ok(false)
    }

    /// Inject a conflict-resolution feature so the coding loop addresses the
    /// merge instead of retrying sign-off forever.
    async fn open_conflict_feature(&self, base: &str) -> RecacResult<()> {
        let mut features = self.load_features().await?;
        if features.get(CONFLICT_FEATURE_ID).is_some() {
            return Ok(());
        }
        let mut feature = Feature::new(
            CONFLICT_FEATURE_ID,
            format!(
                "Resolve merge conflicts with the upstream base branch `{base}` \
                 and re-run the full test suite"
            ),
        );
        feature.category = "maintenance".into();
        feature.status = FeatureStatus::Todo;
        features.features.push(feature);
        let json = features.to_json()?;
        self.deps.store.save_features(self.project(), &json).await?;
        let _ = std::fs::write(self.config.workspace.join("feature_list.json"), &json);
        Ok(())
    }

    /// Cleaner agent pass; failures never block termination.
    async fn run_cleaner(&self) {
        match self.run_iteration(PromptKind::Cleaner).await {
            Ok(_) => info!("cleanup pass finished"),
            Err(e) => error!(error = %e, "cleanup pass failed"),
        }
    }

    /// Hand one coding sprint to the orchestrator with nested sessions.
    async fn delegate_to_orchestrator(&self) -> RecacResult<()> {
        info!(agents = self.config.max_agents, "delegating to orchestrator");
        let worker = Arc::new(ChildSessionRunner::new(
            self.config.clone(),
            self.deps.clone(),
            self.thread_ts(),
        ));
        let orchestrator = Orchestrator::new(
            OrchestratorConfig {
                project: self.project().to_string(),
                max_agents: self.config.max_agents,
                tick_interval: Duration::from_millis(self.config.tick_interval_ms),
                max_retries: self.config.max_retries,
                lock_lease: Duration::from_secs(self.config.lock_lease_secs),
            },
            self.deps.store.clone(),
            self.deps.vcs.clone(),
            worker,
        );
        orchestrator.run().await
    }
}
