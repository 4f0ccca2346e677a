//! The core supervisor: owns every project's running agents, drives session
//! launch/exit, chains follow-up sessions, coordinates claims and git
//! branch/merge lifecycles, detects stalled agents, and recovers orphaned
//! child processes after a restart.
//!
//! `Orchestrator` is a cheap `Clone` handle (every field is an `Arc` or a
//! small `Copy`-ish settings struct) rather than something callers wrap in
//! their own `Arc` — the same shape as the teacher's `runner::RunConfig`
//! callers, generalized from one project per process to many.

use std::collections::BTreeMap;
use std::io::BufRead;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use crate::broadcast::{BroadcastHub, Message};
use crate::claims::{ClaimTable, ClaimedFeature};
use crate::config::OrchestratorSettings;
use crate::error::{OrchestratorError, Result};
use crate::git;
use crate::gitlock::GitLock;
use crate::ids::new_id;
use crate::loop_detect::LoopDetector;
use crate::persistence::{
    Feature, FeatureContext, HelpRequest, HelpRequestStatus, LogEntry, LogKind, Persistence,
    Project, Session, SessionKind, SessionStatus,
};
use crate::providers::{Adapter, AgentEvent, ProviderRegistry, SessionContext, truncate};
use crate::state::{self, ProjectStatus, StatusEvent};
use crate::watcher;

/// Reserved agent indices that never collide with the main claim-fan-out
/// slot map (`0..project.concurrency`), per §4.1.
const REVIEW_AGENT_INDEX: u32 = 98;
const APPEND_INITIALIZER_AGENT_INDEX: u32 = 99;

struct AgentHandle {
    kind: SessionKind,
    feature_id: Option<String>,
    branch: Option<String>,
    stopped: Arc<AtomicBool>,
    pid: Arc<Mutex<Option<u32>>>,
}

#[derive(Default)]
struct ProjectRuntime {
    claims: ClaimTable,
    git_lock: GitLock,
    agents: Mutex<BTreeMap<u32, AgentHandle>>,
    watcher_stop: Mutex<Option<watch::Sender<bool>>>,
}

/// Everything one child-process launch needs: where it runs, how its
/// argv/env is built, and what bookkeeping applies when it exits.
struct SessionPlan {
    project_id: String,
    project_dir: PathBuf,
    kind: SessionKind,
    agent_index: u32,
    feature: Option<ClaimedFeature>,
    branch: Option<String>,
    ctx: SessionContext,
    adapter_name: String,
    /// Parallel coding sessions own a feature branch that must be merged
    /// back to `main` on success; serial/reserved sessions do not.
    parallel_git: bool,
}

#[derive(Clone)]
pub struct Orchestrator {
    pub persistence: Arc<Persistence>,
    pub hub: Arc<BroadcastHub>,
    pub providers: Arc<ProviderRegistry>,
    pub settings: OrchestratorSettings,
    runtimes: Arc<Mutex<BTreeMap<String, Arc<ProjectRuntime>>>>,
}

impl Orchestrator {
    pub fn new(
        persistence: Arc<Persistence>,
        hub: Arc<BroadcastHub>,
        providers: Arc<ProviderRegistry>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self { persistence, hub, providers, settings, runtimes: Arc::new(Mutex::new(BTreeMap::new())) }
    }

    fn runtime(&self, project_id: &str) -> Arc<ProjectRuntime> {
        let mut runtimes = self.runtimes.lock().unwrap();
        Arc::clone(runtimes.entry(project_id.to_string()).or_insert_with(|| Arc::new(ProjectRuntime::default())))
    }

    // --- Public contract (§4.1) ---

    /// `true` iff a main-chain agent (index `0..8`) is currently running.
    /// Reserved append/review sessions (`98`/`99`) are out of band and do
    /// not count, matching the collision-avoidance rule in §9.
    pub async fn is_running(&self, project_id: &str) -> bool {
        self.runtime(project_id).agents.lock().unwrap().keys().any(|&i| i < REVIEW_AGENT_INDEX)
    }

    pub async fn active_agent_count(&self, project_id: &str) -> usize {
        self.runtime(project_id).agents.lock().unwrap().keys().filter(|&&i| i < REVIEW_AGENT_INDEX).count()
    }

    pub async fn start_agent(&self, project_id: &str) -> Result<()> {
        if self.is_running(project_id).await {
            return Err(OrchestratorError::AlreadyRunning);
        }
        let mut project = self.persistence.load_project(project_id)?;
        let adapter = self
            .providers
            .get(&project.provider)
            .ok_or_else(|| OrchestratorError::InvalidInput(format!("unknown provider '{}'", project.provider)))?;
        let has_initialized = self.has_completed_initializer(project_id)?;

        if adapter.capabilities().agent_teams && project.use_agent_teams {
            if project.review_before_coding.unwrap_or(false) && !has_initialized {
                self.transition(&mut project, StatusEvent::Start { has_initialized: false }).await?;
                self.spawn_initializer(project);
            } else {
                self.transition(&mut project, StatusEvent::Start { has_initialized: true }).await?;
                self.spawn_agent_teams(project);
            }
            return Ok(());
        }

        if !has_initialized {
            self.transition(&mut project, StatusEvent::Start { has_initialized: false }).await?;
            self.spawn_initializer(project);
            return Ok(());
        }

        self.begin_coding(project).await
    }

    pub async fn stop_agent(&self, project_id: &str) -> Result<()> {
        let runtime = self.runtime(project_id);
        let handles: Vec<(Arc<AtomicBool>, Arc<Mutex<Option<u32>>>)> = runtime
            .agents
            .lock()
            .unwrap()
            .iter()
            .filter(|(&i, _)| i < REVIEW_AGENT_INDEX)
            .map(|(_, h)| (Arc::clone(&h.stopped), Arc::clone(&h.pid)))
            .collect();

        if handles.is_empty() {
            self.stop_via_persisted_sessions(project_id).await?;
        } else {
            for (stopped, pid_slot) in handles {
                stopped.store(true, Ordering::SeqCst);
                if let Some(pid) = *pid_slot.lock().unwrap() {
                    self.terminate_then_kill(pid, self.settings.stop_grace_secs);
                }
            }
            // The project transitions to `paused` once the agents map
            // drains, from inside `post_exit_chain`.
        }

        runtime.claims.clear();
        Ok(())
    }

    /// No in-memory agents, but the project record claims it is active:
    /// walk persisted sessions and kill whatever is still alive by pid.
    async fn stop_via_persisted_sessions(&self, project_id: &str) -> Result<()> {
        let mut project = self.persistence.load_project(project_id)?;
        if !matches!(project.status, ProjectStatus::Running | ProjectStatus::Initializing | ProjectStatus::Reviewing) {
            return Ok(());
        }
        for mut session in self.persistence.load_sessions(project_id)?.into_iter().filter(|s| s.status == SessionStatus::Running) {
            if let Some(pid) = session.pid {
                self.terminate_then_kill(pid, self.settings.stop_grace_secs);
            }
            session.status = SessionStatus::Stopped;
            session.ended_at = Some(Utc::now());
            self.persistence.upsert_session(&session)?;
        }
        self.transition(&mut project, StatusEvent::Stop { all_agents_stopped: true }).await?;
        Ok(())
    }

    pub async fn start_append_initializer(&self, project_id: &str, fragment: &str) -> Result<()> {
        let mut project = self.persistence.load_project(project_id)?;
        let spec_path = project.project_dir.join("app_spec.txt");
        let mut existing = std::fs::read_to_string(&spec_path).unwrap_or_default();
        if !existing.is_empty() {
            existing.push_str("\n\n--- appended ---\n\n");
        }
        existing.push_str(fragment);
        std::fs::write(&spec_path, &existing)?;
        project.spec = existing;
        project.updated_at = Utc::now();
        self.persistence.save_project(&project)?;

        let prompt = prompts::append_initializer(&project, fragment);
        let ctx = session_context(&project, prompt, None, true);
        self.launch(SessionPlan {
            project_id: project.id.clone(),
            project_dir: project.project_dir.clone(),
            kind: SessionKind::Initializer,
            agent_index: APPEND_INITIALIZER_AGENT_INDEX,
            feature: None,
            branch: None,
            ctx,
            adapter_name: project.provider.clone(),
            parallel_git: false,
        });
        Ok(())
    }

    pub async fn start_review_session(&self, project_id: &str, feature_ids: Vec<String>, instruction: String) -> Result<()> {
        let project = self.persistence.load_project(project_id)?;
        let cached = self.persistence.load_features(project_id)?;
        let selected: Vec<&Feature> = cached.features.iter().filter(|f| feature_ids.contains(&f.id)).collect();
        let prompt = prompts::review(&project, &selected, &instruction);
        let ctx = session_context(&project, prompt, None, true);
        self.launch(SessionPlan {
            project_id: project.id.clone(),
            project_dir: project.project_dir.clone(),
            kind: SessionKind::Coding,
            agent_index: REVIEW_AGENT_INDEX,
            feature: None,
            branch: None,
            ctx,
            adapter_name: project.provider.clone(),
            parallel_git: false,
        });
        Ok(())
    }

    pub async fn confirm_review(&self, project_id: &str) -> Result<()> {
        let mut project = self.persistence.load_project(project_id)?;
        self.transition(&mut project, StatusEvent::ReviewConfirmed).await?;
        self.begin_coding(project).await
    }

    /// Runs at startup, before the API accepts traffic. Terminates any
    /// still-live child processes from a prior run and returns every
    /// active project to `paused`.
    pub async fn init_recovery(&self) -> Result<()> {
        let mut recovered = 0usize;
        for mut project in self.persistence.list_projects()? {
            if !matches!(project.status, ProjectStatus::Running | ProjectStatus::Initializing | ProjectStatus::Reviewing) {
                continue;
            }
            for mut session in self.persistence.load_sessions(&project.id)?.into_iter().filter(|s| s.status == SessionStatus::Running) {
                if let Some(pid) = session.pid {
                    if pid_alive(pid) {
                        send_signal(pid, "TERM");
                        tokio::time::sleep(Duration::from_secs(self.settings.loop_kill_grace_secs)).await;
                        if pid_alive(pid) {
                            send_signal(pid, "KILL");
                        }
                    }
                }
                session.status = SessionStatus::Stopped;
                session.ended_at = Some(Utc::now());
                self.persistence.upsert_session(&session)?;
            }
            self.transition(&mut project, StatusEvent::Stop { all_agents_stopped: true }).await?;
            recovered += 1;
        }
        tracing::info!(recovered_projects = recovered, "orphan recovery complete");
        Ok(())
    }

    // --- State machine glue ---

    async fn transition(&self, project: &mut Project, event: StatusEvent) -> Result<()> {
        let outcome = state::apply(project.status, event);
        if let Some(new_status) = outcome.new_status {
            project.status = new_status;
            project.updated_at = Utc::now();
            self.persistence.save_project(project)?;
            self.hub.publish(&project.id, Message::Status(new_status));
            tracing::info!(project_id = %project.id, status = ?new_status, "project status changed");
        }
        if outcome.stop_watcher {
            self.stop_watcher(&project.id);
        }
        Ok(())
    }

    fn has_completed_initializer(&self, project_id: &str) -> Result<bool> {
        Ok(self.persistence.load_sessions(project_id)?.iter().any(|s| {
            s.kind == SessionKind::Initializer
                && s.status == SessionStatus::Completed
                && s.agent_index != Some(APPEND_INITIALIZER_AGENT_INDEX)
        }))
    }

    // --- Watcher lifecycle ---

    fn ensure_watcher(&self, project: &Project) {
        let runtime = self.runtime(&project.id);
        let mut slot = runtime.watcher_stop.lock().unwrap();
        if slot.is_some() {
            return;
        }
        let (tx, rx) = watch::channel(false);
        *slot = Some(tx);
        drop(slot);

        let me = self.clone();
        watcher::spawn(
            project.id.clone(),
            project.project_dir.clone(),
            Arc::clone(&self.persistence),
            Arc::clone(&self.hub),
            self.settings.watcher_interval_secs,
            rx,
            move |project_id| {
                let me = me.clone();
                let project_id = project_id.to_string();
                tokio::spawn(async move { me.handle_watcher_complete(&project_id).await });
            },
        );
    }

    fn stop_watcher(&self, project_id: &str) {
        if let Some(tx) = self.runtime(project_id).watcher_stop.lock().unwrap().take() {
            let _ = tx.send(true);
        }
    }

    async fn handle_watcher_complete(&self, project_id: &str) {
        if let Ok(mut project) = self.persistence.load_project(project_id) {
            let _ = self.transition(&mut project, StatusEvent::SessionComplete { all_done: true }).await;
        }
        let _ = self.stop_agent(project_id).await;
    }

    // --- Session launch ---

    fn spawn_initializer(&self, project: Project) {
        self.ensure_watcher(&project);
        let prompt = prompts::initializer(&project);
        let ctx = session_context(&project, prompt, None, true);
        self.launch(SessionPlan {
            project_id: project.id.clone(),
            project_dir: project.project_dir.clone(),
            kind: SessionKind::Initializer,
            agent_index: 0,
            feature: None,
            branch: None,
            ctx,
            adapter_name: project.provider.clone(),
            parallel_git: false,
        });
    }

    fn spawn_agent_teams(&self, project: Project) {
        self.ensure_watcher(&project);
        let prompt = prompts::agent_teams(&project);
        let ctx = session_context(&project, prompt, Some(500), true);
        self.launch(SessionPlan {
            project_id: project.id.clone(),
            project_dir: project.project_dir.clone(),
            kind: SessionKind::AgentTeams,
            agent_index: 0,
            feature: None,
            branch: None,
            ctx,
            adapter_name: project.provider.clone(),
            parallel_git: false,
        });
    }

    /// Shared by the "already initialized" branch of `start_agent` and by
    /// `confirm_review`: transitions to `running` (a no-op if already
    /// there) and fans out the coding session(s).
    async fn begin_coding(&self, mut project: Project) -> Result<()> {
        self.transition(&mut project, StatusEvent::Start { has_initialized: true }).await?;
        self.ensure_watcher(&project);

        let cached = self.persistence.load_features(&project.id).unwrap_or_default();
        let sync = watcher::sync_once(&project.project_dir, &cached).unwrap_or(watcher::SyncOutcome {
            features: cached,
            changed: false,
            total: 0,
            passed: 0,
            percentage: 0.0,
            all_done: false,
        });
        self.persistence.save_features(&project.id, &sync.features)?;
        let unfinished = sync.total.saturating_sub(sync.passed);

        if sync.all_done {
            let _ = self.transition(&mut project, StatusEvent::SessionComplete { all_done: true }).await;
            return Ok(());
        }

        if project.concurrency <= 1 {
            self.spawn_one_coding_session(project, 0).await?;
        } else {
            let n = (project.concurrency as usize).min(unfinished.max(1));
            for i in 0..n as u32 {
                let me = self.clone();
                let proj = project.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(2000 * i as u64)).await;
                    let _ = me.spawn_one_coding_session(proj, i).await;
                });
            }
        }
        Ok(())
    }

    async fn spawn_one_coding_session(&self, project: Project, agent_index: u32) -> Result<()> {
        if project.concurrency <= 1 {
            let prompt = prompts::coding_generic(&project);
            let ctx = session_context(&project, prompt, None, true);
            self.launch(SessionPlan {
                project_id: project.id.clone(),
                project_dir: project.project_dir.clone(),
                kind: SessionKind::Coding,
                agent_index,
                feature: None,
                branch: None,
                ctx,
                adapter_name: project.provider.clone(),
                parallel_git: false,
            });
            Ok(())
        } else {
            self.spawn_parallel_coding_session(project, agent_index).await
        }
    }

    /// Claims a feature, isolates it on its own branch, and launches the
    /// child under that branch. On exit (see `finish_parallel_session`) the
    /// branch is merged back under the git lock and the claim released.
    async fn spawn_parallel_coding_session(&self, project: Project, agent_index: u32) -> Result<()> {
        let runtime = self.runtime(&project.id);
        let cached = self.persistence.load_features(&project.id).unwrap_or_default();
        let claimed = match runtime.claims.claim(&cached, agent_index) {
            Ok(c) => c,
            Err(_) => {
                tracing::debug!(project_id = %project.id, agent_index, "no claimable feature; skipping this slot");
                return Ok(());
            }
        };
        let branch = format!("agent-{agent_index}/feature-{}", claimed.id);

        let dir = project.project_dir.clone();
        let branch_clone = branch.clone();
        let checkout = {
            let _guard = runtime.git_lock.acquire().await;
            (|| -> std::result::Result<(), String> {
                git::checkout(&dir, "main")?;
                git::create_and_checkout_branch(&dir, &branch_clone)
            })()
        };
        if let Err(e) = checkout {
            runtime.claims.release(&claimed.id);
            tracing::error!(project_id = %project.id, agent_index, error = %e, "git branch setup failed; skipping session");
            return Err(OrchestratorError::GitFailure(e));
        }

        let prompt = prompts::coding_for_feature(&project, &claimed);
        let ctx = session_context(&project, prompt, None, true);
        self.launch(SessionPlan {
            project_id: project.id.clone(),
            project_dir: project.project_dir.clone(),
            kind: SessionKind::Coding,
            agent_index,
            feature: Some(claimed),
            branch: Some(branch),
            ctx,
            adapter_name: project.provider.clone(),
            parallel_git: true,
        });
        Ok(())
    }

    fn launch(&self, plan: SessionPlan) {
        let stopped = Arc::new(AtomicBool::new(false));
        let pid_slot: Arc<Mutex<Option<u32>>> = Arc::new(Mutex::new(None));
        {
            let runtime = self.runtime(&plan.project_id);
            runtime.agents.lock().unwrap().insert(
                plan.agent_index,
                AgentHandle {
                    kind: plan.kind,
                    feature_id: plan.feature.as_ref().map(|f| f.id.clone()),
                    branch: plan.branch.clone(),
                    stopped: Arc::clone(&stopped),
                    pid: Arc::clone(&pid_slot),
                },
            );
        }
        self.publish_agent_count(&plan.project_id);
        let me = self.clone();
        tokio::spawn(async move { me.run_session(plan, stopped, pid_slot).await });
    }

    fn deregister_agent(&self, project_id: &str, agent_index: u32) {
        self.runtime(project_id).agents.lock().unwrap().remove(&agent_index);
        self.publish_agent_count(project_id);
    }

    /// Broadcasts the current `(active, total)` agent count (§4.7). `total`
    /// is the project's configured concurrency; `active` excludes the
    /// reserved review/append-initializer slots, matching `active_agent_count`.
    fn publish_agent_count(&self, project_id: &str) {
        let total = self.persistence.load_project(project_id).map(|p| p.concurrency as usize).unwrap_or(0);
        let active =
            self.runtime(project_id).agents.lock().unwrap().keys().filter(|&&i| i < REVIEW_AGENT_INDEX).count();
        self.hub.publish(project_id, Message::AgentCount { active, total });
    }

    /// The per-child pipeline described in §4.1: spawn, stream, persist,
    /// broadcast, and on exit hand off to the chaining logic.
    async fn run_session(self, plan: SessionPlan, stopped: Arc<AtomicBool>, pid_slot: Arc<Mutex<Option<u32>>>) {
        let session_id = new_id();
        let started_at = Utc::now();
        let mut session = Session {
            id: session_id.clone(),
            project_id: plan.project_id.clone(),
            kind: plan.kind,
            status: SessionStatus::Running,
            agent_index: Some(plan.agent_index),
            feature_id: plan.feature.as_ref().map(|f| f.id.clone()),
            branch: plan.branch.clone(),
            pid: None,
            log_path: None,
            started_at,
            ended_at: None,
        };
        if let Err(e) = self.persistence.upsert_session(&session) {
            tracing::error!(project_id = %plan.project_id, error = %e, "failed to persist session record");
        }

        let raw_log_path = self.persistence.raw_log_path(&session_id);
        if let Some(parent) = raw_log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let mut raw_log = std::fs::OpenOptions::new().create(true).append(true).open(&raw_log_path).ok();
        write_log_line(&mut raw_log, &format!("=== session {session_id} ({:?}) started {started_at} ==="));

        let Some(adapter) = self.providers.get(&plan.adapter_name) else {
            tracing::error!(project_id = %plan.project_id, provider = %plan.adapter_name, "unknown provider at spawn time");
            self.deregister_agent(&plan.project_id, plan.agent_index);
            if let Some(feature) = &plan.feature {
                self.runtime(&plan.project_id).claims.release(&feature.id);
            }
            self.fail_project(&plan.project_id).await;
            return;
        };

        let mut child = match spawn_child(adapter, &plan.ctx, &plan.project_dir) {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(project_id = %plan.project_id, error = %e, "failed to spawn child process");
                write_log_line(&mut raw_log, &format!("=== spawn failed: {e} ==="));
                self.deregister_agent(&plan.project_id, plan.agent_index);
                if let Some(feature) = &plan.feature {
                    self.runtime(&plan.project_id).claims.release(&feature.id);
                }
                self.fail_project(&plan.project_id).await;
                return;
            }
        };

        let pid = child.id();
        *pid_slot.lock().unwrap() = Some(pid);
        session.pid = Some(pid);
        session.log_path = Some(raw_log_path);
        let _ = self.persistence.upsert_session(&session);
        if stopped.load(Ordering::SeqCst) {
            send_signal(pid, "TERM");
        }

        enum Pumped {
            Out(String),
            Err(String),
        }
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Pumped>();

        let out_handle = child.stdout.take().map(|stdout| {
            let tx = tx.clone();
            tokio::task::spawn_blocking(move || {
                for line in std::io::BufReader::new(stdout).lines() {
                    let Ok(line) = line else { break };
                    if tx.send(Pumped::Out(line)).is_err() {
                        break;
                    }
                }
            })
        });
        let err_handle = child.stderr.take().map(|stderr| {
            let tx = tx.clone();
            tokio::task::spawn_blocking(move || {
                for line in std::io::BufReader::new(stderr).lines() {
                    let Ok(line) = line else { break };
                    if tx.send(Pumped::Err(line)).is_err() {
                        break;
                    }
                }
            })
        });
        drop(tx);

        let mut loop_detector = LoopDetector::new(self.settings.loop_detect_window, self.settings.loop_detect_similarity);
        let mut loop_kill_armed = false;
        let mut first_output = false;
        let heartbeat = tokio::time::sleep(Duration::from_secs(self.settings.first_output_heartbeat_secs));
        tokio::pin!(heartbeat);

        loop {
            tokio::select! {
                received = rx.recv() => {
                    match received {
                        Some(Pumped::Out(line)) => {
                            first_output = true;
                            write_log_line(&mut raw_log, &line);
                            self.handle_stdout_line(&plan, &session, adapter, &line, &mut loop_detector, &mut loop_kill_armed, pid).await;
                        }
                        Some(Pumped::Err(line)) => {
                            first_output = true;
                            write_log_line(&mut raw_log, &format!("[STDERR] {line}"));
                            if !line.trim().is_empty() {
                                self.emit_log(&plan.project_id, &session.id, plan.agent_index, LogKind::Error, truncate(&line, 500), None, None).await;
                            }
                        }
                        None => break,
                    }
                }
                _ = &mut heartbeat, if !first_output => {
                    self.emit_log(&plan.project_id, &session.id, plan.agent_index, LogKind::System, "waiting for agent output...".into(), None, None).await;
                }
            }
        }
        if let Some(h) = out_handle {
            let _ = h.await;
        }
        if let Some(h) = err_handle {
            let _ = h.await;
        }

        let exit_code = match tokio::task::spawn_blocking(move || child.wait()).await {
            Ok(Ok(status)) => status.code(),
            Ok(Err(e)) => {
                tracing::error!(project_id = %plan.project_id, error = %e, "failed to wait on child process");
                None
            }
            Err(e) => {
                tracing::error!(project_id = %plan.project_id, error = %e, "child-wait task panicked");
                None
            }
        };
        write_log_line(&mut raw_log, &format!("=== session {session_id} exited (code={exit_code:?}) at {} ===", Utc::now()));

        let was_stopped = stopped.load(Ordering::SeqCst);
        let final_status = if was_stopped {
            SessionStatus::Stopped
        } else if exit_code.map(|c| adapter.is_success_exit(c)).unwrap_or(false) {
            SessionStatus::Completed
        } else {
            SessionStatus::Failed
        };
        session.status = final_status;
        session.ended_at = Some(Utc::now());
        let _ = self.persistence.upsert_session(&session);
        self.hub.publish(&plan.project_id, Message::SessionUpdate(session.clone()));

        self.deregister_agent(&plan.project_id, plan.agent_index);
        if plan.parallel_git {
            self.finish_parallel_session(&plan, &session, final_status).await;
        }
        if let Some(feature) = &plan.feature {
            self.runtime(&plan.project_id).claims.release(&feature.id);
        }

        self.post_exit_chain(&plan, final_status).await;
    }

    async fn fail_project(&self, project_id: &str) {
        if let Ok(mut project) = self.persistence.load_project(project_id) {
            let _ = self.transition(&mut project, StatusEvent::Error).await;
        }
    }

    async fn handle_stdout_line(
        &self,
        plan: &SessionPlan,
        session: &Session,
        adapter: &dyn Adapter,
        line: &str,
        loop_detector: &mut LoopDetector,
        loop_kill_armed: &mut bool,
        pid: u32,
    ) {
        let Some(event) = adapter.parse_line(line) else { return };
        match event {
            AgentEvent::Ignore => {}
            AgentEvent::Thinking(content) => {
                // Temporary: broadcast only, never persisted (§4.3/§9).
                self.hub.publish(
                    &plan.project_id,
                    Message::Log(LogEntry {
                        id: new_id(),
                        session_id: session.id.clone(),
                        timestamp: Utc::now(),
                        kind: LogKind::Thinking,
                        content,
                        tool_name: None,
                        tool_input: None,
                        agent_index: Some(plan.agent_index),
                        temporary: Some(true),
                    }),
                );
            }
            AgentEvent::Text(content) => {
                if let Some(message) = extract_human_help(&content) {
                    self.create_help_request(plan, session, message).await;
                }
                if loop_detector.push(&content) && !*loop_kill_armed {
                    *loop_kill_armed = true;
                    self.handle_loop_detected(plan, session, loop_detector, pid).await;
                }
                self.emit_log(&plan.project_id, &session.id, plan.agent_index, LogKind::Assistant, truncate(&content, 800), None, None).await;
            }
            AgentEvent::ToolUse { name, input } => {
                let content = truncate(&input.to_string(), 200);
                self.emit_log(&plan.project_id, &session.id, plan.agent_index, LogKind::ToolUse, content, Some(name), Some(input)).await;
            }
            AgentEvent::ToolResult(output) => {
                self.emit_log(&plan.project_id, &session.id, plan.agent_index, LogKind::ToolResult, truncate(&output, 500), None, None).await;
            }
            AgentEvent::System(content) => {
                self.emit_log(&plan.project_id, &session.id, plan.agent_index, LogKind::System, truncate(&content, 500), None, None).await;
            }
            AgentEvent::Error(content) => {
                self.emit_log(&plan.project_id, &session.id, plan.agent_index, LogKind::Error, truncate(&content, 500), None, None).await;
            }
        }
    }

    async fn emit_log(
        &self,
        project_id: &str,
        session_id: &str,
        agent_index: u32,
        kind: LogKind,
        content: String,
        tool_name: Option<String>,
        tool_input: Option<serde_json::Value>,
    ) {
        let entry = LogEntry {
            id: new_id(),
            session_id: session_id.to_string(),
            timestamp: Utc::now(),
            kind,
            content,
            tool_name,
            tool_input,
            agent_index: Some(agent_index),
            temporary: None,
        };
        if let Err(e) = self.persistence.append_log(project_id, &entry) {
            tracing::warn!(project_id, error = %e, "failed to persist log entry");
        }
        self.hub.publish(project_id, Message::Log(entry));
    }

    async fn create_help_request(&self, plan: &SessionPlan, session: &Session, message: String) {
        let log_snapshot = self.persistence.read_logs(&plan.project_id).ok().map(|logs| {
            let mut recent: Vec<LogEntry> =
                logs.into_iter().filter(|l| l.session_id == session.id && l.temporary != Some(true)).collect();
            if recent.len() > 8 {
                recent = recent.split_off(recent.len() - 8);
            }
            recent
        });
        let request = HelpRequest {
            id: new_id(),
            project_id: plan.project_id.clone(),
            session_id: session.id.clone(),
            agent_index: plan.agent_index,
            message,
            status: HelpRequestStatus::Pending,
            response: None,
            created_at: Utc::now(),
            resolved_at: None,
            feature_context: plan.feature.as_ref().map(|f| FeatureContext { id: f.id.clone(), description: f.description.clone() }),
            log_snapshot,
        };
        if let Err(e) = self.persistence.add_help_request(&request) {
            tracing::warn!(project_id = %plan.project_id, error = %e, "failed to persist help request");
        }
        self.hub.publish(&plan.project_id, Message::HumanHelp(request));
    }

    async fn handle_loop_detected(&self, plan: &SessionPlan, session: &Session, loop_detector: &LoopDetector, pid: u32) {
        let recent = loop_detector.last_n(self.settings.loop_detect_window).join(" / ");
        tracing::warn!(project_id = %plan.project_id, session_id = %session.id, agent_index = plan.agent_index, "loop detected");
        self.emit_log(
            &plan.project_id,
            &session.id,
            plan.agent_index,
            LogKind::Error,
            format!("loop detected: repeated similar messages ({recent})"),
            None,
            None,
        )
        .await;
        self.create_help_request(plan, session, format!("Agent appears stuck in a loop: {recent}")).await;
        self.terminate_then_kill(pid, self.settings.loop_kill_grace_secs);
    }

    fn terminate_then_kill(&self, pid: u32, grace_secs: u64) {
        send_signal(pid, "TERM");
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(grace_secs)).await;
            if pid_alive(pid) {
                send_signal(pid, "KILL");
            }
        });
    }

    /// Merge the feature branch back under the git lock on a clean exit;
    /// abort and surface a highly visible error log on conflict. Never
    /// attempts conflict resolution (§7).
    async fn finish_parallel_session(&self, plan: &SessionPlan, session: &Session, final_status: SessionStatus) {
        let Some(branch) = plan.branch.clone() else { return };
        if final_status != SessionStatus::Completed {
            return;
        }
        let runtime = self.runtime(&plan.project_id);
        let _guard = runtime.git_lock.acquire().await;
        let dir = plan.project_dir.clone();
        let outcome = (|| -> std::result::Result<git::MergeOutcome, String> {
            git::checkout(&dir, "main")?;
            git::merge_no_ff(&dir, &branch)
        })();
        match outcome {
            Ok(git::MergeOutcome::Merged) => {
                if let Err(e) = git::delete_branch(&dir, &branch) {
                    tracing::warn!(project_id = %plan.project_id, error = %e, "merged branch left behind after delete failure");
                }
            }
            Ok(git::MergeOutcome::Conflict(detail)) => {
                self.emit_log(
                    &plan.project_id,
                    &session.id,
                    plan.agent_index,
                    LogKind::Error,
                    format!("MERGE CONFLICT on {branch}: {} — branch left intact for manual resolution", truncate(&detail, 400)),
                    None,
                    None,
                )
                .await;
            }
            Err(e) => {
                self.emit_log(&plan.project_id, &session.id, plan.agent_index, LogKind::Error, format!("git merge failed: {e}"), None, None).await;
            }
        }
    }

    /// §4.1 "Post-exit chaining": reconcile features, drive the state
    /// machine, and schedule the next session in the chain.
    async fn post_exit_chain(&self, plan: &SessionPlan, final_status: SessionStatus) {
        let Ok(mut project) = self.persistence.load_project(&plan.project_id) else { return };
        let cached = self.persistence.load_features(&plan.project_id).unwrap_or_default();
        let sync = watcher::sync_once(&plan.project_dir, &cached).unwrap_or_else(|_| watcher::SyncOutcome {
            features: cached.clone(),
            changed: false,
            total: 0,
            passed: 0,
            percentage: 0.0,
            all_done: false,
        });
        if sync.changed {
            for (feature_id, passes) in watcher::changed_feature_updates(&cached, &sync.features) {
                self.hub.publish(&plan.project_id, Message::FeatureUpdate { feature_id, passes });
            }
            let _ = self.persistence.save_features(&plan.project_id, &sync.features);
            self.hub.publish(&plan.project_id, Message::FeaturesSync(sync.features.features.clone()));
        }
        self.hub
            .publish(&plan.project_id, Message::Progress { total: sync.total, passed: sync.passed, percentage: sync.percentage });

        match (plan.kind, plan.agent_index) {
            (SessionKind::Initializer, APPEND_INITIALIZER_AGENT_INDEX) => {}
            (SessionKind::Coding, REVIEW_AGENT_INDEX) => {}
            (SessionKind::Initializer, _) => {
                if final_status == SessionStatus::Stopped {
                    let _ = self.transition(&mut project, StatusEvent::Stop { all_agents_stopped: true }).await;
                    return;
                }
                if sync.total == 0 {
                    let _ = self.transition(&mut project, StatusEvent::InitFailed).await;
                    return;
                }
                let review_mode = project.review_before_coding.unwrap_or(false);
                let _ = self.transition(&mut project, StatusEvent::InitComplete { has_features: true, review_mode }).await;
                if !review_mode {
                    let _ = self.begin_coding(project).await;
                }
            }
            (SessionKind::AgentTeams, _) => {
                if final_status == SessionStatus::Stopped {
                    let _ = self.transition(&mut project, StatusEvent::Stop { all_agents_stopped: true }).await;
                } else if sync.all_done {
                    let _ = self.transition(&mut project, StatusEvent::SessionComplete { all_done: true }).await;
                } else if final_status == SessionStatus::Failed {
                    if sync.passed > 0 {
                        let _ = self.transition(&mut project, StatusEvent::Stop { all_agents_stopped: true }).await;
                    } else {
                        let _ = self.transition(&mut project, StatusEvent::Error).await;
                    }
                }
            }
            (SessionKind::Coding, _) => {
                if final_status == SessionStatus::Stopped {
                    let still_running = self.active_agent_count(&plan.project_id).await > 0;
                    let _ = self.transition(&mut project, StatusEvent::Stop { all_agents_stopped: !still_running }).await;
                    return;
                }
                if sync.all_done {
                    let _ = self.transition(&mut project, StatusEvent::SessionComplete { all_done: true }).await;
                    return;
                }
                if project.status == ProjectStatus::Running {
                    let me = self.clone();
                    let project_id = plan.project_id.clone();
                    let agent_index = plan.agent_index;
                    let delay = Duration::from_secs(self.settings.chain_delay_secs);
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        if let Ok(p) = me.persistence.load_project(&project_id) {
                            if p.status == ProjectStatus::Running {
                                let _ = me.spawn_one_coding_session(p, agent_index).await;
                            }
                        }
                    });
                }
            }
        }
    }
}

fn session_context(project: &Project, prompt: String, max_turns: Option<u32>, dangerous_mode: bool) -> SessionContext {
    SessionContext {
        prompt,
        model: Some(project.model.clone()),
        system_prompt: project.system_prompt.clone(),
        max_turns,
        dangerous_mode,
        settings: project.provider_settings.clone(),
    }
}

fn spawn_child(adapter: &dyn Adapter, ctx: &SessionContext, cwd: &std::path::Path) -> std::io::Result<std::process::Child> {
    Command::new(adapter.binary())
        .args(adapter.build_args(ctx))
        .current_dir(cwd)
        .envs(adapter.build_env(ctx))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
}

fn write_log_line(file: &mut Option<std::fs::File>, line: &str) {
    if let Some(f) = file {
        use std::io::Write;
        let _ = writeln!(f, "{line}");
    }
}

/// Literal marker the UI/operator watches for in assistant text (§4.3).
fn extract_human_help(content: &str) -> Option<String> {
    const MARKER: &str = "[HUMAN_HELP]";
    content.find(MARKER).map(|idx| content[idx + MARKER.len()..].trim().to_string())
}

fn pid_alive(pid: u32) -> bool {
    Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn send_signal(pid: u32, signal: &str) {
    let flag = format!("-{signal}");
    let _ = Command::new("kill").args([flag.as_str(), &pid.to_string()]).stdout(Stdio::null()).stderr(Stdio::null()).output();
}

/// Prompt construction. Content is deliberately plain — an external
/// collaborator (prompt template content is out of scope, §1) would swap
/// these for something richer; the orchestrator only needs to get the
/// project/feature context into the child's argv.
mod prompts {
    use crate::claims::ClaimedFeature;
    use crate::persistence::{Feature, Project};

    pub fn initializer(project: &Project) -> String {
        format!(
            "You are the initializer agent for project \"{name}\". Read the specification below and \
             decompose it into a granular feature list. Write the result to `feature_list.json` in the \
             working directory as a JSON array of objects with fields `id`, `category`, `description`, \
             `steps`, `passes` (false), `inProgress` (false). Also write the raw specification to \
             `app_spec.txt` if it is not already present there.\n\n## Specification\n\n{spec}",
            name = project.name,
            spec = project.spec,
        )
    }

    pub fn coding_generic(project: &Project) -> String {
        format!(
            "You are a coding agent working on project \"{name}\". Read `feature_list.json` in the \
             working directory, pick the first feature where `passes` is false, implement and verify \
             it, then set `passes` to true once it genuinely passes. Work on exactly one feature per \
             session, then exit.",
            name = project.name,
        )
    }

    pub fn coding_for_feature(project: &Project, feature: &ClaimedFeature) -> String {
        let steps = if feature.steps.is_empty() {
            String::new()
        } else {
            format!("\n\nImplementation steps:\n{}", feature.steps.iter().map(|s| format!("- {s}")).collect::<Vec<_>>().join("\n"))
        };
        format!(
            "You are a coding agent working on project \"{name}\". Your assigned feature is `{id}`: \
             {description}{steps}\n\nWhen the feature passes verification, set its `passes` field to \
             true in `feature_list.json` and exit.",
            name = project.name,
            id = feature.id,
            description = feature.description,
        )
    }

    pub fn agent_teams(project: &Project) -> String {
        format!(
            "You are coordinating an Agent Teams session for project \"{name}\". Decompose and \
             implement the specification below end to end, delegating sub-work internally as needed. \
             Track progress in `feature_list.json`, updating `passes` for each feature as it \
             completes.\n\n## Specification\n\n{spec}",
            name = project.name,
            spec = project.spec,
        )
    }

    pub fn append_initializer(project: &Project, fragment: &str) -> String {
        format!(
            "The specification for project \"{name}\" has been extended. Re-read `app_spec.txt` and \
             `feature_list.json`, then add any new features implied by the appended fragment below \
             without disturbing features already marked `passes: true`.\n\n## Appended fragment\n\n{fragment}",
            name = project.name,
        )
    }

    pub fn review(project: &Project, features: &[&Feature], instruction: &str) -> String {
        let summary = features.iter().map(|f| format!("- {} ({}): {}", f.id, f.category, f.description)).collect::<Vec<_>>().join("\n");
        format!(
            "You are reviewing a subset of features for project \"{name}\" before coding begins.\n\n\
             ## Features under review\n{summary}\n\n## Reviewer instruction\n{instruction}",
            name = project.name,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{Feature, SessionKind, SessionStatus};
    use crate::providers::{Capabilities, SettingDescriptor};
    use std::collections::BTreeMap as Map;
    use std::path::Path;

    struct EchoAdapter;
    impl Adapter for EchoAdapter {
        fn name(&self) -> &'static str {
            "echo-test"
        }
        fn display_name(&self) -> &'static str {
            "Echo Test"
        }
        fn binary(&self) -> &'static str {
            "sh"
        }
        fn default_model(&self) -> Option<&'static str> {
            None
        }
        fn capabilities(&self) -> Capabilities {
            Capabilities::default()
        }
        fn settings(&self) -> Vec<SettingDescriptor> {
            vec![]
        }
        fn build_args(&self, ctx: &SessionContext) -> Vec<String> {
            vec!["-c".to_string(), "echo hello".to_string() + &ctx.prompt[..0]]
        }
        fn parse_line(&self, line: &str) -> Option<AgentEvent> {
            if line.trim().is_empty() {
                None
            } else {
                Some(AgentEvent::Text(line.to_string()))
            }
        }
    }

    fn test_orchestrator() -> (Orchestrator, tempfile::TempDir) {
        let data_dir = tempfile::tempdir().unwrap();
        let persistence = Arc::new(Persistence::new(data_dir.path()));
        let hub = Arc::new(BroadcastHub::new());
        let mut registry = ProviderRegistry::with_builtin_adapters();
        registry.register(Box::new(EchoAdapter));
        let providers = Arc::new(registry);
        let mut settings = OrchestratorSettings::default();
        settings.watcher_interval_secs = 1;
        settings.chain_delay_secs = 1;
        (Orchestrator::new(persistence, hub, providers, settings), data_dir)
    }

    fn sample_project(id: &str, project_dir: &Path) -> Project {
        Project {
            id: id.into(),
            name: "demo".into(),
            spec: "build a thing".into(),
            status: ProjectStatus::Idle,
            provider: "echo-test".into(),
            provider_settings: Map::new(),
            model: "n/a".into(),
            concurrency: 1,
            use_agent_teams: false,
            system_prompt: None,
            review_before_coding: Some(false),
            project_dir: project_dir.to_path_buf(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    async fn wait_until_idle(orch: &Orchestrator, project_id: &str) {
        for _ in 0..100 {
            if !orch.is_running(project_id).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
    }

    #[tokio::test]
    async fn start_agent_runs_initializer_then_errors_on_empty_feature_list() {
        let (orch, _data) = test_orchestrator();
        let project_dir = tempfile::tempdir().unwrap();
        orch.persistence.save_project(&sample_project("p1", project_dir.path())).unwrap();

        orch.start_agent("p1").await.unwrap();
        wait_until_idle(&orch, "p1").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let loaded = orch.persistence.load_project("p1").unwrap();
        assert_eq!(loaded.status, ProjectStatus::Error);
    }

    #[tokio::test]
    async fn start_agent_already_running_errors() {
        let (orch, _data) = test_orchestrator();
        let project_dir = tempfile::tempdir().unwrap();
        orch.persistence.save_project(&sample_project("p1", project_dir.path())).unwrap();

        orch.start_agent("p1").await.unwrap();
        let err = orch.start_agent("p1").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::AlreadyRunning));
        wait_until_idle(&orch, "p1").await;
    }

    #[tokio::test]
    async fn start_agent_with_all_features_passing_completes_project() {
        let (orch, _data) = test_orchestrator();
        let project_dir = tempfile::tempdir().unwrap();
        orch.persistence.save_project(&sample_project("p1", project_dir.path())).unwrap();
        orch.persistence
            .upsert_session(&Session {
                id: "init-1".into(),
                project_id: "p1".into(),
                kind: SessionKind::Initializer,
                status: SessionStatus::Completed,
                agent_index: Some(0),
                feature_id: None,
                branch: None,
                pid: None,
                log_path: None,
                started_at: Utc::now(),
                ended_at: Some(Utc::now()),
            })
            .unwrap();
        let features = vec![Feature {
            id: "f1".into(),
            category: "c".into(),
            description: "d".into(),
            steps: vec![],
            passes: true,
            in_progress: false,
            fail_count: None,
            last_attempt_at: None,
        }];
        std::fs::write(project_dir.path().join("feature_list.json"), serde_json::to_string(&features).unwrap()).unwrap();

        orch.start_agent("p1").await.unwrap();
        for _ in 0..100 {
            if orch.persistence.load_project("p1").unwrap().status == ProjectStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(orch.persistence.load_project("p1").unwrap().status, ProjectStatus::Completed);
    }

    #[tokio::test]
    async fn start_agent_with_concurrency_and_all_features_passing_completes_without_spawning() {
        let (orch, _data) = test_orchestrator();
        let project_dir = tempfile::tempdir().unwrap();
        let mut project = sample_project("p1", project_dir.path());
        project.concurrency = 3;
        orch.persistence.save_project(&project).unwrap();
        orch.persistence
            .upsert_session(&Session {
                id: "init-1".into(),
                project_id: "p1".into(),
                kind: SessionKind::Initializer,
                status: SessionStatus::Completed,
                agent_index: Some(0),
                feature_id: None,
                branch: None,
                pid: None,
                log_path: None,
                started_at: Utc::now(),
                ended_at: Some(Utc::now()),
            })
            .unwrap();
        let features = vec![Feature {
            id: "f1".into(),
            category: "c".into(),
            description: "d".into(),
            steps: vec![],
            passes: true,
            in_progress: false,
            fail_count: None,
            last_attempt_at: None,
        }];
        std::fs::write(project_dir.path().join("feature_list.json"), serde_json::to_string(&features).unwrap()).unwrap();

        orch.start_agent("p1").await.unwrap();

        assert_eq!(orch.persistence.load_project("p1").unwrap().status, ProjectStatus::Completed);
        assert_eq!(orch.active_agent_count("p1").await, 0, "no doomed claim attempt should have been spawned");
    }

    #[tokio::test]
    async fn launch_and_exit_broadcast_agent_count() {
        let (orch, _data) = test_orchestrator();
        let project_dir = tempfile::tempdir().unwrap();
        orch.persistence.save_project(&sample_project("p1", project_dir.path())).unwrap();
        let mut rx = orch.hub.subscribe("p1");

        orch.start_agent("p1").await.unwrap();

        let mut saw_active = false;
        let mut saw_zero_after = false;
        for _ in 0..50 {
            match tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
                Ok(Ok(envelope)) => {
                    if let Message::AgentCount { active, total } = envelope.message {
                        assert_eq!(total, 1);
                        if active == 1 {
                            saw_active = true;
                        } else if active == 0 && saw_active {
                            saw_zero_after = true;
                            break;
                        }
                    }
                }
                _ => break,
            }
        }
        assert!(saw_active, "expected an agent_count message with active=1 while the initializer ran");
        assert!(saw_zero_after, "expected an agent_count message with active=0 after the initializer exited");
        wait_until_idle(&orch, "p1").await;
    }

    fn init_git_repo(dir: &Path) {
        let run = |args: &[&str]| {
            Command::new("git").args(args).current_dir(dir).output().unwrap();
        };
        run(&["init"]);
        run(&["config", "user.email", "test@test.com"]);
        run(&["config", "user.name", "Test"]);
        std::fs::write(dir.join("README.md"), "seed\n").unwrap();
        run(&["add", "-A"]);
        run(&["commit", "-m", "init"]);
        run(&["branch", "-M", "main"]);
    }

    #[tokio::test]
    async fn parallel_concurrency_claims_distinct_features_and_merges_branches() {
        let (orch, _data) = test_orchestrator();
        let project_dir = tempfile::tempdir().unwrap();
        init_git_repo(project_dir.path());

        let mut project = sample_project("p1", project_dir.path());
        project.concurrency = 2;
        orch.persistence.save_project(&project).unwrap();
        orch.persistence
            .upsert_session(&Session {
                id: "init-1".into(),
                project_id: "p1".into(),
                kind: SessionKind::Initializer,
                status: SessionStatus::Completed,
                agent_index: Some(0),
                feature_id: None,
                branch: None,
                pid: None,
                log_path: None,
                started_at: Utc::now(),
                ended_at: Some(Utc::now()),
            })
            .unwrap();
        let features = vec![
            Feature {
                id: "f1".into(),
                category: "c".into(),
                description: "d1".into(),
                steps: vec![],
                passes: false,
                in_progress: false,
                fail_count: None,
                last_attempt_at: None,
            },
            Feature {
                id: "f2".into(),
                category: "c".into(),
                description: "d2".into(),
                steps: vec![],
                passes: false,
                in_progress: false,
                fail_count: None,
                last_attempt_at: None,
            },
        ];
        std::fs::write(project_dir.path().join("feature_list.json"), serde_json::to_string(&features).unwrap()).unwrap();

        orch.start_agent("p1").await.unwrap();
        // The second parallel slot only launches after the ~2s stagger, so
        // poll on the distinct-branch count actually observed rather than on
        // the agents map draining (which can look empty between the two).
        let mut branches: std::collections::HashSet<String> = std::collections::HashSet::new();
        for _ in 0..200 {
            let sessions = orch.persistence.load_sessions("p1").unwrap();
            branches = sessions.iter().filter_map(|s| s.branch.clone()).collect();
            if branches.len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(branches.len(), 2, "each agent index must claim a distinct feature/branch: {branches:?}");
        assert!(branches.contains("agent-0/feature-f1"));
        assert!(branches.contains("agent-1/feature-f2"));

        for _ in 0..200 {
            if orch.active_agent_count("p1").await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(orch.runtime("p1").claims.is_empty(), "claims must be released on session exit");
    }

    #[tokio::test]
    async fn stop_agent_marks_persisted_sessions_stopped_when_no_in_memory_agents() {
        let (orch, _data) = test_orchestrator();
        let project_dir = tempfile::tempdir().unwrap();
        let mut project = sample_project("p1", project_dir.path());
        project.status = ProjectStatus::Running;
        orch.persistence.save_project(&project).unwrap();
        orch.persistence
            .upsert_session(&Session {
                id: "s1".into(),
                project_id: "p1".into(),
                kind: SessionKind::Coding,
                status: SessionStatus::Running,
                agent_index: Some(0),
                feature_id: None,
                branch: None,
                pid: Some(999_999),
                log_path: None,
                started_at: Utc::now(),
                ended_at: None,
            })
            .unwrap();

        orch.stop_agent("p1").await.unwrap();
        let sessions = orch.persistence.load_sessions("p1").unwrap();
        assert_eq!(sessions[0].status, SessionStatus::Stopped);
        assert_eq!(orch.persistence.load_project("p1").unwrap().status, ProjectStatus::Paused);
    }

    #[tokio::test]
    async fn append_initializer_writes_spec_and_runs_under_reserved_index() {
        let (orch, _data) = test_orchestrator();
        let project_dir = tempfile::tempdir().unwrap();
        let mut project = sample_project("p1", project_dir.path());
        project.status = ProjectStatus::Paused;
        orch.persistence.save_project(&project).unwrap();
        std::fs::write(project_dir.path().join("app_spec.txt"), "original spec").unwrap();

        orch.start_append_initializer("p1", "add login").await.unwrap();
        assert!(orch.is_running("p1").await == false, "reserved index 99 must not count as the main agent");
        let spec = std::fs::read_to_string(project_dir.path().join("app_spec.txt")).unwrap();
        assert!(spec.starts_with("original spec"));
        assert!(spec.ends_with("add login"));

        for _ in 0..100 {
            if orch.runtime("p1").agents.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
    }

    #[test]
    fn extract_human_help_finds_marker_and_trims_message() {
        assert_eq!(extract_human_help("all good"), None);
        assert_eq!(extract_human_help("[HUMAN_HELP] need a decision about X"), Some("need a decision about X".to_string()));
    }

    #[test]
    fn pid_alive_false_for_unlikely_pid() {
        assert!(!pid_alive(999_999_999));
    }

    #[tokio::test]
    async fn init_recovery_kills_orphaned_pids_and_pauses_projects() {
        let (orch, _data) = test_orchestrator();
        let project_dir = tempfile::tempdir().unwrap();
        let mut project = sample_project("p1", project_dir.path());
        project.status = ProjectStatus::Running;
        orch.persistence.save_project(&project).unwrap();

        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        orch.persistence
            .upsert_session(&Session {
                id: "orphan-1".into(),
                project_id: "p1".into(),
                kind: SessionKind::Coding,
                status: SessionStatus::Running,
                agent_index: Some(0),
                feature_id: None,
                branch: None,
                pid: Some(pid),
                log_path: None,
                started_at: Utc::now(),
                ended_at: None,
            })
            .unwrap();

        assert!(pid_alive(pid));
        orch.init_recovery().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!pid_alive(pid));

        let sessions = orch.persistence.load_sessions("p1").unwrap();
        assert_eq!(sessions[0].status, SessionStatus::Stopped);
        assert!(sessions[0].ended_at.is_some());
        assert_eq!(orch.persistence.load_project("p1").unwrap().status, ProjectStatus::Paused);

        let _ = child.wait();
    }

    #[tokio::test]
    async fn init_recovery_ignores_idle_projects() {
        let (orch, _data) = test_orchestrator();
        let project_dir = tempfile::tempdir().unwrap();
        let project = sample_project("p1", project_dir.path());
        orch.persistence.save_project(&project).unwrap();

        orch.init_recovery().await.unwrap();
        assert_eq!(orch.persistence.load_project("p1").unwrap().status, ProjectStatus::Idle);
    }
}
