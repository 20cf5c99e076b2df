//! Process Supervisor.
//!
//! Owns the `running` / `paused` registries and the project mirror, all inside one
//! [`SupervisorState`] behind a single async mutex. A stop always takes the [`RunState`]
//! out of the registry before terminating anything, so two callers can never stop the
//! same processes twice.
//!
//! Operations return errors instead of notifying; the caller reports them once.

mod process;
mod state;
mod sweep;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as TtlDuration, Utc};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::HostConfig;
use crate::deps::{DependencyInstaller, InstallOutcome};
use crate::error::{HostError, HostResult};
use crate::gateway::Notifier;
use crate::project::{ChatId, PrincipalId, Project, ProjectId};
use crate::store::ProjectStore;

pub use process::{spawn_process, OutputContext, ProcessHandle};
pub use state::{RunState, SupervisorState};
pub use sweep::{SweepOutcome, SweepReport};

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub max_running: usize,
    pub python_program: String,
    pub stop_grace: Duration,
    pub stderr_limit: usize,
    pub restart_interval: Duration,
    pub expiry_check_interval: Duration,
    pub sweep_backoff: Duration,
    pub install_blocks_start: bool,
}

impl From<&HostConfig> for SupervisorSettings {
    fn from(cfg: &HostConfig) -> Self {
        Self {
            max_running: cfg.max_running,
            python_program: cfg.python_program.clone(),
            stop_grace: cfg.stop_grace(),
            stderr_limit: cfg.stderr_limit,
            restart_interval: cfg.restart_interval(),
            expiry_check_interval: cfg.expiry_check_interval(),
            sweep_backoff: cfg.sweep_backoff(),
            install_blocks_start: cfg.install_blocks_start,
        }
    }
}

/// Parameters of one `start` call.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub project: ProjectId,
    pub ttl: Option<TtlDuration>,
    pub auto_restart: bool,
    /// Record handed off by the onboarding workflow; persisted before launching.
    pub handoff: Option<Project>,
    /// Send the "started" notice on success.
    pub announce: bool,
}

impl StartRequest {
    pub fn new(project: ProjectId) -> Self {
        Self {
            project,
            ttl: None,
            auto_restart: true,
            handoff: None,
            announce: true,
        }
    }

    pub fn for_days(self, days: Option<u32>) -> Self {
        self.with_ttl(days.map(|d| TtlDuration::days(i64::from(d))))
    }

    pub fn with_ttl(mut self, ttl: Option<TtlDuration>) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn auto_restart(mut self, enabled: bool) -> Self {
        self.auto_restart = enabled;
        self
    }

    /// Start from a selection that was never saved: the record is built here and persisted
    /// once validation passes. Onboarding saves at the duration step and starts by id, so
    /// this is the entry for transports that skip that step.
    pub fn with_handoff(mut self, owner_id: PrincipalId, chat_id: ChatId, main_files: Vec<PathBuf>) -> Self {
        self.handoff = Some(Project::new(self.project.clone(), owner_id, chat_id, main_files));
        self
    }

    pub fn quiet(mut self) -> Self {
        self.announce = false;
        self
    }
}

/// Result of an operation that relaunches from a previous run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relaunch {
    Started,
    /// The carried deadline had passed; nothing was launched.
    Expired,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProjectStatus {
    Running { remaining: Option<TtlDuration> },
    Paused,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct ProjectView {
    pub project: Project,
    pub status: ProjectStatus,
}

/// Read-only copy of a run state.
#[derive(Debug, Clone)]
pub struct RunSnapshot {
    pub pids: Vec<u32>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub auto_restart: bool,
}

impl From<&RunState> for RunSnapshot {
    fn from(run: &RunState) -> Self {
        Self {
            pids: run.pids(),
            start_time: run.start_time,
            end_time: run.end_time,
            auto_restart: run.auto_restart,
        }
    }
}

pub struct Supervisor {
    settings: SupervisorSettings,
    state: Mutex<SupervisorState>,
    store: ProjectStore,
    notifier: Notifier,
    installer: Arc<dyn DependencyInstaller>,
    keep_running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    background: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    /// Loads the persisted projects into the mirror. Projects whose directory vanished stay
    /// listed; `start` reports their missing files.
    pub fn new(
        settings: SupervisorSettings,
        store: ProjectStore,
        notifier: Notifier,
        installer: Arc<dyn DependencyInstaller>,
    ) -> HostResult<Self> {
        let projects = store.load_projects()?;
        let count: usize = projects.values().map(Vec::len).sum();
        for project in projects.values().flatten() {
            if !project.id.dir().exists() {
                warn!(project = %project.id, owner = project.owner_id, "project directory missing");
            }
        }
        info!(owners = projects.len(), projects = count, "loaded stored projects");

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            settings,
            state: Mutex::new(SupervisorState {
                projects,
                ..SupervisorState::default()
            }),
            store,
            notifier,
            installer,
            keep_running: AtomicBool::new(true),
            shutdown_tx,
            background: std::sync::Mutex::new(None),
        })
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn installer(&self) -> &Arc<dyn DependencyInstaller> {
        &self.installer
    }

    pub fn is_alive(&self) -> bool {
        self.keep_running.load(Ordering::SeqCst)
    }

    // --- project records ---

    /// Insert or refresh a project record and persist the owner's list.
    pub async fn register_project(&self, project: Project) -> HostResult<()> {
        let mut state = self.state.lock().await;
        self.upsert_and_persist(&mut state, project)
    }

    fn upsert_and_persist(&self, state: &mut SupervisorState, project: Project) -> HostResult<()> {
        let owner = project.owner_id;
        let previous = state.projects.get(&owner).cloned();
        let id = project.id.clone();
        let list = state.upsert_project(project);
        if let Err(e) = self.store.save_owner_projects(owner, &list) {
            restore_owner(state, owner, previous);
            return Err(e);
        }
        info!(project = %id, owner, "project saved");
        Ok(())
    }

    pub async fn find_project(&self, id: &ProjectId) -> Option<Project> {
        self.state.lock().await.find_project(id).cloned()
    }

    /// The owner's projects with their current status, in upload order.
    pub async fn list_projects(&self, owner: PrincipalId) -> Vec<ProjectView> {
        let state = self.state.lock().await;
        let now = Utc::now();
        state
            .projects
            .get(&owner)
            .map(|list| {
                list.iter()
                    .map(|project| {
                        let status = if let Some(run) = state.running.get(&project.id) {
                            ProjectStatus::Running {
                                remaining: run.remaining(now),
                            }
                        } else if state.paused.contains_key(&project.id) {
                            ProjectStatus::Paused
                        } else {
                            ProjectStatus::Stopped
                        };
                        ProjectView {
                            project: project.clone(),
                            status,
                        }
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn is_running(&self, id: &ProjectId) -> bool {
        self.state.lock().await.running.contains_key(id)
    }

    pub async fn is_paused(&self, id: &ProjectId) -> bool {
        self.state.lock().await.paused.contains_key(id)
    }

    /// Running, paused or being launched.
    pub async fn is_active(&self, id: &ProjectId) -> bool {
        self.state.lock().await.is_active(id)
    }

    pub async fn running_snapshot(&self, id: &ProjectId) -> Option<RunSnapshot> {
        self.state.lock().await.running.get(id).map(RunSnapshot::from)
    }

    pub async fn paused_snapshot(&self, id: &ProjectId) -> Option<RunSnapshot> {
        self.state.lock().await.paused.get(id).map(RunSnapshot::from)
    }

    pub async fn running_count(&self) -> usize {
        self.state.lock().await.running.len()
    }

    // --- lifecycle ---

    /// Launch one child per main file. Returns the number of processes launched.
    pub async fn start(&self, req: StartRequest) -> HostResult<usize> {
        let id = req.project.clone();
        let project = self.reserve(&req).await?;

        match self.launch(&project).await {
            Ok(processes) => {
                let launched = processes.len();
                self.commit(&req, &project, processes).await?;
                info!(project = %id, processes = launched, ttl = ?req.ttl, "project started");
                if req.announce {
                    self.notifier
                        .send(
                            project.chat_id,
                            &format!("✅ Started project: {}", project.display_name),
                        )
                        .await;
                }
                Ok(launched)
            }
            Err(e) => {
                self.state.lock().await.starting.remove(&id);
                warn!(project = %id, error = %e, "failed to start project");
                Err(e)
            }
        }
    }

    /// Validate under the lock and claim a slot. Registries are untouched on error.
    async fn reserve(&self, req: &StartRequest) -> HostResult<Project> {
        if !self.is_alive() {
            return Err(HostError::Validation("the host is shutting down".to_string()));
        }
        let id = &req.project;
        let mut state = self.state.lock().await;
        if state.running.contains_key(id) || state.starting.contains(id) {
            return Err(HostError::AlreadyActive(id.name()));
        }

        let project = match &req.handoff {
            Some(handoff) => handoff.clone(),
            None => state
                .find_project(id)
                .cloned()
                .ok_or_else(|| HostError::NotFound(format!("No project found: {}", id.name())))?,
        };
        if project.main_files.is_empty() {
            return Err(HostError::NoMainFiles);
        }
        let occupied = state.occupied_slots();
        if occupied >= self.settings.max_running {
            return Err(HostError::CapacityExceeded {
                running: occupied,
                max: self.settings.max_running,
            });
        }
        let missing = project.missing_main_files();
        if !missing.is_empty() {
            return Err(HostError::MissingFiles(missing));
        }

        let project = if req.handoff.is_some() {
            self.upsert_and_persist(&mut state, project)?;
            state.find_project(id).cloned().ok_or_else(|| HostError::NotFound(format!("No project found: {}", id.name())))?
        } else {
            project
        };
        state.starting.insert(id.clone());
        Ok(project)
    }

    async fn launch(&self, project: &Project) -> HostResult<Vec<ProcessHandle>> {
        match self.installer.install(project.id.dir()).await {
            Ok(InstallOutcome::Installed) => {
                debug!(project = %project.id, "dependencies installed")
            }
            Ok(InstallOutcome::Skipped) => {}
            Err(e) if self.settings.install_blocks_start => return Err(e),
            Err(e) => warn!(project = %project.id, error = %e, "starting despite failed installation"),
        }

        let ctx = OutputContext {
            project_name: project.display_name.clone(),
            chat_id: project.chat_id,
            notifier: self.notifier.clone(),
            stderr_limit: self.settings.stderr_limit,
        };
        let mut processes = Vec::with_capacity(project.main_files.len());
        for main_file in &project.main_files {
            match spawn_process(&self.settings.python_program, main_file, ctx.clone()) {
                Ok(handle) => processes.push(handle),
                Err(e) => {
                    error!(project = %project.id, main_file = %main_file.display(), error = %e, "launch failed");
                    self.notifier.send(project.chat_id, &e.user_message()).await;
                }
            }
        }
        if processes.is_empty() {
            return Err(HostError::NothingLaunched);
        }
        Ok(processes)
    }

    async fn commit(
        &self,
        req: &StartRequest,
        project: &Project,
        mut processes: Vec<ProcessHandle>,
    ) -> HostResult<()> {
        let mut state = self.state.lock().await;
        state.starting.remove(&project.id);
        if !self.is_alive() {
            drop(state);
            for handle in processes.iter_mut() {
                handle.terminate(self.settings.stop_grace).await;
            }
            return Err(HostError::Validation("the host is shutting down".to_string()));
        }
        let now = Utc::now();
        state.paused.remove(&project.id);
        state.running.insert(
            project.id.clone(),
            RunState {
                owner_id: project.owner_id,
                chat_id: project.chat_id,
                display_name: project.display_name.clone(),
                main_files: project.main_files.clone(),
                processes,
                start_time: now,
                end_time: req.ttl.map(|ttl| now + ttl),
                auto_restart: req.auto_restart,
            },
        );
        Ok(())
    }

    async fn take_running(&self, id: &ProjectId) -> HostResult<RunState> {
        self.state
            .lock()
            .await
            .running
            .remove(id)
            .ok_or_else(|| HostError::NotFound(format!("No running project found: {}", id.name())))
    }

    async fn terminate_run(&self, run: &mut RunState) {
        for handle in run.processes.iter_mut() {
            handle.terminate(self.settings.stop_grace).await;
        }
    }

    pub async fn stop(&self, id: &ProjectId) -> HostResult<()> {
        let mut run = self.take_running(id).await?;
        self.terminate_run(&mut run).await;
        info!(project = %id, "project stopped");
        self.notifier
            .send(run.chat_id, &format!("⏹️ Project stopped: {}", run.display_name))
            .await;
        Ok(())
    }

    /// Stop the processes but keep the run state, deadline included, for `resume`.
    pub async fn pause(&self, id: &ProjectId) -> HostResult<()> {
        let mut run = self.take_running(id).await?;
        self.terminate_run(&mut run).await;
        let mut state = self.state.lock().await;
        if state.running.contains_key(id) {
            debug!(project = %id, "started again while pausing, paused record dropped");
        } else if state.find_project(id).is_none() {
            debug!(project = %id, "deleted while pausing, paused record dropped");
        } else {
            state.paused.insert(id.clone(), run);
        }
        info!(project = %id, "project paused");
        Ok(())
    }

    /// Relaunch a paused project with its remaining time.
    pub async fn resume(&self, id: &ProjectId) -> HostResult<Relaunch> {
        let carried = {
            let state = self.state.lock().await;
            state
                .paused
                .get(id)
                .map(|run| (run.end_time, run.auto_restart, run.chat_id, run.display_name.clone()))
        };
        let (end_time, auto_restart, chat_id, name) =
            carried.ok_or_else(|| HostError::NotFound(format!("No paused project found: {}", id.name())))?;
        let outcome = self.relaunch(id, end_time, auto_restart, chat_id, &name, true).await?;
        if outcome == Relaunch::Started {
            info!(project = %id, "project resumed");
        }
        Ok(outcome)
    }

    /// Stop if running, then start again carrying the deadline and `auto_restart`. A paused
    /// project is relaunched with its paused values; a stopped one with defaults.
    pub async fn restart(&self, id: &ProjectId) -> HostResult<Relaunch> {
        match self.take_running(id).await {
            Ok(run) => self.restart_from(id, run).await,
            Err(HostError::NotFound(_)) => {
                let carried = {
                    let state = self.state.lock().await;
                    state
                        .paused
                        .get(id)
                        .map(|run| (run.end_time, run.auto_restart))
                        .zip(state.find_project(id).map(|p| (p.chat_id, p.display_name.clone())))
                };
                match carried {
                    Some(((end_time, auto_restart), (chat_id, name))) => {
                        self.relaunch(id, end_time, auto_restart, chat_id, &name, false).await
                    }
                    None => {
                        self.start(StartRequest::new(id.clone()).quiet()).await?;
                        Ok(Relaunch::Started)
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Restart only if currently running; used by the sweep.
    async fn restart_running(&self, id: &ProjectId) -> HostResult<Relaunch> {
        let run = self.take_running(id).await?;
        self.restart_from(id, run).await
    }

    async fn restart_from(&self, id: &ProjectId, mut run: RunState) -> HostResult<Relaunch> {
        self.terminate_run(&mut run).await;
        self.relaunch(id, run.end_time, run.auto_restart, run.chat_id, &run.display_name, false)
            .await
    }

    async fn relaunch(
        &self,
        id: &ProjectId,
        end_time: Option<DateTime<Utc>>,
        auto_restart: bool,
        chat_id: ChatId,
        name: &str,
        announce: bool,
    ) -> HostResult<Relaunch> {
        let ttl = match end_time {
            Some(end) => {
                let remaining = end - Utc::now();
                if remaining <= TtlDuration::zero() {
                    self.state.lock().await.paused.remove(id);
                    self.announce_expiry(id, chat_id, name).await;
                    return Ok(Relaunch::Expired);
                }
                Some(remaining)
            }
            None => None,
        };
        let mut req = StartRequest::new(id.clone()).with_ttl(ttl).auto_restart(auto_restart);
        req.announce = announce;
        self.start(req).await?;
        Ok(Relaunch::Started)
    }

    async fn announce_expiry(&self, id: &ProjectId, chat_id: ChatId, name: &str) {
        info!(project = %id, "project duration expired");
        self.notifier
            .send(chat_id, &format!("⌛ Duration expired for project: {}", name))
            .await;
    }

    /// Replace the deadline of a running project. `None` removes it.
    pub async fn set_duration(&self, id: &ProjectId, days: Option<u32>) -> HostResult<Option<DateTime<Utc>>> {
        let mut state = self.state.lock().await;
        let run = state.running.get_mut(id).ok_or_else(|| {
            HostError::Validation("Cannot set duration for inactive project".to_string())
        })?;
        run.end_time = days.map(|d| Utc::now() + TtlDuration::days(i64::from(d)));
        info!(project = %id, end_time = ?run.end_time, "duration updated");
        Ok(run.end_time)
    }

    /// Forget the project: stop it, drop any paused record, remove the stored record and
    /// the extracted directory.
    pub async fn delete(&self, id: &ProjectId) -> HostResult<()> {
        let (running, had_record) = {
            let mut state = self.state.lock().await;
            let had_record = match state.find_project(id).map(|p| p.owner_id) {
                Some(owner) => {
                    let previous = state.projects.get(&owner).cloned();
                    if let Some((owner, remaining)) = state.remove_project(id) {
                        if let Err(e) = self.store.save_owner_projects(owner, &remaining) {
                            restore_owner(&mut state, owner, previous);
                            return Err(e);
                        }
                    }
                    true
                }
                None => false,
            };
            state.paused.remove(id);
            (state.running.remove(id), had_record)
        };

        if let Some(mut run) = running {
            self.terminate_run(&mut run).await;
        }

        let dir = id.dir();
        let had_dir = dir.exists();
        if had_dir {
            tokio::fs::remove_dir_all(dir).await?;
        }
        if !had_record && !had_dir {
            return Err(HostError::NotFound(format!("No project found: {}", id.name())));
        }
        info!(project = %id, "project deleted");
        Ok(())
    }

    /// Idempotent. Stops the background loop, then every running project.
    pub async fn shutdown(&self) {
        if !self.keep_running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("supervisor shutting down");
        let _ = self.shutdown_tx.send(true);

        let background = self.background.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = background {
            if let Err(e) = handle.await {
                error!(error = %e, "background loop ended abnormally");
            }
        }

        let runs: Vec<(ProjectId, RunState)> = self.state.lock().await.running.drain().collect();
        for (id, mut run) in runs {
            self.terminate_run(&mut run).await;
            info!(project = %id, "project stopped on shutdown");
        }
        if let Err(e) = self.store.flush() {
            warn!(error = %e, "store flush failed");
        }
    }
}

fn restore_owner(state: &mut SupervisorState, owner: PrincipalId, previous: Option<Vec<Project>>) {
    match previous {
        Some(list) => {
            state.projects.insert(owner, list);
        }
        None => {
            state.projects.remove(&owner);
        }
    }
}
