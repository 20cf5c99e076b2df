//! Selection Workflow: turns an uploaded archive into a persisted project record.
//!
//! ```text
//! AwaitingScriptCount -> AwaitingSingleScript   -> AwaitingDuration -> (record saved)
//!                     -> AwaitingTwoScriptNames ->
//! ```
//!
//! One session per uploading user. Choices that reference a missing session, or a session
//! in a different stage, are stale and answered with [`HostError::SessionExpired`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, warn};

use crate::archive::{python_scripts, resolve_script};
use crate::command::{Action, ProjectCommand, CANCEL_TOKEN, DURATION_CHOICES};
use crate::deps::InstallOutcome;
use crate::error::{HostError, HostResult};
use crate::gateway::{Choice, MessageId};
use crate::project::{ChatId, PrincipalId, Project, ProjectId};
use crate::supervisor::Supervisor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    AwaitingScriptCount,
    AwaitingSingleScript,
    AwaitingTwoScriptNames,
    AwaitingDuration,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub project: ProjectId,
    pub chat_id: ChatId,
    pub stage: Stage,
    pub script_count: Option<u8>,
    pub selected: Vec<PathBuf>,
    pub available: Vec<String>,
}

impl Session {
    fn new(project: ProjectId, chat_id: ChatId) -> Self {
        Self {
            project,
            chat_id,
            stage: Stage::AwaitingScriptCount,
            script_count: None,
            selected: Vec::new(),
            available: Vec::new(),
        }
    }
}

/// {1 Day, 3 Days, 7 Days, No Duration}, each mapped to an action by `to_action`.
pub fn duration_choices(to_action: impl Fn(Option<u32>) -> Action) -> Vec<Choice> {
    DURATION_CHOICES
        .iter()
        .map(|&d| {
            let label = if d == 1 {
                "1 Day".to_string()
            } else {
                format!("{} Days", d)
            };
            Choice::new(label, &to_action(Some(d)))
        })
        .chain(std::iter::once(Choice::new("No Duration", &to_action(None))))
        .collect()
}

pub struct Onboarding {
    sessions: DashMap<PrincipalId, Session>,
    supervisor: Arc<Supervisor>,
}

impl Onboarding {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self {
            sessions: DashMap::new(),
            supervisor,
        }
    }

    pub fn stage(&self, user_id: PrincipalId) -> Option<Stage> {
        self.sessions.get(&user_id).map(|s| s.stage)
    }

    pub fn session(&self, user_id: PrincipalId) -> Option<Session> {
        self.sessions.get(&user_id).map(|s| s.clone())
    }

    /// Copy of the session, provided it is in `stage`.
    fn session_in(&self, user_id: PrincipalId, stage: Stage) -> HostResult<Session> {
        match self.sessions.get(&user_id) {
            Some(s) if s.stage == stage => Ok(s.clone()),
            _ => Err(HostError::SessionExpired),
        }
    }

    fn update(&self, user_id: PrincipalId, f: impl FnOnce(&mut Session)) {
        if let Some(mut s) = self.sessions.get_mut(&user_id) {
            f(s.value_mut());
        }
    }

    /// A freshly extracted archive. Replaces any previous session of the user; the upload
    /// that session was holding is deleted unless it has been saved since.
    pub async fn begin(&self, user_id: PrincipalId, chat_id: ChatId, project: ProjectId) {
        let name = project.name();
        let previous = self
            .sessions
            .insert(user_id, Session::new(project.clone(), chat_id));
        if let Some(previous) = previous {
            if previous.project != project
                && self.supervisor.find_project(&previous.project).await.is_none()
            {
                info!(user_id, project = %previous.project, "abandoned upload replaced");
                discard_upload(previous.project.dir()).await;
            }
        }
        info!(user_id, project = %name, "received new project");
        let choices = [
            Choice::new("One Script", &Action::ScriptCount(1)),
            Choice::new("Two Scripts", &Action::ScriptCount(2)),
        ];
        self.supervisor
            .notifier()
            .send_with_choices(
                chat_id,
                &format!(
                    "📦 Received project: {}\n\n🔢 Please select the number of scripts to run:",
                    name
                ),
                &choices,
            )
            .await;
    }

    pub async fn select_count(
        &self,
        user_id: PrincipalId,
        chat_id: ChatId,
        message_id: MessageId,
        count: u8,
    ) -> HostResult<()> {
        let session = self.session_in(user_id, Stage::AwaitingScriptCount)?;
        let notifier = self.supervisor.notifier();
        let scripts = python_scripts(session.project.dir());
        if scripts.is_empty() {
            self.sessions.remove(&user_id);
            notifier
                .edit(chat_id, message_id, "⚠️ No Python (.py) files found in the project", &[])
                .await;
            return Ok(());
        }

        if count == 1 {
            let mut choices: Vec<Choice> = scripts
                .iter()
                .enumerate()
                .map(|(i, script)| Choice::new(script.clone(), &Action::SelectScript(i)))
                .collect();
            choices.push(Choice::new("Cancel", &Action::CancelSelection));
            self.update(user_id, |s| {
                s.script_count = Some(1);
                s.stage = Stage::AwaitingSingleScript;
                s.available = scripts;
            });
            notifier
                .edit(chat_id, message_id, "📂 Please select the main script:", &choices)
                .await;
        } else {
            let text = format!(
                "📂 Please send the names of the two scripts to run (e.g., main.py worker.py)\n\
                 Available scripts:\n{}\n\nOr press {} to cancel",
                scripts.join("\n"),
                CANCEL_TOKEN
            );
            self.update(user_id, |s| {
                s.script_count = Some(2);
                s.stage = Stage::AwaitingTwoScriptNames;
                s.available = scripts;
            });
            notifier.edit(chat_id, message_id, &text, &[]).await;
        }
        Ok(())
    }

    pub async fn select_script(
        &self,
        user_id: PrincipalId,
        chat_id: ChatId,
        message_id: MessageId,
        index: usize,
    ) -> HostResult<()> {
        let session = self.session_in(user_id, Stage::AwaitingSingleScript)?;
        let name = session
            .available
            .get(index)
            .cloned()
            .ok_or(HostError::SessionExpired)?;
        let path = resolve_script(session.project.dir(), &name)
            .ok_or_else(|| HostError::MissingFiles(vec![PathBuf::from(&name)]))?;

        self.update(user_id, |s| {
            s.selected = vec![path];
            s.stage = Stage::AwaitingDuration;
        });
        self.supervisor
            .notifier()
            .edit(
                chat_id,
                message_id,
                &format!(
                    "📄 Selected main script: {}\n\n⏳ Please select the execution duration:",
                    name
                ),
                &duration_choices(Action::Duration),
            )
            .await;
        Ok(())
    }

    /// The cancel choice of the script list. Deletes the extracted directory.
    pub async fn cancel_selection(
        &self,
        user_id: PrincipalId,
        chat_id: ChatId,
        message_id: MessageId,
    ) -> HostResult<()> {
        let (_, session) = self
            .sessions
            .remove(&user_id)
            .ok_or(HostError::SessionExpired)?;
        let text = discard_upload(session.project.dir()).await;
        self.supervisor.notifier().edit(chat_id, message_id, &text, &[]).await;
        Ok(())
    }

    /// Free text while the user owes two script names. Returns `false` when no such prompt is
    /// outstanding, leaving the text to the caller.
    pub async fn handle_text(&self, user_id: PrincipalId, chat_id: ChatId, text: &str) -> HostResult<bool> {
        let Ok(session) = self.session_in(user_id, Stage::AwaitingTwoScriptNames) else {
            return Ok(false);
        };
        let notifier = self.supervisor.notifier();

        if text.trim() == CANCEL_TOKEN {
            self.sessions.remove(&user_id);
            let reply = discard_upload(session.project.dir()).await;
            notifier.send(chat_id, &reply).await;
            return Ok(true);
        }

        let names: Vec<&str> = text.split_whitespace().collect();
        if names.len() != 2 {
            notifier
                .send(
                    chat_id,
                    &format!(
                        "⚠️ Please send exactly two script names.\nOr press {} to cancel",
                        CANCEL_TOKEN
                    ),
                )
                .await;
            return Ok(true);
        }

        let mut missing = Vec::new();
        let mut main_files = Vec::new();
        for name in &names {
            match resolve_script(session.project.dir(), name) {
                Some(path) => main_files.push(path),
                None => missing.push(*name),
            }
        }
        if !missing.is_empty() {
            notifier
                .send(
                    chat_id,
                    &format!(
                        "⚠️ Missing files: {}\nPlease send valid script names or {} to cancel",
                        missing.join(", "),
                        CANCEL_TOKEN
                    ),
                )
                .await;
            return Ok(true);
        }

        self.update(user_id, |s| {
            s.selected = main_files;
            s.stage = Stage::AwaitingDuration;
        });
        notifier
            .send_with_choices(
                chat_id,
                &format!(
                    "📦 Project: {}\n📄 Main scripts: {}\n\n⏳ Please select the execution duration:",
                    session.project.name(),
                    names.join(", ")
                ),
                &duration_choices(Action::Duration),
            )
            .await;
        Ok(true)
    }

    /// Final step: persist the record, install dependencies best-effort, close the session.
    pub async fn select_duration(
        &self,
        user_id: PrincipalId,
        chat_id: ChatId,
        message_id: MessageId,
        days: Option<u32>,
    ) -> HostResult<()> {
        let session = self.session_in(user_id, Stage::AwaitingDuration)?;
        if session.selected.is_empty() {
            return Err(HostError::NoMainFiles);
        }

        let project = Project::new(session.project.clone(), user_id, chat_id, session.selected.clone());
        self.supervisor.register_project(project).await?;

        let installed = match self.supervisor.installer().install(session.project.dir()).await {
            Ok(InstallOutcome::Installed) | Ok(InstallOutcome::Skipped) => true,
            Err(e) => {
                warn!(project = %session.project, error = %e, "dependency installation failed during onboarding");
                self.supervisor.notifier().send(chat_id, &e.user_message()).await;
                false
            }
        };
        self.sessions.remove(&user_id);

        let status = if installed {
            "✅ Main scripts set and dependencies installed"
        } else {
            "⚠️ Main scripts set but some dependencies failed to install"
        };
        let duration = match days {
            Some(d) => format!("⏳ Duration: {} days", d),
            None => "⏳ No duration set".to_string(),
        };
        let scripts: Vec<String> = session
            .selected
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();
        let choices = [
            Choice::new(
                "▶️ Run Now",
                &Action::project(ProjectCommand::Run { days }, &session.project),
            ),
            Choice::new(
                "⏳ Run Later",
                &Action::project(ProjectCommand::RunLater, &session.project),
            ),
        ];
        info!(user_id, project = %session.project, "project ready");
        self.supervisor
            .notifier()
            .edit(
                chat_id,
                message_id,
                &format!(
                    "{}\n{}\n\n📦 Project: {} ready to run\n📄 Main scripts: {}",
                    status,
                    duration,
                    session.project.name(),
                    scripts.join(", ")
                ),
                &choices,
            )
            .await;
        Ok(())
    }
}

async fn discard_upload(dir: &Path) -> String {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {
            info!(project = %dir.display(), "cancelled project upload");
            "❌ Operation cancelled and project deleted.".to_string()
        }
        Err(e) => {
            warn!(project = %dir.display(), error = %e, "failed to delete cancelled upload");
            format!("❌ Failed to delete project: {}", e)
        }
    }
}
