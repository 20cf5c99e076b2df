//! Inbound event routing: access gate, retry boundary, and one handler per user action.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Duration as TtlDuration;
use tracing::{error, info, warn};

use crate::access::AccessControl;
use crate::archive::extract_zip;
use crate::command::{Action, ProjectCommand, UserCommand};
use crate::error::{HostError, HostResult};
use crate::gateway::{Choice, FileRef, GatewayEvent, MessageId};
use crate::onboarding::{duration_choices, Onboarding};
use crate::project::{ChatId, PrincipalId, ProjectId};
use crate::retry::{with_retry, RetryPolicy};
use crate::supervisor::{ProjectStatus, ProjectView, Relaunch, StartRequest, Supervisor};

const HELP_TEXT: &str = "👑 Welcome to the Python project hosting system 👑

Features:
- Complete ownership system 👩‍💻
- Support for multi-file projects 📁
- Manual main file selection 👆
- Install dependencies from requirements.txt ✍⌨️
- Set execution duration 📶
- Periodic automatic restart 🚀

Available Commands:
/start - Show this message 📃
/myprojects - List your projects 🏴‍☠️
/stopall - Stop all your projects ❌
/pause - Pause projects temporarily ⛔
/on - Resume paused projects 🔁
/clear - Delete all projects 🚫

Admin Commands:
/adduser [id] - Add a user
/removeuser [id] - Remove a user
/listusers - List all users

Send your project files as a ZIP to start.";

pub struct Controller {
    access: Arc<AccessControl>,
    supervisor: Arc<Supervisor>,
    onboarding: Onboarding,
    projects_dir: PathBuf,
    retry: RetryPolicy,
}

impl Controller {
    pub fn new(
        access: Arc<AccessControl>,
        supervisor: Arc<Supervisor>,
        projects_dir: impl Into<PathBuf>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            onboarding: Onboarding::new(Arc::clone(&supervisor)),
            access,
            supervisor,
            projects_dir: projects_dir.into(),
            retry,
        }
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn onboarding(&self) -> &Onboarding {
        &self.onboarding
    }

    pub fn access(&self) -> &Arc<AccessControl> {
        &self.access
    }

    /// Entry point for every inbound event. Never fails: errors are reported to the chat.
    /// Transient failures are retried with the configured policy first.
    pub async fn handle_event(&self, event: GatewayEvent) {
        let user_id = event.user_id();
        let chat_id = event.chat_id();
        if !self.access.is_allowed(user_id) {
            warn!(user_id, "rejected event from unauthorized user");
            self.reply(chat_id, &HostError::Forbidden.user_message()).await;
            return;
        }

        let result = if event.is_replayable() {
            let event = &event;
            with_retry(self.retry, "handle_event", move || async move {
                match self.dispatch(event).await {
                    Err(e) if e.is_transient() => Err(e),
                    other => Ok(other),
                }
            })
            .await
            .and_then(|inner| inner)
        } else {
            self.dispatch(&event).await
        };

        if let Err(e) = result {
            if e.is_transient() {
                error!(user_id, chat_id, error = %e, "event handling failed");
            } else {
                info!(user_id, chat_id, error = %e, "request rejected");
            }
            self.reply(chat_id, &e.user_message()).await;
        }
    }

    async fn dispatch(&self, event: &GatewayEvent) -> HostResult<()> {
        match event {
            GatewayEvent::Text {
                user_id,
                chat_id,
                text,
            } => self.on_text(*user_id, *chat_id, text).await,
            GatewayEvent::Document {
                user_id,
                chat_id,
                file_name,
                file,
            } => self.on_document(*user_id, *chat_id, file_name, file).await,
            GatewayEvent::Choice {
                user_id,
                chat_id,
                message_id,
                action,
            } => self.on_choice(*user_id, *chat_id, *message_id, action).await,
        }
    }

    async fn reply(&self, chat_id: ChatId, text: &str) {
        self.supervisor.notifier().send(chat_id, text).await;
    }

    async fn edit(&self, chat_id: ChatId, message_id: MessageId, text: &str, choices: &[Choice]) {
        self.supervisor.notifier().edit(chat_id, message_id, text, choices).await;
    }

    // --- text ---

    async fn on_text(&self, user_id: PrincipalId, chat_id: ChatId, text: &str) -> HostResult<()> {
        if self.onboarding.handle_text(user_id, chat_id, text).await? {
            return Ok(());
        }

        match UserCommand::parse(text) {
            UserCommand::Help => self.reply(chat_id, HELP_TEXT).await,
            UserCommand::MyProjects => self.show_projects(user_id, chat_id).await,
            UserCommand::AddUser(target) => {
                self.require_admin(user_id)?;
                let Some(target) = target else {
                    return Err(HostError::Validation("Usage: /adduser <user_id>".to_string()));
                };
                self.access.add(target)?;
                info!(admin = user_id, user_id = target, "added user");
                self.reply(chat_id, &format!("✅ Added user: {}", target)).await;
            }
            UserCommand::RemoveUser(target) => {
                self.require_admin(user_id)?;
                let Some(target) = target else {
                    return Err(HostError::Validation("Usage: /removeuser <user_id>".to_string()));
                };
                if self.access.is_admin(target) {
                    self.reply(chat_id, "❌ Cannot remove primary admins").await;
                } else if self.access.remove(target)? {
                    info!(admin = user_id, user_id = target, "removed user");
                    self.reply(chat_id, &format!("✅ Removed user: {}", target)).await;
                } else {
                    self.reply(chat_id, &format!("⚠️ User {} is not in the allowed list", target))
                        .await;
                }
            }
            UserCommand::ListUsers => {
                self.require_admin(user_id)?;
                let mut text = "👥 Authorized Users:\n\n".to_string();
                for (id, is_admin) in self.access.list() {
                    let role = if is_admin { "👑 Admin" } else { "👤 User" };
                    text.push_str(&format!("- {} ({})\n", id, role));
                }
                self.reply(chat_id, text.trim_end()).await;
            }
            UserCommand::StopAll => self.stop_all(user_id, chat_id).await,
            UserCommand::PauseAll => self.pause_all(user_id, chat_id).await,
            UserCommand::ResumeAll => self.resume_all(user_id, chat_id).await,
            UserCommand::Clear => self.clear_all(user_id, chat_id).await,
            UserCommand::Cancel => self.reply(chat_id, "⚠️ Nothing to cancel").await,
            UserCommand::Unknown(cmd) => {
                self.reply(chat_id, &format!("⚠️ Unknown command: {}\nSend /help for the list of commands", cmd))
                    .await
            }
            UserCommand::Text(_) => {
                self.reply(chat_id, "📦 Send your project as a ZIP file, or /help for commands")
                    .await
            }
        }
        Ok(())
    }

    fn require_admin(&self, user_id: PrincipalId) -> HostResult<()> {
        if self.access.is_admin(user_id) {
            Ok(())
        } else {
            Err(HostError::Validation("This command is for admins only".to_string()))
        }
    }

    async fn show_projects(&self, user_id: PrincipalId, chat_id: ChatId) {
        let views = self.supervisor.list_projects(user_id).await;
        if views.is_empty() {
            self.reply(chat_id, "📂 You have no stored projects.").await;
            return;
        }
        for (idx, view) in views.iter().enumerate() {
            let line = format!(
                "{}. {} - {}",
                idx + 1,
                view.project.display_name,
                status_label(&view.status)
            );
            let text = if idx == 0 {
                format!("📂 Your Projects:\n\n{}", line)
            } else {
                line
            };
            self.supervisor
                .notifier()
                .send_with_choices(chat_id, &text, &project_menu(view))
                .await;
        }
    }

    // --- bulk commands ---

    async fn stop_all(&self, user_id: PrincipalId, chat_id: ChatId) {
        let mut stopped = 0;
        for view in self.supervisor.list_projects(user_id).await {
            if matches!(view.status, ProjectStatus::Running { .. }) {
                match self.supervisor.stop(&view.project.id).await {
                    Ok(()) => stopped += 1,
                    Err(e) => self.reply(chat_id, &e.user_message()).await,
                }
            }
        }
        self.reply(chat_id, &format!("⏹️ Stopped {} project(s)", stopped)).await;
    }

    async fn pause_all(&self, user_id: PrincipalId, chat_id: ChatId) {
        let mut paused = 0;
        for view in self.supervisor.list_projects(user_id).await {
            if matches!(view.status, ProjectStatus::Running { .. }) {
                match self.supervisor.pause(&view.project.id).await {
                    Ok(()) => paused += 1,
                    Err(e) => self.reply(chat_id, &e.user_message()).await,
                }
            }
        }
        self.reply(chat_id, &format!("⏸️ Paused {} project(s)", paused)).await;
    }

    async fn resume_all(&self, user_id: PrincipalId, chat_id: ChatId) {
        let mut resumed = 0;
        for view in self.supervisor.list_projects(user_id).await {
            if view.status == ProjectStatus::Paused {
                match self.supervisor.resume(&view.project.id).await {
                    Ok(Relaunch::Started) => resumed += 1,
                    Ok(Relaunch::Expired) => {}
                    Err(e) => self.reply(chat_id, &e.user_message()).await,
                }
            }
        }
        self.reply(chat_id, &format!("▶️ Resumed {} project(s)", resumed)).await;
    }

    async fn clear_all(&self, user_id: PrincipalId, chat_id: ChatId) {
        let mut deleted = 0;
        for view in self.supervisor.list_projects(user_id).await {
            match self.supervisor.delete(&view.project.id).await {
                Ok(()) => deleted += 1,
                Err(e) => self.reply(chat_id, &e.user_message()).await,
            }
        }
        self.reply(chat_id, &format!("🗑️ Deleted {} project(s)", deleted)).await;
    }

    // --- documents ---

    async fn on_document(
        &self,
        user_id: PrincipalId,
        chat_id: ChatId,
        file_name: &str,
        file: &FileRef,
    ) -> HostResult<()> {
        let project_name = archive_stem(file_name)
            .ok_or_else(|| HostError::Validation("Please send a ZIP file only".to_string()))?;
        let dir = self.projects_dir.join(user_id.to_string()).join(&project_name);
        let project = ProjectId::new(&dir);
        if self.supervisor.is_active(&project).await {
            return Err(HostError::AlreadyActive(project_name));
        }

        // Downloaded exactly once; only the extraction is retried.
        let bytes = Arc::new(
            self.supervisor
                .notifier()
                .gateway()
                .download_document(file)
                .await?,
        );
        let extracted = with_retry(self.retry, "extract_archive", || {
            let bytes = Arc::clone(&bytes);
            let target = dir.clone();
            async move {
                let result = tokio::task::spawn_blocking(move || extract_zip(&bytes, &target))
                    .await
                    .map_err(|e| HostError::Archive(e.to_string()))
                    .and_then(|inner| inner);
                match result {
                    Err(e) if e.is_transient() => Err(e),
                    other => Ok(other),
                }
            }
        })
        .await;
        extracted.and_then(|inner| inner)?;
        info!(user_id, project = %project, "archive extracted");

        self.onboarding.begin(user_id, chat_id, project).await;
        Ok(())
    }

    // --- choices ---

    async fn on_choice(
        &self,
        user_id: PrincipalId,
        chat_id: ChatId,
        message_id: MessageId,
        action: &Action,
    ) -> HostResult<()> {
        match action {
            Action::ScriptCount(n) => {
                self.onboarding
                    .select_count(user_id, chat_id, message_id, *n)
                    .await
            }
            Action::SelectScript(i) => {
                self.onboarding
                    .select_script(user_id, chat_id, message_id, *i)
                    .await
            }
            Action::CancelSelection => {
                self.onboarding
                    .cancel_selection(user_id, chat_id, message_id)
                    .await
            }
            Action::Duration(days) => {
                self.onboarding
                    .select_duration(user_id, chat_id, message_id, *days)
                    .await
            }
            Action::Project { command, project } => {
                self.on_project_command(user_id, chat_id, message_id, *command, project)
                    .await
            }
        }
    }

    /// Runs a project command and edits the originating message with the outcome.
    async fn on_project_command(
        &self,
        user_id: PrincipalId,
        chat_id: ChatId,
        message_id: MessageId,
        command: ProjectCommand,
        id: &ProjectId,
    ) -> HostResult<()> {
        let record = self
            .supervisor
            .find_project(id)
            .await
            .ok_or_else(|| HostError::NotFound(format!("No project found: {}", id.name())))?;
        if record.owner_id != user_id && !self.access.is_admin(user_id) {
            warn!(user_id, project = %id, "project command from non-owner");
            return Err(HostError::Validation("You can only manage your own projects".to_string()));
        }
        let name = record.display_name;

        if let Some(progress) = progress_text(command) {
            self.edit(chat_id, message_id, progress, &[]).await;
        }

        let outcome: HostResult<(String, Vec<Choice>)> = match command {
            ProjectCommand::Run { days } => self
                .supervisor
                .start(StartRequest::new(id.clone()).for_days(days))
                .await
                .map(|_| (format!("▶️ Project running: {}", name), Vec::new())),
            ProjectCommand::RunLater => Ok((
                format!("💾 Project saved: {}\nUse /myprojects to run it later", name),
                Vec::new(),
            )),
            ProjectCommand::Stop => self
                .supervisor
                .stop(id)
                .await
                .map(|_| (format!("⏹️ Project stopped: {}", name), Vec::new())),
            ProjectCommand::Pause => self
                .supervisor
                .pause(id)
                .await
                .map(|_| (format!("⏸️ Project paused: {}", name), Vec::new())),
            ProjectCommand::Resume => self.supervisor.resume(id).await.map(|r| {
                (relaunch_text(r, "▶️ Project resumed", &name), Vec::new())
            }),
            ProjectCommand::Restart => self.supervisor.restart(id).await.map(|r| {
                (relaunch_text(r, "🔄 Project restarted", &name), Vec::new())
            }),
            ProjectCommand::DurationMenu => Ok((
                format!("⏳ Select a new duration for {}:", name),
                duration_choices(|days| Action::project(ProjectCommand::SetDuration(days), id)),
            )),
            ProjectCommand::SetDuration(days) => {
                self.supervisor.set_duration(id, days).await.map(|_| {
                    let text = match days {
                        Some(d) => format!("⏳ Set duration to {} days for project: {}", d, name),
                        None => format!("⏳ Removed duration for project: {}", name),
                    };
                    (text, Vec::new())
                })
            }
            ProjectCommand::Delete => self
                .supervisor
                .delete(id)
                .await
                .map(|_| (format!("🗑️ Project deleted: {}", name), Vec::new())),
            ProjectCommand::Cancel => Ok(("✖️ Menu closed".to_string(), Vec::new())),
        };

        match outcome {
            Ok((text, choices)) => {
                info!(user_id, project = %id, ?command, "project command done");
                self.edit(chat_id, message_id, &text, &choices).await;
                Ok(())
            }
            Err(e) if e.is_transient() => Err(e),
            Err(e) => {
                info!(user_id, project = %id, ?command, error = %e, "project command failed");
                self.edit(chat_id, message_id, &e.user_message(), &[]).await;
                Ok(())
            }
        }
    }
}

/// `app.zip` -> `app`. Anything that is not a plain `.zip` file name is refused.
fn archive_stem(file_name: &str) -> Option<String> {
    let base = Path::new(file_name).file_name()?.to_str()?;
    let stem = base
        .strip_suffix(".zip")
        .or_else(|| base.strip_suffix(".ZIP"))?;
    (!stem.is_empty() && stem != "." && stem != "..").then(|| stem.to_string())
}

fn progress_text(command: ProjectCommand) -> Option<&'static str> {
    match command {
        ProjectCommand::Run { .. } => Some("⏳ Starting project..."),
        ProjectCommand::Stop => Some("⏳ Stopping project..."),
        ProjectCommand::Pause => Some("⏳ Pausing project..."),
        ProjectCommand::Resume => Some("⏳ Resuming project..."),
        ProjectCommand::Restart => Some("⏳ Restarting project..."),
        _ => None,
    }
}

fn relaunch_text(outcome: Relaunch, done: &str, name: &str) -> String {
    match outcome {
        Relaunch::Started => format!("{}: {}", done, name),
        Relaunch::Expired => format!("⌛ Duration expired for project: {}", name),
    }
}

fn status_label(status: &ProjectStatus) -> String {
    match status {
        ProjectStatus::Running { remaining: None } => "🟢 Running".to_string(),
        ProjectStatus::Running {
            remaining: Some(left),
        } => format!("🟢 Running (Remaining: {})", format_remaining(*left)),
        ProjectStatus::Paused => "🟡 Paused".to_string(),
        ProjectStatus::Stopped => "🔴 Stopped".to_string(),
    }
}

fn format_remaining(left: TtlDuration) -> String {
    let days = left.num_days();
    let hours = left.num_hours() - days * 24;
    if days > 0 {
        format!("{} days {} hours", days, hours)
    } else if hours > 0 {
        format!("{} hours", hours)
    } else {
        format!("{} minutes", left.num_minutes().max(0))
    }
}

fn project_menu(view: &ProjectView) -> Vec<Choice> {
    let id = &view.project.id;
    let choice = |label: &str, command: ProjectCommand| Choice::new(label, &Action::project(command, id));
    match view.status {
        ProjectStatus::Running { .. } => vec![
            choice("⏹️ Stop", ProjectCommand::Stop),
            choice("⏸️ Pause", ProjectCommand::Pause),
            choice("⏳ Set Duration", ProjectCommand::DurationMenu),
            choice("🔄 Restart", ProjectCommand::Restart),
        ],
        ProjectStatus::Paused => vec![
            choice("▶️ Resume", ProjectCommand::Resume),
            choice("🗑️ Delete", ProjectCommand::Delete),
        ],
        ProjectStatus::Stopped => vec![
            choice("▶️ Run", ProjectCommand::Run { days: None }),
            choice("🗑️ Delete", ProjectCommand::Delete),
        ],
    }
}
