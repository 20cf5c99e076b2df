#![allow(dead_code)]

use std::future::Future;
use std::io::{Cursor, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pyhost_core::{
    AccessControl, Action, ChatId, Controller, DependencyInstaller, GatewayEvent, MemoryGateway,
    NoopInstaller, Notifier, PrincipalId, Project, ProjectId, ProjectStore, RetryPolicy,
    Supervisor, SupervisorSettings,
};
use tempfile::TempDir;

pub const ADMIN: PrincipalId = 1;
pub const ADMIN_CHAT: ChatId = 100;

pub fn settings(max_running: usize) -> SupervisorSettings {
    SupervisorSettings {
        max_running,
        python_program: "sh".to_string(),
        stop_grace: Duration::from_millis(500),
        stderr_limit: 3000,
        restart_interval: Duration::from_secs(3600),
        expiry_check_interval: Duration::from_secs(3600),
        sweep_backoff: Duration::from_secs(1),
        install_blocks_start: true,
    }
}

pub struct Host {
    pub root: TempDir,
    pub store: ProjectStore,
    pub gateway: Arc<MemoryGateway>,
    pub supervisor: Arc<Supervisor>,
    pub controller: Controller,
}

impl Host {
    pub fn new(max_running: usize) -> Self {
        Self::with(settings(max_running), Arc::new(NoopInstaller))
    }

    pub fn with(settings: SupervisorSettings, installer: Arc<dyn DependencyInstaller>) -> Self {
        Self::with_retry(settings, installer, RetryPolicy::once())
    }

    /// `retry` applies to the controller's handler boundary only; notifications stay single-shot.
    pub fn with_retry(
        settings: SupervisorSettings,
        installer: Arc<dyn DependencyInstaller>,
        retry: RetryPolicy,
    ) -> Self {
        let root = tempfile::tempdir().unwrap();
        let store = ProjectStore::temporary().unwrap();
        let gateway = Arc::new(MemoryGateway::new());
        let notifier = Notifier::new(gateway.clone(), RetryPolicy::once());
        let supervisor =
            Arc::new(Supervisor::new(settings, store.clone(), notifier, installer).unwrap());
        let access = Arc::new(AccessControl::load([ADMIN], store.clone()));
        let controller = Controller::new(
            access,
            Arc::clone(&supervisor),
            root.path().join("projects"),
            retry,
        );
        Self {
            root,
            store,
            gateway,
            supervisor,
            controller,
        }
    }

    pub fn project_dir(&self, owner: PrincipalId, name: &str) -> PathBuf {
        self.root.path().join("projects").join(owner.to_string()).join(name)
    }

    /// Write `files` into a project directory and persist a record with `mains` as entry scripts.
    pub async fn register(
        &self,
        owner: PrincipalId,
        name: &str,
        files: &[(&str, &str)],
        mains: &[&str],
    ) -> ProjectId {
        let dir = self.project_dir(owner, name);
        std::fs::create_dir_all(&dir).unwrap();
        for (file, body) in files {
            std::fs::write(dir.join(file), body).unwrap();
        }
        let id = ProjectId::new(&dir);
        let project = Project::new(
            id.clone(),
            owner,
            ADMIN_CHAT,
            mains.iter().map(|m| dir.join(m)).collect(),
        );
        self.supervisor.register_project(project).await.unwrap();
        id
    }

    pub async fn say(&self, user_id: PrincipalId, chat_id: ChatId, text: &str) {
        self.controller
            .handle_event(GatewayEvent::Text {
                user_id,
                chat_id,
                text: text.to_string(),
            })
            .await;
    }

    pub async fn upload(&self, user_id: PrincipalId, chat_id: ChatId, file_name: &str, bytes: Vec<u8>) {
        let file = self.gateway.stash_document(bytes);
        self.controller
            .handle_event(GatewayEvent::Document {
                user_id,
                chat_id,
                file_name: file_name.to_string(),
                file,
            })
            .await;
    }

    /// Press a choice on the latest message of the chat.
    pub async fn choose(&self, user_id: PrincipalId, chat_id: ChatId, action: Action) {
        let message_id = self.gateway.last(chat_id).map(|m| m.message_id).unwrap_or(0);
        self.controller
            .handle_event(GatewayEvent::Choice {
                user_id,
                chat_id,
                message_id,
                action,
            })
            .await;
    }

    pub fn last_text(&self, chat_id: ChatId) -> String {
        self.gateway.last(chat_id).map(|m| m.text).unwrap_or_default()
    }
}

/// `long.py` that stays up until terminated.
pub const LONG_RUNNING: &str = "exec sleep 30\n";

pub fn zip_of(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, body) in entries {
        writer
            .start_file(*name, zip::write::FileOptions::default())
            .unwrap();
        writer.write_all(body.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

pub fn pid_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

/// Poll `check` for up to five seconds.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
