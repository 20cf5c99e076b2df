//! Registries owned by the supervisor. Always accessed through `Supervisor::state`.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use chrono::{DateTime, Duration as TtlDuration, Utc};

use crate::project::{ChatId, PrincipalId, Project, ProjectId};

use super::process::ProcessHandle;

/// Transient supervision record for an active or paused project.
pub struct RunState {
    pub owner_id: PrincipalId,
    pub chat_id: ChatId,
    pub display_name: String,
    pub main_files: Vec<PathBuf>,
    pub processes: Vec<ProcessHandle>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub auto_restart: bool,
}

impl RunState {
    /// Time left before the deadline; `None` without a deadline. May be negative.
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<TtlDuration> {
        self.end_time.map(|end| end - now)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.end_time.is_some_and(|end| end <= now)
    }

    pub fn pids(&self) -> Vec<u32> {
        self.processes.iter().filter_map(|p| p.pid).collect()
    }
}

#[derive(Default)]
pub struct SupervisorState {
    pub running: HashMap<ProjectId, RunState>,
    pub paused: HashMap<ProjectId, RunState>,
    /// Launches in flight; counted against the ceiling and guarding against double starts.
    pub starting: HashSet<ProjectId>,
    /// Mirror of the persisted owner -> projects mapping.
    pub projects: HashMap<PrincipalId, Vec<Project>>,
}

impl SupervisorState {
    pub fn find_project(&self, id: &ProjectId) -> Option<&Project> {
        self.projects.values().flatten().find(|p| &p.id == id)
    }

    pub fn is_active(&self, id: &ProjectId) -> bool {
        self.running.contains_key(id) || self.paused.contains_key(id) || self.starting.contains(id)
    }

    pub fn occupied_slots(&self) -> usize {
        self.running.len() + self.starting.len()
    }

    /// Insert or refresh a project record; returns the owner's updated list.
    pub fn upsert_project(&mut self, project: Project) -> Vec<Project> {
        let list = self.projects.entry(project.owner_id).or_default();
        match list.iter_mut().find(|p| p.id == project.id) {
            Some(existing) => {
                existing.main_files = project.main_files;
                existing.num_scripts = existing.main_files.len();
                existing.pinned = project.pinned;
            }
            None => list.push(project),
        }
        list.clone()
    }

    /// Remove a project record; returns the owner and their remaining list.
    pub fn remove_project(&mut self, id: &ProjectId) -> Option<(PrincipalId, Vec<Project>)> {
        let owner = self.find_project(id)?.owner_id;
        let list = self.projects.entry(owner).or_default();
        list.retain(|p| &p.id != id);
        let remaining = list.clone();
        if remaining.is_empty() {
            self.projects.remove(&owner);
        }
        Some((owner, remaining))
    }
}
