//! Project identity and the durable project record.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Authorized user identity (chat user id).
pub type PrincipalId = u64;
/// Destination for asynchronous notifications.
pub type ChatId = i64;

/// A project is identified by its extracted directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(PathBuf);

impl ProjectId {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self(dir.into())
    }

    pub fn dir(&self) -> &Path {
        &self.0
    }

    /// Last path component, used as the display name.
    pub fn name(&self) -> String {
        self.0
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.0.display().to_string())
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl From<&str> for ProjectId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Persisted metadata for one uploaded project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    #[serde(rename = "project_dir")]
    pub id: ProjectId,
    pub owner_id: PrincipalId,
    pub chat_id: ChatId,
    #[serde(rename = "project_name")]
    pub display_name: String,
    pub main_files: Vec<PathBuf>,
    pub upload_time: DateTime<Utc>,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub num_scripts: usize,
}

impl Project {
    pub fn new(id: ProjectId, owner_id: PrincipalId, chat_id: ChatId, main_files: Vec<PathBuf>) -> Self {
        let display_name = id.name();
        let num_scripts = main_files.len();
        Self {
            id,
            owner_id,
            chat_id,
            display_name,
            main_files,
            upload_time: Utc::now(),
            pinned: false,
            num_scripts,
        }
    }

    /// Main files that no longer exist on disk.
    pub fn missing_main_files(&self) -> Vec<PathBuf> {
        self.main_files
            .iter()
            .filter(|f| !f.exists())
            .cloned()
            .collect()
    }
}
