//! Error taxonomy shared by the supervisor, onboarding workflow and controller.

use std::path::PathBuf;

use thiserror::Error;

use crate::gateway::GatewayError;

#[derive(Error, Debug)]
pub enum HostError {
    /// Bad user input or a failed precondition. Reported, nothing mutated.
    #[error("{0}")]
    Validation(String),

    #[error("missing files: {}", display_paths(.0))]
    MissingFiles(Vec<PathBuf>),

    #[error("no main files specified for the project")]
    NoMainFiles,

    #[error("access denied")]
    Forbidden,

    /// Carries the full, user-facing description.
    #[error("{0}")]
    NotFound(String),

    #[error("project is already active: {0}")]
    AlreadyActive(String),

    #[error("capacity exceeded: {running} of {max} projects already running")]
    CapacityExceeded { running: usize, max: usize },

    #[error("dependency installation failed: {0}")]
    DependencyInstall(String),

    #[error("failed to launch {path}: {reason}")]
    ProcessLaunch { path: PathBuf, reason: String },

    #[error("no files were executed, check file availability")]
    NothingLaunched,

    #[error("session expired, please resend the project")]
    SessionExpired,

    #[error("archive error: {0}")]
    Archive(String),

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl HostError {
    /// Transient failures are retried at the handler boundary; everything else is reported once.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            HostError::Storage(_) | HostError::Io(_) | HostError::Gateway(_)
        )
    }

    /// Text shown to the chat user for this error.
    pub fn user_message(&self) -> String {
        match self {
            HostError::Validation(msg) => format!("⚠️ {}", msg),
            HostError::MissingFiles(_) | HostError::NoMainFiles | HostError::NotFound(_) => {
                format!("⚠️ {}", capitalize(&self.to_string()))
            }
            HostError::Forbidden => "⛔ Sorry, you don't have access to this bot.".to_string(),
            HostError::SessionExpired => "❌ Session expired, please resend the project".to_string(),
            HostError::CapacityExceeded { .. } | HostError::AlreadyActive(_) => {
                format!("🚫 {}", capitalize(&self.to_string()))
            }
            _ => format!("❌ {}", capitalize(&self.to_string())),
        }
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

pub type HostResult<T> = Result<T, HostError>;
