//! Typed user actions.
//!
//! Choice buttons carry an [`Action`] encoded as a short token (`run:7:projects/1/app`);
//! the transport decodes it once with [`Action::decode`]. Free text is parsed into a
//! [`UserCommand`].

use std::fmt;

use crate::project::{PrincipalId, ProjectId};

/// Text that aborts the two-script prompt.
pub const CANCEL_TOKEN: &str = "/cancel";

/// Durations offered to users, in days.
pub const DURATION_CHOICES: [u32; 3] = [1, 3, 7];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectCommand {
    /// Start now with an optional duration in days.
    Run { days: Option<u32> },
    RunLater,
    Stop,
    Pause,
    Resume,
    Restart,
    /// Show the set-duration choices.
    DurationMenu,
    /// `None` clears the deadline.
    SetDuration(Option<u32>),
    Delete,
    /// Dismiss the project menu.
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    ScriptCount(u8),
    /// Index into the session's available script list.
    SelectScript(usize),
    CancelSelection,
    Duration(Option<u32>),
    Project {
        command: ProjectCommand,
        project: ProjectId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError(pub String);

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid action token: {}", self.0)
    }
}

impl std::error::Error for DecodeError {}

fn days_token(days: Option<u32>) -> u32 {
    days.unwrap_or(0)
}

fn parse_days(s: &str) -> Option<Option<u32>> {
    let n: u32 = s.parse().ok()?;
    Some(if n == 0 { None } else { Some(n) })
}

impl Action {
    pub fn project(command: ProjectCommand, project: &ProjectId) -> Self {
        Action::Project {
            command,
            project: project.clone(),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Action::ScriptCount(n) => format!("count:{}", n),
            Action::SelectScript(i) => format!("script:{}", i),
            Action::CancelSelection => "cancel_selection".to_string(),
            Action::Duration(days) => format!("duration:{}", days_token(*days)),
            Action::Project { command, project } => match command {
                ProjectCommand::Run { days } => format!("run:{}:{}", days_token(*days), project),
                ProjectCommand::SetDuration(days) => {
                    format!("setdur:{}:{}", days_token(*days), project)
                }
                ProjectCommand::RunLater => format!("runlater:{}", project),
                ProjectCommand::Stop => format!("stop:{}", project),
                ProjectCommand::Pause => format!("pause:{}", project),
                ProjectCommand::Resume => format!("resume:{}", project),
                ProjectCommand::Restart => format!("restart:{}", project),
                ProjectCommand::DurationMenu => format!("durmenu:{}", project),
                ProjectCommand::Delete => format!("delete:{}", project),
                ProjectCommand::Cancel => format!("dismiss:{}", project),
            },
        }
    }

    pub fn decode(token: &str) -> Result<Self, DecodeError> {
        let bad = || DecodeError(token.to_string());
        if token == "cancel_selection" {
            return Ok(Action::CancelSelection);
        }
        let (verb, rest) = token.split_once(':').ok_or_else(bad)?;
        let project_of = |s: &str| -> Result<ProjectId, DecodeError> {
            if s.is_empty() {
                Err(bad())
            } else {
                Ok(ProjectId::new(s))
            }
        };
        let with_days = |rest: &str| -> Result<(Option<u32>, ProjectId), DecodeError> {
            let (days, dir) = rest.split_once(':').ok_or_else(bad)?;
            let days = parse_days(days).ok_or_else(bad)?;
            Ok((days, project_of(dir)?))
        };

        let action = match verb {
            "count" => match rest {
                "1" => Action::ScriptCount(1),
                "2" => Action::ScriptCount(2),
                _ => return Err(bad()),
            },
            "script" => Action::SelectScript(rest.parse().map_err(|_| bad())?),
            "duration" => Action::Duration(parse_days(rest).ok_or_else(bad)?),
            "run" => {
                let (days, project) = with_days(rest)?;
                Action::Project {
                    command: ProjectCommand::Run { days },
                    project,
                }
            }
            "setdur" => {
                let (days, project) = with_days(rest)?;
                Action::Project {
                    command: ProjectCommand::SetDuration(days),
                    project,
                }
            }
            other => {
                let command = match other {
                    "runlater" => ProjectCommand::RunLater,
                    "stop" => ProjectCommand::Stop,
                    "pause" => ProjectCommand::Pause,
                    "resume" => ProjectCommand::Resume,
                    "restart" => ProjectCommand::Restart,
                    "durmenu" => ProjectCommand::DurationMenu,
                    "delete" => ProjectCommand::Delete,
                    "dismiss" => ProjectCommand::Cancel,
                    _ => return Err(bad()),
                };
                Action::Project {
                    command,
                    project: project_of(rest)?,
                }
            }
        };
        Ok(action)
    }
}

/// Slash commands and free text typed by a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserCommand {
    Help,
    MyProjects,
    /// `None` when the id argument is missing or malformed.
    AddUser(Option<PrincipalId>),
    RemoveUser(Option<PrincipalId>),
    ListUsers,
    StopAll,
    PauseAll,
    ResumeAll,
    Clear,
    Cancel,
    Unknown(String),
    Text(String),
}

impl UserCommand {
    pub fn parse(text: &str) -> Self {
        let trimmed = text.trim();
        if !trimmed.starts_with('/') {
            return UserCommand::Text(trimmed.to_string());
        }
        let mut parts = trimmed.split_whitespace();
        let head = parts.next().unwrap_or_default();
        // Group chats append the bot name: `/start@host_bot`.
        let name = head.split('@').next().unwrap_or(head);
        let id_arg = || parts.clone().next().and_then(|s| s.parse::<PrincipalId>().ok());
        match name {
            "/start" | "/help" => UserCommand::Help,
            "/myprojects" => UserCommand::MyProjects,
            "/adduser" => UserCommand::AddUser(id_arg()),
            "/removeuser" => UserCommand::RemoveUser(id_arg()),
            "/listusers" => UserCommand::ListUsers,
            "/stopall" => UserCommand::StopAll,
            "/pause" => UserCommand::PauseAll,
            "/on" => UserCommand::ResumeAll,
            "/clear" => UserCommand::Clear,
            CANCEL_TOKEN => UserCommand::Cancel,
            other => UserCommand::Unknown(other.to_string()),
        }
    }
}
