//! pyhost-core: supervision of uploaded Python projects driven from a chat.
//!
//! Users upload a zip archive, pick one or two entry scripts and a duration, and the
//! [`Supervisor`] keeps one child process per entry script alive: output forwarding,
//! periodic restarts, TTL expiry and a concurrency ceiling. Everything user-facing goes
//! through the [`Gateway`] trait so the core stays transport-agnostic.

mod access;
mod archive;
mod command;
mod config;
mod controller;
mod deps;
mod error;
mod gateway;
mod onboarding;
mod project;
mod retry;
mod store;
pub mod supervisor;

pub use access::AccessControl;
pub use archive::{extract_zip, python_scripts, resolve_script};
pub use command::{Action, DecodeError, ProjectCommand, UserCommand, CANCEL_TOKEN, DURATION_CHOICES};
pub use config::HostConfig;
pub use controller::Controller;
pub use deps::{truncate_chars, DependencyInstaller, InstallOutcome, NoopInstaller, PipInstaller};
pub use error::{HostError, HostResult};
pub use gateway::{
    Choice, FileRef, Gateway, GatewayError, GatewayEvent, MemoryGateway, MessageId, Notifier,
    OutboundMessage,
};
pub use onboarding::{duration_choices, Onboarding, Session, Stage};
pub use project::{ChatId, PrincipalId, Project, ProjectId};
pub use retry::{with_retry, RetryPolicy};
pub use store::ProjectStore;
pub use supervisor::{
    ProjectStatus, ProjectView, Relaunch, RunSnapshot, StartRequest, Supervisor, SupervisorSettings,
    SweepOutcome, SweepReport,
};
