//! Dependency installation for uploaded projects.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{HostError, HostResult};

/// Characters of installer stderr kept in the error report.
const INSTALL_ERROR_EXCERPT: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed,
    /// Nothing to install.
    Skipped,
}

#[async_trait]
pub trait DependencyInstaller: Send + Sync {
    async fn install(&self, project_dir: &Path) -> HostResult<InstallOutcome>;
}

/// Runs `pip install -r requirements.txt` inside the project directory.
pub struct PipInstaller {
    program: String,
    requirements_file: String,
    timeout: Duration,
}

impl PipInstaller {
    pub fn new(program: impl Into<String>, requirements_file: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            requirements_file: requirements_file.into(),
            timeout,
        }
    }

    fn requirements_path(&self, project_dir: &Path) -> PathBuf {
        project_dir.join(&self.requirements_file)
    }
}

#[async_trait]
impl DependencyInstaller for PipInstaller {
    async fn install(&self, project_dir: &Path) -> HostResult<InstallOutcome> {
        let requirements = self.requirements_path(project_dir);
        if !requirements.exists() {
            return Ok(InstallOutcome::Skipped);
        }

        tracing::info!(project = %project_dir.display(), "installing dependencies");
        let child = tokio::process::Command::new(&self.program)
            .arg("install")
            .arg("-r")
            .arg(&requirements)
            .current_dir(project_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HostError::DependencyInstall(format!("failed to run {}: {}", self.program, e)))?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                tracing::error!(project = %project_dir.display(), "dependency installation timed out");
                return Err(HostError::DependencyInstall(format!(
                    "installation timed out ({} seconds)",
                    self.timeout.as_secs()
                )));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::error!(project = %project_dir.display(), stderr = %stderr, "failed to install dependencies");
            return Err(HostError::DependencyInstall(truncate_chars(&stderr, INSTALL_ERROR_EXCERPT)));
        }

        tracing::info!(project = %project_dir.display(), "dependencies installed successfully");
        Ok(InstallOutcome::Installed)
    }
}

/// Installer that never does anything. Used when installation is disabled and in tests.
pub struct NoopInstaller;

#[async_trait]
impl DependencyInstaller for NoopInstaller {
    async fn install(&self, _project_dir: &Path) -> HostResult<InstallOutcome> {
        Ok(InstallOutcome::Skipped)
    }
}

/// First `max` characters of `s`.
pub fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_requirements_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let pip = PipInstaller::new("pip", "requirements.txt", Duration::from_secs(1));
        assert_eq!(pip.install(dir.path()).await.unwrap(), InstallOutcome::Skipped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_installer_reports_stderr() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("requirements.txt"), "nothing\n").unwrap();
        // `false` ignores its arguments and exits 1.
        let pip = PipInstaller::new("false", "requirements.txt", Duration::from_secs(5));
        let err = pip.install(dir.path()).await.unwrap_err();
        assert!(matches!(err, HostError::DependencyInstall(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_program_is_an_install_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("requirements.txt"), "x\n").unwrap();
        let pip = PipInstaller::new("/nonexistent/pip", "requirements.txt", Duration::from_secs(1));
        assert!(matches!(
            pip.install(dir.path()).await,
            Err(HostError::DependencyInstall(_))
        ));
    }

    #[test]
    fn truncates_on_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("ab", 10), "ab");
    }
}
