//! Host configuration loaded from file and environment.
//!
//! | Key | Default | Description |
//! |-----|---------|-------------|
//! | storage_path | ./data | Directory of the sled database (principals + projects). |
//! | projects_dir | projects | Root under which archives are extracted (`{projects_dir}/{owner}/{name}`). |
//! | log_dir | ./logs | Directory for the daemon's log file. |
//! | admin_ids | (required) | Principals that are always allowed and can never be removed. |
//! | max_running | 2 | Concurrency ceiling for running projects. |
//! | restart_interval_secs | 3600 | Period of the global restart sweep. |
//! | expiry_check_secs | 60 | Period of the TTL expiry check. |
//! | sweep_backoff_secs | 30 | Pause after a sweep that failed unexpectedly. |
//! | stop_grace_secs | 5 | Bounded wait between graceful termination and force-kill. |
//! | stderr_limit | 3000 | Maximum characters of stderr forwarded to a chat. |
//! | python_program | python3 | Interpreter used to launch main files. |
//! | pip_program | pip | Installer used for `requirements_file`. |
//! | install_timeout_secs | 300 | Timeout of one dependency installation. |
//! | install_blocks_start | true | Whether a failed installation aborts `start`. |
//! | retry_attempts / retry_delay_secs | 3 / 5 | Handler-boundary and outbound-send retry policy. |
//! | http_port | 8090 | Port of the daemon's local gateway. |

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub storage_path: PathBuf,
    pub projects_dir: PathBuf,
    pub log_dir: PathBuf,
    #[serde(default)]
    pub admin_ids: Vec<u64>,
    pub max_running: usize,
    pub restart_interval_secs: u64,
    pub expiry_check_secs: u64,
    pub sweep_backoff_secs: u64,
    pub stop_grace_secs: u64,
    pub stderr_limit: usize,
    pub python_program: String,
    pub pip_program: String,
    pub requirements_file: String,
    pub install_timeout_secs: u64,
    pub install_blocks_start: bool,
    pub retry_attempts: u32,
    pub retry_delay_secs: u64,
    pub http_port: u16,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("./data"),
            projects_dir: PathBuf::from("projects"),
            log_dir: PathBuf::from("./logs"),
            admin_ids: Vec::new(),
            max_running: 2,
            restart_interval_secs: 3600,
            expiry_check_secs: 60,
            sweep_backoff_secs: 30,
            stop_grace_secs: 5,
            stderr_limit: 3000,
            python_program: "python3".to_string(),
            pip_program: "pip".to_string(),
            requirements_file: "requirements.txt".to_string(),
            install_timeout_secs: 300,
            install_blocks_start: true,
            retry_attempts: 3,
            retry_delay_secs: 5,
            http_port: 8090,
        }
    }
}

impl HostConfig {
    /// Load config from file and environment. Precedence: env `PYHOST__*` > file at
    /// `PYHOST_CONFIG` (default `config/pyhost`) > defaults.
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path =
            std::env::var("PYHOST_CONFIG").unwrap_or_else(|_| "config/pyhost".to_string());
        Self::load_from(Path::new(&config_path))
    }

    pub fn load_from(path: &Path) -> Result<Self, config::ConfigError> {
        let d = HostConfig::default();
        let builder = config::Config::builder()
            .set_default("storage_path", d.storage_path.display().to_string())?
            .set_default("projects_dir", d.projects_dir.display().to_string())?
            .set_default("log_dir", d.log_dir.display().to_string())?
            .set_default("admin_ids", Vec::<i64>::new())?
            .set_default("max_running", d.max_running as i64)?
            .set_default("restart_interval_secs", d.restart_interval_secs as i64)?
            .set_default("expiry_check_secs", d.expiry_check_secs as i64)?
            .set_default("sweep_backoff_secs", d.sweep_backoff_secs as i64)?
            .set_default("stop_grace_secs", d.stop_grace_secs as i64)?
            .set_default("stderr_limit", d.stderr_limit as i64)?
            .set_default("python_program", d.python_program)?
            .set_default("pip_program", d.pip_program)?
            .set_default("requirements_file", d.requirements_file)?
            .set_default("install_timeout_secs", d.install_timeout_secs as i64)?
            .set_default("install_blocks_start", d.install_blocks_start)?
            .set_default("retry_attempts", d.retry_attempts as i64)?
            .set_default("retry_delay_secs", d.retry_delay_secs as i64)?
            .set_default("http_port", d.http_port as i64)?;

        let builder = if path.exists() || path.with_extension("toml").exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(
                config::Environment::with_prefix("PYHOST")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("admin_ids")
                    .try_parsing(true),
            )
            .build()?;

        let cfg: HostConfig = built.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Startup invariants. A failure here is fatal for the daemon.
    pub fn validate(&self) -> Result<(), config::ConfigError> {
        if self.admin_ids.is_empty() {
            return Err(config::ConfigError::Message(
                "admin_ids must name at least one admin".to_string(),
            ));
        }
        if self.max_running == 0 {
            return Err(config::ConfigError::Message(
                "max_running must be at least 1".to_string(),
            ));
        }
        if self.restart_interval_secs == 0 || self.expiry_check_secs == 0 {
            return Err(config::ConfigError::Message(
                "restart_interval_secs and expiry_check_secs must be positive".to_string(),
            ));
        }
        if self.python_program.trim().is_empty() {
            return Err(config::ConfigError::Message(
                "python_program must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn restart_interval(&self) -> Duration {
        Duration::from_secs(self.restart_interval_secs)
    }

    pub fn expiry_check_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_check_secs)
    }

    pub fn sweep_backoff(&self) -> Duration {
        Duration::from_secs(self.sweep_backoff_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_attempts, Duration::from_secs(self.retry_delay_secs))
    }
}
