//! Background loop: the periodic restart sweep and the TTL expiry check.

use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::error::HostError;
use crate::project::ProjectId;

use super::{Relaunch, Supervisor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    Restarted,
    Expired,
    /// No longer running when its turn came.
    Skipped,
    Failed,
}

#[derive(Debug, Default)]
pub struct SweepReport {
    pub outcomes: Vec<(ProjectId, SweepOutcome)>,
}

impl SweepReport {
    pub fn with(&self, outcome: SweepOutcome) -> Vec<&ProjectId> {
        self.outcomes
            .iter()
            .filter(|(_, o)| *o == outcome)
            .map(|(id, _)| id)
            .collect()
    }
}

impl Supervisor {
    /// Start the background loop. Joined by [`Supervisor::shutdown`].
    pub fn spawn_background(self: &Arc<Self>) {
        let supervisor = Arc::clone(self);
        let handle = tokio::spawn(async move { supervisor.background_loop().await });
        match self.background.lock() {
            Ok(mut slot) => {
                if let Some(previous) = slot.replace(handle) {
                    previous.abort();
                }
            }
            Err(e) => error!(error = %e, "background slot poisoned"),
        }
    }

    async fn background_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let restart_every = self.settings.restart_interval;
        let expiry_every = self.settings.expiry_check_interval;
        let mut restart_tick = interval_at(Instant::now() + restart_every, restart_every);
        let mut expiry_tick = interval_at(Instant::now() + expiry_every, expiry_every);
        restart_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        expiry_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            restart_secs = restart_every.as_secs(),
            expiry_secs = expiry_every.as_secs(),
            "background loop started"
        );
        while self.keep_running.load(Ordering::SeqCst) {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = restart_tick.tick() => {
                    let supervisor = Arc::clone(&self);
                    self.run_guarded("restart sweep", &mut shutdown, async move {
                        let report = supervisor.sweep_once().await;
                        info!(projects = report.outcomes.len(), "restart sweep finished");
                    })
                    .await;
                }
                _ = expiry_tick.tick() => {
                    let supervisor = Arc::clone(&self);
                    self.run_guarded("expiry check", &mut shutdown, async move {
                        supervisor.expire_once().await;
                    })
                    .await;
                }
            }
        }
        info!("background loop stopped");
    }

    /// Runs one pass in its own task so a panic is contained, then backs off.
    async fn run_guarded<F>(&self, name: &str, shutdown: &mut watch::Receiver<bool>, pass: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Err(e) = tokio::spawn(pass).await else {
            return;
        };
        error!(pass = name, error = %e, "background pass failed");
        tokio::select! {
            _ = tokio::time::sleep(self.settings.sweep_backoff) => {}
            _ = shutdown.changed() => {}
        }
    }

    /// Restart every running project with `auto_restart`, concurrently and in isolation.
    pub async fn sweep_once(self: &Arc<Self>) -> SweepReport {
        let candidates: Vec<ProjectId> = {
            let state = self.state.lock().await;
            state
                .running
                .iter()
                .filter(|(_, run)| run.auto_restart)
                .map(|(id, _)| id.clone())
                .collect()
        };

        let mut tasks = JoinSet::new();
        for id in candidates {
            let supervisor = Arc::clone(self);
            tasks.spawn(async move {
                let outcome = supervisor.restart_one(&id).await;
                (id, outcome)
            });
        }

        let mut report = SweepReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(entry) => report.outcomes.push(entry),
                Err(e) => error!(error = %e, "restart task failed"),
            }
        }
        report
    }

    async fn restart_one(&self, id: &ProjectId) -> SweepOutcome {
        let Some(project) = self.find_project(id).await else {
            warn!(project = %id, "running project has no stored record");
            return SweepOutcome::Skipped;
        };
        match self.restart_running(id).await {
            Ok(Relaunch::Started) => {
                info!(project = %id, "project restarted by sweep");
                self.notifier
                    .send(
                        project.chat_id,
                        &format!("🔄 Project restarted: {}", project.display_name),
                    )
                    .await;
                SweepOutcome::Restarted
            }
            Ok(Relaunch::Expired) => SweepOutcome::Expired,
            Err(HostError::NotFound(_)) => SweepOutcome::Skipped,
            Err(e) => {
                error!(project = %id, error = %e, "sweep restart failed");
                self.notifier
                    .send(
                        project.chat_id,
                        &format!("❌ Failed to restart project: {}", project.display_name),
                    )
                    .await;
                SweepOutcome::Failed
            }
        }
    }

    /// Stop every running project whose deadline has passed. Returns the expired ids.
    pub async fn expire_once(&self) -> Vec<ProjectId> {
        let now = Utc::now();
        let due: Vec<_> = {
            let mut state = self.state.lock().await;
            let ids: Vec<ProjectId> = state
                .running
                .iter()
                .filter(|(_, run)| run.is_expired(now))
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| state.running.remove(&id).map(|run| (id, run)))
                .collect()
        };

        let mut expired = Vec::with_capacity(due.len());
        for (id, mut run) in due {
            self.terminate_run(&mut run).await;
            self.announce_expiry(&id, run.chat_id, &run.display_name).await;
            expired.push(id);
        }
        expired
    }
}
