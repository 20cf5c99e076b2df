#![cfg(unix)]

mod common;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration as TtlDuration;
use common::{eventually, pid_alive, settings, Host, ADMIN, ADMIN_CHAT, LONG_RUNNING};
use pyhost_core::{
    DependencyInstaller, HostError, HostResult, InstallOutcome, Project, ProjectId, Relaunch,
    StartRequest, Supervisor, SupervisorSettings, SweepOutcome,
};

struct FailingInstaller;

#[async_trait]
impl DependencyInstaller for FailingInstaller {
    async fn install(&self, _project_dir: &Path) -> HostResult<InstallOutcome> {
        Err(HostError::DependencyInstall("no index".to_string()))
    }
}

async fn assert_exclusive(supervisor: &Supervisor, id: &ProjectId) {
    assert!(
        !(supervisor.is_running(id).await && supervisor.is_paused(id).await),
        "{} is both running and paused",
        id
    );
}

#[tokio::test]
async fn start_without_main_files_leaves_registries_unchanged() {
    let host = Host::new(2);
    let id = host.register(ADMIN, "empty", &[("x.py", "")], &[]).await;

    let err = host.supervisor.start(StartRequest::new(id.clone())).await.unwrap_err();
    assert!(matches!(err, HostError::NoMainFiles));
    assert!(!host.supervisor.is_active(&id).await);
    assert_eq!(host.supervisor.running_count().await, 0);

    let fresh = ProjectId::new(host.project_dir(ADMIN, "fresh"));
    let err = host
        .supervisor
        .start(StartRequest::new(fresh.clone()).with_handoff(ADMIN, ADMIN_CHAT, vec![]))
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::NoMainFiles));
    assert!(host.supervisor.find_project(&fresh).await.is_none());
}

#[tokio::test]
async fn missing_main_file_is_reported() {
    let host = Host::new(2);
    let id = host.register(ADMIN, "gone", &[], &["main.py"]).await;
    let err = host.supervisor.start(StartRequest::new(id.clone())).await.unwrap_err();
    assert!(matches!(err, HostError::MissingFiles(ref files) if files.len() == 1));
    assert!(!host.supervisor.is_active(&id).await);
}

#[tokio::test]
async fn handoff_persists_the_record() {
    let host = Host::new(2);
    let dir = host.project_dir(ADMIN, "handoff");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("main.py"), LONG_RUNNING).unwrap();
    let id = ProjectId::new(&dir);

    let launched = host
        .supervisor
        .start(StartRequest::new(id.clone()).with_handoff(ADMIN, ADMIN_CHAT, vec![dir.join("main.py")]))
        .await
        .unwrap();
    assert_eq!(launched, 1);
    let stored = host.store.load_projects().unwrap();
    assert!(stored[&ADMIN].iter().any(|p| p.id == id));
    assert!(host
        .gateway
        .texts(ADMIN_CHAT)
        .contains(&"✅ Started project: handoff".to_string()));

    host.supervisor.shutdown().await;
}

#[tokio::test]
async fn stop_then_start_leaves_no_orphans() {
    let host = Host::new(2);
    let id = host
        .register(ADMIN, "svc", &[("main.py", LONG_RUNNING), ("worker.py", LONG_RUNNING)], &["main.py", "worker.py"])
        .await;

    assert_eq!(host.supervisor.start(StartRequest::new(id.clone())).await.unwrap(), 2);
    let first = host.supervisor.running_snapshot(&id).await.unwrap().pids;
    assert_eq!(first.len(), 2);
    assert!(first.iter().all(|&pid| pid_alive(pid)));

    host.supervisor.stop(&id).await.unwrap();
    assert!(!host.supervisor.is_running(&id).await);
    assert!(first.iter().all(|&pid| !pid_alive(pid)));
    assert!(matches!(host.supervisor.stop(&id).await, Err(HostError::NotFound(_))));

    host.supervisor.start(StartRequest::new(id.clone())).await.unwrap();
    let second = host.supervisor.running_snapshot(&id).await.unwrap().pids;
    assert_eq!(second.len(), 2);
    assert!(second.iter().all(|pid| !first.contains(pid)));
    assert_eq!(host.supervisor.running_count().await, 1);

    host.supervisor.shutdown().await;
    assert!(second.iter().all(|&pid| !pid_alive(pid)));
}

#[tokio::test]
async fn starting_an_active_project_is_rejected() {
    let host = Host::new(2);
    let id = host.register(ADMIN, "once", &[("main.py", LONG_RUNNING)], &["main.py"]).await;
    host.supervisor.start(StartRequest::new(id.clone())).await.unwrap();
    let err = host.supervisor.start(StartRequest::new(id.clone())).await.unwrap_err();
    assert!(matches!(err, HostError::AlreadyActive(_)));
    assert_eq!(host.supervisor.running_snapshot(&id).await.unwrap().pids.len(), 1);
    host.supervisor.shutdown().await;
}

#[tokio::test]
async fn pause_keeps_deadline_and_resume_relaunches() {
    let host = Host::new(2);
    let id = host.register(ADMIN, "nap", &[("main.py", LONG_RUNNING)], &["main.py"]).await;
    host.supervisor
        .start(StartRequest::new(id.clone()).for_days(Some(1)))
        .await
        .unwrap();
    let before = host.supervisor.running_snapshot(&id).await.unwrap();
    let deadline = before.end_time.unwrap();

    host.supervisor.pause(&id).await.unwrap();
    assert_exclusive(&host.supervisor, &id).await;
    assert!(!host.supervisor.is_running(&id).await);
    let paused = host.supervisor.paused_snapshot(&id).await.unwrap();
    assert_eq!(paused.end_time, Some(deadline));
    assert!(before.pids.iter().all(|&pid| !pid_alive(pid)));

    assert_eq!(host.supervisor.resume(&id).await.unwrap(), Relaunch::Started);
    assert_exclusive(&host.supervisor, &id).await;
    assert!(!host.supervisor.is_paused(&id).await);
    let after = host.supervisor.running_snapshot(&id).await.unwrap();
    let drift = (after.end_time.unwrap() - deadline).num_seconds().abs();
    assert!(drift <= 2, "deadline drifted by {}s", drift);
    assert!(after.pids.iter().all(|pid| !before.pids.contains(pid)));

    host.supervisor.shutdown().await;
}

#[tokio::test]
async fn resume_past_deadline_expires() {
    let host = Host::new(2);
    let id = host.register(ADMIN, "late", &[("main.py", LONG_RUNNING)], &["main.py"]).await;
    host.supervisor
        .start(StartRequest::new(id.clone()).with_ttl(Some(TtlDuration::milliseconds(100))))
        .await
        .unwrap();
    host.supervisor.pause(&id).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    assert_eq!(host.supervisor.resume(&id).await.unwrap(), Relaunch::Expired);
    assert!(!host.supervisor.is_active(&id).await);
    assert!(host
        .gateway
        .texts(ADMIN_CHAT)
        .contains(&"⌛ Duration expired for project: late".to_string()));
}

#[tokio::test]
async fn ceiling_rejects_extra_launches() {
    let host = Host::new(1);
    let a = host.register(ADMIN, "a", &[("main.py", LONG_RUNNING)], &["main.py"]).await;
    let b = host.register(ADMIN, "b", &[("main.py", LONG_RUNNING)], &["main.py"]).await;

    host.supervisor.start(StartRequest::new(a.clone())).await.unwrap();
    let err = host.supervisor.start(StartRequest::new(b.clone())).await.unwrap_err();
    assert!(matches!(err, HostError::CapacityExceeded { running: 1, max: 1 }));
    assert!(!host.supervisor.is_active(&b).await);

    host.supervisor.stop(&a).await.unwrap();
    host.supervisor.start(StartRequest::new(b.clone())).await.unwrap();
    host.supervisor.shutdown().await;
}

#[tokio::test]
async fn failed_installation_blocks_start() {
    let host = Host::with(settings(2), Arc::new(FailingInstaller));
    let id = host.register(ADMIN, "deps", &[("main.py", LONG_RUNNING)], &["main.py"]).await;
    let err = host.supervisor.start(StartRequest::new(id.clone())).await.unwrap_err();
    assert!(matches!(err, HostError::DependencyInstall(_)));
    assert!(!host.supervisor.is_active(&id).await);

    let lenient = SupervisorSettings {
        install_blocks_start: false,
        ..settings(2)
    };
    let host = Host::with(lenient, Arc::new(FailingInstaller));
    let id = host.register(ADMIN, "deps", &[("main.py", LONG_RUNNING)], &["main.py"]).await;
    host.supervisor.start(StartRequest::new(id.clone())).await.unwrap();
    host.supervisor.shutdown().await;
}

#[tokio::test]
async fn nothing_launched_is_an_error() {
    let broken = SupervisorSettings {
        python_program: "/nonexistent/python".to_string(),
        ..settings(2)
    };
    let host = Host::with(broken, Arc::new(pyhost_core::NoopInstaller));
    let id = host.register(ADMIN, "nolaunch", &[("main.py", "")], &["main.py"]).await;
    let err = host.supervisor.start(StartRequest::new(id.clone())).await.unwrap_err();
    assert!(matches!(err, HostError::NothingLaunched));
    assert!(!host.supervisor.is_active(&id).await);
    assert!(host
        .gateway
        .texts(ADMIN_CHAT)
        .iter()
        .any(|t| t.starts_with("❌ Failed to launch")));
}

#[tokio::test]
async fn sweep_racing_a_stop_restarts_the_rest() {
    let host = Host::new(2);
    let a = host.register(ADMIN, "a", &[("main.py", LONG_RUNNING)], &["main.py"]).await;
    let b = host.register(ADMIN, "b", &[("main.py", LONG_RUNNING)], &["main.py"]).await;
    host.supervisor.start(StartRequest::new(a.clone())).await.unwrap();
    host.supervisor.start(StartRequest::new(b.clone())).await.unwrap();
    let a_pids = host.supervisor.running_snapshot(&a).await.unwrap().pids;
    let b_pids = host.supervisor.running_snapshot(&b).await.unwrap().pids;

    let sweeper = Arc::clone(&host.supervisor);
    let sweep = tokio::spawn(async move { sweeper.sweep_once().await });
    let stop = host.supervisor.stop(&a).await;
    let report = sweep.await.unwrap();

    assert!(matches!(stop, Ok(()) | Err(HostError::NotFound(_))));
    assert!(a_pids.iter().all(|&pid| !pid_alive(pid)));
    assert_exclusive(&host.supervisor, &a).await;

    assert!(report.with(SweepOutcome::Restarted).contains(&&b));
    let b_now = host.supervisor.running_snapshot(&b).await.unwrap().pids;
    assert!(b_now.iter().all(|pid| !b_pids.contains(pid)));
    assert!(b_pids.iter().all(|&pid| !pid_alive(pid)));

    host.supervisor.shutdown().await;
}

#[tokio::test]
async fn sweep_skips_projects_without_auto_restart() {
    let host = Host::new(2);
    let id = host.register(ADMIN, "pinned", &[("main.py", LONG_RUNNING)], &["main.py"]).await;
    host.supervisor
        .start(StartRequest::new(id.clone()).auto_restart(false))
        .await
        .unwrap();
    let pids = host.supervisor.running_snapshot(&id).await.unwrap().pids;

    let report = host.supervisor.sweep_once().await;
    assert!(report.outcomes.is_empty());
    assert_eq!(host.supervisor.running_snapshot(&id).await.unwrap().pids, pids);
    host.supervisor.shutdown().await;
}

#[tokio::test]
async fn expiry_stops_and_notifies() {
    let host = Host::new(2);
    let id = host.register(ADMIN, "ttl", &[("main.py", LONG_RUNNING)], &["main.py"]).await;
    host.supervisor
        .start(StartRequest::new(id.clone()).with_ttl(Some(TtlDuration::milliseconds(150))))
        .await
        .unwrap();
    let pids = host.supervisor.running_snapshot(&id).await.unwrap().pids;

    assert!(host.supervisor.expire_once().await.is_empty());
    tokio::time::sleep(std::time::Duration::from_millis(250)).await;
    assert_eq!(host.supervisor.expire_once().await, vec![id.clone()]);
    assert!(!host.supervisor.is_active(&id).await);
    assert!(pids.iter().all(|&pid| !pid_alive(pid)));
    assert!(host
        .gateway
        .texts(ADMIN_CHAT)
        .contains(&"⌛ Duration expired for project: ttl".to_string()));
}

#[tokio::test]
async fn background_loop_restarts_on_schedule() {
    let fast = SupervisorSettings {
        restart_interval: std::time::Duration::from_millis(300),
        ..settings(2)
    };
    let host = Host::with(fast, Arc::new(pyhost_core::NoopInstaller));
    let id = host.register(ADMIN, "loop", &[("main.py", LONG_RUNNING)], &["main.py"]).await;
    host.supervisor.start(StartRequest::new(id.clone())).await.unwrap();
    host.supervisor.spawn_background();

    let restarted = eventually(|| async {
        host.gateway
            .texts(ADMIN_CHAT)
            .contains(&"🔄 Project restarted: loop".to_string())
    })
    .await;
    assert!(restarted);

    host.supervisor.shutdown().await;
    host.supervisor.shutdown().await;
    assert!(!host.supervisor.is_running(&id).await);
    let err = host.supervisor.start(StartRequest::new(id)).await.unwrap_err();
    assert!(matches!(err, HostError::Validation(_)));
}

#[tokio::test]
async fn set_duration_only_applies_to_running_projects() {
    let host = Host::new(2);
    let id = host.register(ADMIN, "dur", &[("main.py", LONG_RUNNING)], &["main.py"]).await;
    let err = host.supervisor.set_duration(&id, Some(3)).await.unwrap_err();
    assert_eq!(err.user_message(), "⚠️ Cannot set duration for inactive project");

    host.supervisor.start(StartRequest::new(id.clone())).await.unwrap();
    assert!(host.supervisor.set_duration(&id, Some(3)).await.unwrap().is_some());
    assert!(host.supervisor.set_duration(&id, None).await.unwrap().is_none());
    assert!(host.supervisor.running_snapshot(&id).await.unwrap().end_time.is_none());
    host.supervisor.shutdown().await;
}

#[tokio::test]
async fn delete_forgets_everything() {
    let host = Host::new(2);
    let id = host.register(ADMIN, "bye", &[("main.py", LONG_RUNNING)], &["main.py"]).await;
    host.supervisor.start(StartRequest::new(id.clone())).await.unwrap();
    let pids = host.supervisor.running_snapshot(&id).await.unwrap().pids;

    host.supervisor.delete(&id).await.unwrap();
    assert!(!host.supervisor.is_active(&id).await);
    assert!(host.supervisor.find_project(&id).await.is_none());
    assert!(!id.dir().exists());
    assert!(pids.iter().all(|&pid| !pid_alive(pid)));
    assert!(host.store.load_projects().unwrap().get(&ADMIN).is_none());
    assert!(matches!(host.supervisor.delete(&id).await, Err(HostError::NotFound(_))));
}

#[tokio::test]
async fn records_survive_a_new_supervisor() {
    let host = Host::new(2);
    let id = host.register(ADMIN, "keep", &[("main.py", "")], &["main.py"]).await;
    let reloaded = Supervisor::new(
        common::settings(2),
        host.store.clone(),
        host.supervisor.notifier().clone(),
        Arc::new(pyhost_core::NoopInstaller),
    )
    .unwrap();
    let project: Project = reloaded.find_project(&id).await.unwrap();
    assert_eq!(project.display_name, "keep");
    assert_eq!(project.main_files.len(), 1);
}

#[tokio::test]
async fn exit_with_error_is_forwarded_to_the_chat() {
    let host = Host::new(2);
    let id = host
        .register(ADMIN, "crash", &[("main.py", "echo boom >&2\nexit 2\n")], &["main.py"])
        .await;
    host.supervisor.start(StartRequest::new(id).quiet()).await.unwrap();

    let reported = eventually(|| async {
        host.gateway
            .texts(ADMIN_CHAT)
            .contains(&"⚠️ Project crash stopped with exit code: 2".to_string())
    })
    .await;
    assert!(reported);
    assert!(host
        .gateway
        .texts(ADMIN_CHAT)
        .contains(&"❌ Error in project crash:\nboom".to_string()));
}

/// Keeps running through SIGTERM until the grace period runs out.
const IGNORES_TERM: &str = "trap '' TERM\nwhile :; do sleep 0.1; done\n";

#[tokio::test]
async fn delete_during_pause_leaves_nothing_behind() {
    let host = Host::new(2);
    let id = host.register(ADMIN, "app", &[("main.py", IGNORES_TERM)], &["main.py"]).await;
    host.supervisor.start(StartRequest::new(id.clone())).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    let pauser = Arc::clone(&host.supervisor);
    let pausing = id.clone();
    let pause = tokio::spawn(async move { pauser.pause(&pausing).await });
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    host.supervisor.delete(&id).await.unwrap();
    pause.await.unwrap().unwrap();

    assert!(!host.supervisor.is_paused(&id).await);
    assert!(!host.supervisor.is_active(&id).await);
    assert!(host.supervisor.find_project(&id).await.is_none());

    host.upload(ADMIN, ADMIN_CHAT, "app.zip", common::zip_of(&[("main.py", "")]))
        .await;
    let reply = host.last_text(ADMIN_CHAT);
    assert!(reply.starts_with("📦 Received project: app"), "{}", reply);
}

#[tokio::test]
async fn restart_of_a_running_project_keeps_deadline_and_flag() {
    let host = Host::new(2);
    let id = host.register(ADMIN, "again", &[("main.py", LONG_RUNNING)], &["main.py"]).await;
    host.supervisor
        .start(StartRequest::new(id.clone()).for_days(Some(1)).auto_restart(false))
        .await
        .unwrap();
    let before = host.supervisor.running_snapshot(&id).await.unwrap();

    assert_eq!(host.supervisor.restart(&id).await.unwrap(), Relaunch::Started);
    let after = host.supervisor.running_snapshot(&id).await.unwrap();
    assert!(after.pids.iter().all(|pid| !before.pids.contains(pid)));
    assert!(before.pids.iter().all(|&pid| !pid_alive(pid)));
    let drift = (after.end_time.unwrap() - before.end_time.unwrap()).num_seconds().abs();
    assert!(drift <= 2, "deadline drifted by {}s", drift);
    assert!(!after.auto_restart);
    assert_exclusive(&host.supervisor, &id).await;

    host.supervisor.shutdown().await;
}

#[tokio::test]
async fn restart_of_a_paused_project_uses_the_paused_values() {
    let host = Host::new(2);
    let id = host.register(ADMIN, "dozing", &[("main.py", LONG_RUNNING)], &["main.py"]).await;
    host.supervisor
        .start(
            StartRequest::new(id.clone())
                .with_ttl(Some(TtlDuration::hours(2)))
                .auto_restart(false),
        )
        .await
        .unwrap();
    host.supervisor.pause(&id).await.unwrap();
    let deadline = host.supervisor.paused_snapshot(&id).await.unwrap().end_time.unwrap();

    assert_eq!(host.supervisor.restart(&id).await.unwrap(), Relaunch::Started);
    assert!(!host.supervisor.is_paused(&id).await);
    let after = host.supervisor.running_snapshot(&id).await.unwrap();
    let drift = (after.end_time.unwrap() - deadline).num_seconds().abs();
    assert!(drift <= 2, "deadline drifted by {}s", drift);
    assert!(!after.auto_restart);
    assert_eq!(after.pids.len(), 1);

    host.supervisor.shutdown().await;
}

#[tokio::test]
async fn restart_of_a_stopped_project_starts_with_defaults() {
    let host = Host::new(2);
    let id = host.register(ADMIN, "cold", &[("main.py", LONG_RUNNING)], &["main.py"]).await;

    assert_eq!(host.supervisor.restart(&id).await.unwrap(), Relaunch::Started);
    let snapshot = host.supervisor.running_snapshot(&id).await.unwrap();
    assert!(snapshot.end_time.is_none());
    assert!(snapshot.auto_restart);
    assert!(!host
        .gateway
        .texts(ADMIN_CHAT)
        .iter()
        .any(|t| t.starts_with("✅ Started project")));

    host.supervisor.shutdown().await;
}
