//! pyhost daemon
//!
//! Loads configuration, opens the store, starts the supervisor's background loop and
//! serves the local HTTP gateway until CTRL-C. Every running project is stopped on the way out.

mod http;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use pyhost_core::{
    AccessControl, Controller, DependencyInstaller, HostConfig, MemoryGateway, Notifier,
    PipInstaller, ProjectStore, Supervisor, SupervisorSettings,
};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const LOG_FILE: &str = "pyhost.log";

#[tokio::main]
async fn main() {
    // Load .env file if present (before any env::var calls)
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[pyhost-daemon] .env not loaded: {} (using system environment)", e);
    }

    let config = match HostConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("[pyhost-daemon] invalid configuration: {}", e);
            std::process::exit(1);
        }
    };
    let _log_guard = init_tracing(&config.log_dir);

    let store = match ProjectStore::open_path(&config.storage_path) {
        Ok(store) => store,
        Err(e) => {
            tracing::error!(path = %config.storage_path.display(), error = %e, "failed to open store");
            std::process::exit(1);
        }
    };
    let access = Arc::new(AccessControl::load(config.admin_ids.iter().copied(), store.clone()));

    let gateway = Arc::new(MemoryGateway::new());
    let notifier = Notifier::new(gateway.clone(), config.retry_policy());
    let installer: Arc<dyn DependencyInstaller> = Arc::new(PipInstaller::new(
        &config.pip_program,
        &config.requirements_file,
        config.install_timeout(),
    ));
    let supervisor = match Supervisor::new(SupervisorSettings::from(&config), store, notifier, installer) {
        Ok(supervisor) => Arc::new(supervisor),
        Err(e) => {
            tracing::error!(error = %e, "failed to load stored projects");
            std::process::exit(1);
        }
    };
    supervisor.spawn_background();

    let controller = Arc::new(Controller::new(
        access,
        Arc::clone(&supervisor),
        &config.projects_dir,
        config.retry_policy(),
    ));
    let app = http::router(http::AppState {
        controller,
        gateway,
    });

    let addr = SocketAddr::from(([127, 0, 0, 1], config.http_port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(%addr, error = %e, "failed to bind gateway");
            std::process::exit(1);
        }
    };
    tracing::info!(
        %addr,
        max_running = config.max_running,
        projects_dir = %config.projects_dir.display(),
        "pyhost daemon started"
    );

    tokio::select! {
        result = axum::serve(listener, app) => {
            if let Err(e) = result {
                tracing::error!("Server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("CTRL-C received; shutting down daemon");
        }
    }

    supervisor.shutdown().await;
    tracing::info!("✓ Graceful shutdown complete");
}

/// Stdout plus a log file under `log_dir`. The returned guard flushes the file on drop.
fn init_tracing(log_dir: &Path) -> Option<WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
    );
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());

    match std::fs::create_dir_all(log_dir) {
        Ok(()) => {
            let appender = tracing_appender::rolling::never(log_dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        Err(e) => {
            registry.init();
            tracing::warn!(log_dir = %log_dir.display(), error = %e, "file logging disabled");
            None
        }
    }
}
