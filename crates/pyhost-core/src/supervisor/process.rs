//! One supervised child per main file, plus the task that owns it.
//!
//! The task drains both output streams, waits for the child, and reports a non-empty
//! stderr and a non-zero exit to the project's chat. A stop request takes priority: the
//! task terminates the child and exits without reporting anything.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::deps::truncate_chars;
use crate::error::{HostError, HostResult};
use crate::gateway::Notifier;
use crate::project::ChatId;

/// Extra time granted to the task on top of the grace period before it is aborted.
const KILL_SLACK: Duration = Duration::from_secs(2);
/// Grace period used when a handle is dropped without an explicit stop.
const ORPHAN_GRACE: Duration = Duration::from_secs(5);

/// Where a child's exit reports go.
#[derive(Clone)]
pub struct OutputContext {
    pub project_name: String,
    pub chat_id: ChatId,
    pub notifier: Notifier,
    pub stderr_limit: usize,
}

struct StopRequest {
    grace: Duration,
    done: oneshot::Sender<()>,
}

pub struct ProcessHandle {
    pub main_file: PathBuf,
    pub pid: Option<u32>,
    stop_tx: Option<oneshot::Sender<StopRequest>>,
    task: Option<JoinHandle<()>>,
}

impl ProcessHandle {
    /// True once the supervising task has finished (child exited or was stopped).
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Graceful termination, force-kill after `grace`. Safe to call more than once.
    pub async fn terminate(&mut self, grace: Duration) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let (done_tx, done_rx) = oneshot::channel();
            let request = StopRequest {
                grace,
                done: done_tx,
            };
            // A send error means the task already finished on its own.
            if stop_tx.send(request).is_ok()
                && tokio::time::timeout(grace + KILL_SLACK, done_rx).await.is_err()
            {
                warn!(pid = ?self.pid, main_file = %self.main_file.display(), "process task did not acknowledge stop");
            }
        }
        if let Some(task) = self.task.take() {
            if !task.is_finished() {
                task.abort();
            }
        }
    }
}

/// Launch `program <main_file>` with the working directory set to the file's parent.
pub fn spawn_process(program: &str, main_file: &Path, ctx: OutputContext) -> HostResult<ProcessHandle> {
    let launch_error = |reason: String| HostError::ProcessLaunch {
        path: main_file.to_path_buf(),
        reason,
    };
    let script = main_file
        .file_name()
        .ok_or_else(|| launch_error("not a file path".to_string()))?;
    let cwd = main_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut child = Command::new(program)
        .arg(script)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| launch_error(e.to_string()))?;

    let pid = child.id();
    info!(project = %ctx.project_name, pid = ?pid, main_file = %main_file.display(), "process started");

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (stop_tx, stop_rx) = oneshot::channel();
    let task = tokio::spawn(supervise(child, stdout, stderr, stop_rx, ctx));

    Ok(ProcessHandle {
        main_file: main_file.to_path_buf(),
        pid,
        stop_tx: Some(stop_tx),
        task: Some(task),
    })
}

enum Next {
    Exited(io::Result<ExitStatus>),
    Stop(Option<StopRequest>),
}

async fn supervise(
    mut child: Child,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    mut stop_rx: oneshot::Receiver<StopRequest>,
    ctx: OutputContext,
) {
    let stdout_task = tokio::spawn(drain_stdout(stdout, ctx.project_name.clone()));
    let stderr_task = tokio::spawn(collect_stderr(stderr, ctx.stderr_limit));

    let next = tokio::select! {
        status = child.wait() => Next::Exited(status),
        request = &mut stop_rx => Next::Stop(request.ok()),
    };

    match next {
        Next::Stop(request) => {
            let grace = request.as_ref().map_or(ORPHAN_GRACE, |r| r.grace);
            terminate_child(&mut child, grace).await;
            stdout_task.abort();
            stderr_task.abort();
            if let Some(request) = request {
                let _ = request.done.send(());
            }
        }
        Next::Exited(status) => {
            if let Err(e) = stdout_task.await {
                debug!(project = %ctx.project_name, error = %e, "stdout reader ended abnormally");
            }
            let errors = match stderr_task.await {
                Ok(text) => text,
                Err(e) => {
                    warn!(project = %ctx.project_name, error = %e, "stderr reader failed");
                    String::new()
                }
            };
            report_exit(&ctx, status, errors.trim_end()).await;
        }
    }
}

async fn report_exit(ctx: &OutputContext, status: io::Result<ExitStatus>, stderr: &str) {
    if !stderr.is_empty() {
        warn!(project = %ctx.project_name, stderr = %stderr, "process wrote to stderr");
        ctx.notifier
            .send(
                ctx.chat_id,
                &format!("❌ Error in project {}:\n{}", ctx.project_name, stderr),
            )
            .await;
    }

    let status = match status {
        Ok(status) => status,
        Err(e) => {
            warn!(project = %ctx.project_name, error = %e, "failed to wait for process");
            return;
        }
    };
    info!(project = %ctx.project_name, %status, "process exited");
    let code = match status.code() {
        Some(0) => return,
        Some(code) => code.to_string(),
        None => status.to_string(),
    };
    ctx.notifier
        .send(
            ctx.chat_id,
            &format!("⚠️ Project {} stopped with exit code: {}", ctx.project_name, code),
        )
        .await;
}

async fn drain_stdout(stdout: Option<ChildStdout>, project: String) {
    let Some(out) = stdout else { return };
    let mut lines = BufReader::new(out).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!(project = %project, "{}", line),
            Ok(None) => break,
            Err(e) => {
                debug!(project = %project, error = %e, "stdout read failed");
                break;
            }
        }
    }
}

/// Reads stderr to the end, keeping at most `limit` characters.
async fn collect_stderr(stderr: Option<ChildStderr>, limit: usize) -> String {
    let Some(err) = stderr else {
        return String::new();
    };
    let mut reader = BufReader::new(err);
    let mut collected = String::new();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let remaining = limit.saturating_sub(collected.chars().count());
                if remaining > 0 {
                    collected.push_str(&truncate_chars(&String::from_utf8_lossy(&buf), remaining));
                }
            }
            Err(e) => {
                debug!(error = %e, "stderr read failed");
                break;
            }
        }
    }
    collected
}

async fn terminate_child(child: &mut Child, grace: Duration) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }
    request_termination(child);
    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        warn!(pid = ?child.id(), "process ignored termination, killing");
        if let Err(e) = child.kill().await {
            debug!(error = %e, "kill failed");
        }
    }
}

#[cfg(unix)]
fn request_termination(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: `pid` is our own child and has not been reaped yet.
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            debug!(pid, error = %io::Error::last_os_error(), "SIGTERM failed");
        }
    }
}

#[cfg(not(unix))]
fn request_termination(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "terminate failed");
    }
}
