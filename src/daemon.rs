//! Background service lifecycle.
//!
//! One daemon per user, enforced by a PID file under the data dir. The
//! file is checked with a zero signal on startup; a stale file from a
//! crashed run is removed, a live one refuses the second start. The
//! daemon logs to an append-only file, serves IPC on a unix socket and
//! shuts down cleanly on SIGTERM/SIGINT. A panic anywhere logs the
//! payload, drops the PID file and exits ungracefully with code 1.
//!
//! Lifecycle is an explicit state machine:
//! `Stopped → Starting → Running ⇄ Paused → Stopping → Stopped`.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::future::join_all;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::actor::ActorAgent;
use crate::agent_loop::{AgentLoop, LoopPolicy};
use crate::config::Config;
use crate::confidence::{calculate_confidence, ConfidenceScore};
use crate::dna::{load_dna, validate_dna};
use crate::events::{EventBus, MidnightEvent};
use crate::ipc::{ControlCommand, DaemonStatus, IpcContext, IpcServer};
use crate::orchestrator::MidnightOrchestrator;
use crate::providers::{LlmClient, RepoMapProvider, ToolExecutor};
use crate::sentinel::SentinelAgent;
use crate::worktree::GitWorktrees;
use crate::{mlog, mlog_error, mlog_warn, Error, Result};

/// Default priority for queued project directories without a
/// `priority` file.
const DEFAULT_PROJECT_PRIORITY: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonState {
    Stopped,
    Starting,
    Running,
    Paused,
    Stopping,
}

impl DaemonState {
    pub fn can_transition(&self, target: DaemonState) -> bool {
        use DaemonState::*;
        matches!(
            (self, target),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Stopping)
                | (Running, Paused)
                | (Running, Stopping)
                | (Paused, Running)
                | (Paused, Stopping)
                | (Stopping, Stopped)
        )
    }
}

impl std::fmt::Display for DaemonState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DaemonState::Stopped => "stopped",
            DaemonState::Starting => "starting",
            DaemonState::Running => "running",
            DaemonState::Paused => "paused",
            DaemonState::Stopping => "stopping",
        };
        write!(f, "{}", s)
    }
}

// ========== PID file ==========

pub fn read_pid_file(path: &Path) -> Option<i32> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

/// Check a PID with a zero signal. EPERM still means the process
/// exists, just under another user.
pub fn is_pid_alive(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Claim the PID file for this process.
///
/// A file naming a live process refuses the start; a stale file from a
/// crashed daemon is removed and claimed.
pub fn acquire_pid_file(path: &Path) -> Result<()> {
    if let Some(pid) = read_pid_file(path) {
        if is_pid_alive(pid) {
            return Err(Error::DaemonRunning { pid });
        }
        mlog_warn!("Removing stale PID file for dead pid {}", pid);
        std::fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, format!("{}\n", std::process::id()))?;
    Ok(())
}

pub fn remove_pid_file(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            mlog_warn!("Failed to remove PID file: {}", err);
        }
    }
}

// ========== Service ==========

/// Counters the IPC status snapshot is built from, folded out of the
/// event stream.
#[derive(Default)]
struct DaemonStats {
    queued_projects: usize,
    active_project: Option<String>,
    tasks_completed: usize,
    tasks_locked: usize,
    confidence: Option<ConfidenceScore>,
    cooldown_until: Option<String>,
}

pub struct BackgroundService {
    config: Config,
    llm: Arc<dyn LlmClient>,
    tools: Arc<dyn ToolExecutor>,
    repo_map: Option<Arc<dyn RepoMapProvider>>,
}

impl BackgroundService {
    pub fn new(
        config: Config,
        llm: Arc<dyn LlmClient>,
        tools: Arc<dyn ToolExecutor>,
        repo_map: Option<Arc<dyn RepoMapProvider>>,
    ) -> Self {
        Self {
            config,
            llm,
            tools,
            repo_map,
        }
    }

    /// Run the daemon in this process until a stop signal, a stop IPC
    /// command, or cancellation.
    pub async fn run(self) -> Result<()> {
        self.config.ensure_dirs()?;
        let pid_path = Config::pid_path()?;
        acquire_pid_file(&pid_path)?;
        install_panic_hook(pid_path.clone());

        let state = Arc::new(Mutex::new(DaemonState::Stopped));
        set_state(&state, DaemonState::Starting);
        mlog!("Midnight daemon starting (pid {})", std::process::id());

        let events = EventBus::new();
        let cancel = CancellationToken::new();
        let (pause_tx, pause_rx) = watch::channel(false);
        let (control_tx, mut control_rx) = mpsc::channel::<ControlCommand>(8);
        let history = Arc::new(Mutex::new(Vec::new()));
        let stats = Arc::new(Mutex::new(DaemonStats::default()));
        let started_at = Instant::now();

        // Fold events into the status counters; a separate subscriber
        // writes every event to the log so the file and IPC followers
        // see the same stream.
        spawn_stats_task(events.clone(), stats.clone(), cancel.clone());
        spawn_event_log_task(events.clone(), cancel.clone());

        let policy = LoopPolicy::from_trust(self.config.trust)
            .with_max_retries(self.config.effective_max_retries());
        let worktrees = Arc::new(GitWorktrees::new(self.config.worktrees_dir()?));
        let agent_loop = AgentLoop::new(
            ActorAgent::new(
                self.llm.clone(),
                self.tools.clone(),
                self.config.actor_max_steps,
            ),
            SentinelAgent::new(self.llm.clone(), self.config.quality_threshold),
            worktrees.clone(),
            self.repo_map.clone(),
            events.clone(),
            policy,
            history.clone(),
        );
        let mut orchestrator = MidnightOrchestrator::new(
            agent_loop,
            events.clone(),
            history.clone(),
            pause_rx,
            cancel.clone(),
        );

        let queued = scan_projects(&self.config, &mut orchestrator)?;
        if let Ok(mut stats) = stats.lock() {
            stats.queued_projects = queued;
        }
        mlog!("Queued {} project(s) from intake scan", queued);

        // Collect worktrees a crashed run left behind before any new
        // attempt claims their branches.
        let sweeps: Vec<_> = orchestrator
            .queue()
            .projects()
            .iter()
            .map(|project| {
                let worktrees = worktrees.clone();
                let path = project.path.clone();
                let short = project.id.short();
                async move {
                    let result = worktrees.cleanup_orphans(&path).await;
                    (short, path, result)
                }
            })
            .collect();
        for (short, path, result) in join_all(sweeps).await {
            match result {
                Ok(removed) if !removed.is_empty() => {
                    mlog!(
                        "Removed {} orphan worktree(s) for project {}",
                        removed.len(),
                        short
                    );
                }
                Ok(_) => {}
                Err(err) => {
                    mlog_warn!("Orphan cleanup failed for {}: {}", path.display(), err);
                }
            }
        }

        let ipc = IpcServer::bind(&Config::socket_path()?)?;
        let ipc_ctx = IpcContext {
            status: {
                let state = state.clone();
                let stats = stats.clone();
                let history = history.clone();
                Arc::new(move || {
                    build_status(&state, &stats, &history, started_at)
                })
            },
            control: control_tx,
            events: events.clone(),
            cancel: cancel.clone(),
        };
        let ipc_task = tokio::spawn(ipc.run(ipc_ctx));

        // Control commands and unix signals both resolve to the same
        // state transitions.
        {
            let state = state.clone();
            let events = events.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        cmd = control_rx.recv() => match cmd {
                            Some(ControlCommand::Stop) | None => {
                                set_state(&state, DaemonState::Stopping);
                                events.emit(MidnightEvent::ShuttingDown);
                                cancel.cancel();
                                break;
                            }
                            Some(ControlCommand::Pause) => {
                                set_state(&state, DaemonState::Paused);
                                let _ = pause_tx.send(true);
                                events.emit(MidnightEvent::Paused);
                            }
                            Some(ControlCommand::Resume) => {
                                set_state(&state, DaemonState::Running);
                                let _ = pause_tx.send(false);
                                events.emit(MidnightEvent::Resumed);
                            }
                        },
                    }
                }
            });
        }
        spawn_signal_task(state.clone(), events.clone(), cancel.clone());

        set_state(&state, DaemonState::Running);
        orchestrator.run().await;

        set_state(&state, DaemonState::Stopping);
        let _ = ipc_task.await;
        remove_pid_file(&pid_path);
        set_state(&state, DaemonState::Stopped);
        mlog!("Midnight daemon stopped");
        Ok(())
    }
}

fn set_state(state: &Arc<Mutex<DaemonState>>, target: DaemonState) {
    let mut guard = match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if *guard == target {
        return;
    }
    if !guard.can_transition(target) {
        mlog_warn!("Ignoring daemon transition {} -> {}", *guard, target);
        return;
    }
    mlog!("Daemon state: {} -> {}", *guard, target);
    *guard = target;
}

fn build_status(
    state: &Arc<Mutex<DaemonState>>,
    stats: &Arc<Mutex<DaemonStats>>,
    history: &Arc<Mutex<Vec<crate::sentinel::SentinelVerdict>>>,
    started_at: Instant,
) -> DaemonStatus {
    let state = match state.lock() {
        Ok(guard) => *guard,
        Err(poisoned) => *poisoned.into_inner(),
    };
    let confidence = {
        let history = match history.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        calculate_confidence(&history)
    };
    let stats = match stats.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    DaemonStatus {
        state,
        pid: std::process::id() as i32,
        uptime_secs: started_at.elapsed().as_secs(),
        queued_projects: stats.queued_projects,
        active_project: stats.active_project.clone(),
        tasks_completed: stats.tasks_completed,
        tasks_locked: stats.tasks_locked,
        confidence: stats.confidence.unwrap_or(confidence),
        cooldown_until: stats.cooldown_until.clone(),
    }
}

fn spawn_stats_task(
    events: EventBus,
    stats: Arc<Mutex<DaemonStats>>,
    cancel: CancellationToken,
) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            };
            let mut stats = match stats.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            match event {
                MidnightEvent::ProjectStarted { name, .. } => {
                    stats.active_project = Some(name);
                }
                MidnightEvent::ProjectCompleted { .. }
                | MidnightEvent::ProjectFailed { .. } => {
                    stats.active_project = None;
                    stats.queued_projects = stats.queued_projects.saturating_sub(1);
                }
                MidnightEvent::TaskCompleted { .. } => stats.tasks_completed += 1,
                MidnightEvent::TaskLocked { .. } => stats.tasks_locked += 1,
                MidnightEvent::ConfidenceUpdate { confidence } => {
                    stats.confidence = Some(confidence);
                }
                MidnightEvent::CooldownEntered { resume_at, .. } => {
                    stats.cooldown_until = Some(resume_at.to_rfc3339());
                }
                _ => {}
            }
        }
    });
}

/// Write one log line per emitted event, independent of any IPC
/// follower.
fn spawn_event_log_task(events: EventBus, cancel: CancellationToken) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            };
            if let Ok(json) = serde_json::to_string(&event) {
                mlog!("event {}", json);
            }
        }
    });
}

fn spawn_signal_task(
    state: Arc<Mutex<DaemonState>>,
    events: EventBus,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                mlog_error!("Failed to install SIGTERM handler: {}", err);
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(stream) => stream,
            Err(err) => {
                mlog_error!("Failed to install SIGINT handler: {}", err);
                return;
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sigterm.recv() => mlog!("Received SIGTERM"),
            _ = sigint.recv() => mlog!("Received SIGINT"),
        }
        set_state(&state, DaemonState::Stopping);
        events.emit(MidnightEvent::ShuttingDown);
        cancel.cancel();
    });
}

/// Panics must not leave a live-looking PID file behind.
fn install_panic_hook(pid_path: std::path::PathBuf) {
    let default = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        mlog_error!("Daemon panicked: {}", info);
        remove_pid_file(&pid_path);
        default(info);
        std::process::exit(1);
    }));
}

/// Queue every valid project directory under `projects_dir`.
///
/// A project directory holds the three DNA files and optionally a
/// `priority` file with a bare integer. Invalid projects are logged
/// and skipped, never fatal.
pub fn scan_projects(config: &Config, orchestrator: &mut MidnightOrchestrator) -> Result<usize> {
    let projects_dir = config.projects_dir()?;
    if !projects_dir.is_dir() {
        return Ok(0);
    }

    let mut queued = 0;
    let mut entries: Vec<_> = std::fs::read_dir(&projects_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    entries.sort();

    for path in entries {
        if !path.join("idea.md").is_file() {
            continue;
        }
        let dna = match load_dna(&path) {
            Ok(dna) => dna,
            Err(err) => {
                mlog_warn!("Skipping {}: {}", path.display(), err);
                continue;
            }
        };
        let validation = validate_dna(&dna);
        for warning in &validation.warnings {
            mlog_warn!("{}: {}", path.display(), warning);
        }
        let priority = read_priority_file(&path);
        match orchestrator.queue_mut().add_project(path.clone(), priority, dna) {
            Ok(id) => {
                mlog!(
                    "Queued project {} from {} (priority {})",
                    id.short(),
                    path.display(),
                    priority
                );
                queued += 1;
            }
            Err(err) => {
                mlog_warn!("Rejected {}: {}", path.display(), err);
            }
        }
    }
    Ok(queued)
}

fn read_priority_file(path: &Path) -> u32 {
    std::fs::read_to_string(path.join("priority"))
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(DEFAULT_PROJECT_PRIORITY)
}
