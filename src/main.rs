use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use midnight::config::Config;
use midnight::daemon::{self, BackgroundService};
use midnight::dna::{extract_tasks, load_dna, validate_dna};
use midnight::ipc::{self, IpcRequest, IpcResponse};
use midnight::providers::UnconfiguredBackend;
use midnight::queue::ProjectId;
use midnight::{Error, Result};

/// Midnight - unattended overnight build daemon
#[derive(Parser, Debug)]
#[command(name = "midnight")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    MIDNIGHT_DEBUG=1    Enable debug logging (alternative to --debug)"
)]
pub struct Cli {
    /// Enable debug logging (writes to ~/.midnight/midnight.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Start the daemon and work the project queue
    Start {
        /// Stay attached instead of detaching into the background
        #[arg(long)]
        foreground: bool,

        /// Trust level 1-5 for this run (overrides config)
        #[arg(long)]
        trust: Option<u8>,
    },

    /// Stop the running daemon gracefully
    Stop,

    /// Show daemon status
    Status {
        /// Keep the connection open and stream events
        #[arg(long)]
        follow: bool,
    },

    /// Pause work at the next attempt boundary
    Pause,

    /// Resume paused work
    Resume,

    /// Validate a project directory's DNA files without queueing
    Validate {
        /// Project directory containing idea.md, tech_stack.json and
        /// definition_of_done.md
        path: PathBuf,
    },

    /// Preview the tasks a definition-of-done would extract to
    Tasks {
        /// Project directory
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Start { foreground, trust } => run_start(foreground, trust, cli.debug).await,
        Command::Stop => run_stop().await,
        Command::Status { follow } => run_status(follow).await,
        Command::Pause => run_simple(IpcRequest::Pause, "Paused").await,
        Command::Resume => run_simple(IpcRequest::Resume, "Resumed").await,
        Command::Validate { path } => run_validate(&path),
        Command::Tasks { path } => run_tasks(&path),
    }
}

async fn run_start(foreground: bool, trust: Option<u8>, debug: bool) -> Result<()> {
    let mut config = Config::load()?;
    if let Some(trust) = trust {
        config.trust = trust.clamp(1, 5);
    }

    if !foreground {
        return detach(trust, debug);
    }

    midnight::log::init_at(&Config::log_path()?, debug);
    let service = BackgroundService::new(
        config,
        Arc::new(UnconfiguredBackend),
        Arc::new(UnconfiguredBackend),
        None,
    );
    service.run().await
}

/// Re-exec ourselves detached; the child owns the PID file.
fn detach(trust: Option<u8>, debug: bool) -> Result<()> {
    let pid_path = Config::pid_path()?;
    if let Some(pid) = daemon::read_pid_file(&pid_path) {
        if daemon::is_pid_alive(pid) {
            return Err(Error::DaemonRunning { pid });
        }
    }

    let exe = std::env::current_exe()?;
    let mut command = std::process::Command::new(exe);
    command.args(["start", "--foreground"]);
    if debug {
        command.arg("--debug");
    }
    if let Some(trust) = trust {
        command.args(["--trust", &trust.to_string()]);
    }
    let child = command
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()?;

    println!("Midnight daemon started (pid {})", child.id());
    println!("Logs: {}", Config::log_path()?.display());
    Ok(())
}

async fn run_stop() -> Result<()> {
    let socket = Config::socket_path()?;
    match ipc::send_request(&socket, &IpcRequest::Stop).await? {
        IpcResponse::Success => {
            println!("Daemon stopping");
            Ok(())
        }
        IpcResponse::Error { message } => Err(Error::Ipc(message)),
        other => Err(Error::Ipc(format!("unexpected response: {:?}", other))),
    }
}

async fn run_status(follow: bool) -> Result<()> {
    let socket = Config::socket_path()?;
    if follow {
        return ipc::follow_status(&socket, |line| {
            match serde_json::from_str::<serde_json::Value>(line) {
                Ok(value) if value["type"] == "event" => {
                    println!("{}", value["event"]);
                }
                _ => println!("{}", line),
            }
        })
        .await;
    }

    match ipc::send_request(&socket, &IpcRequest::Status { follow: false }).await? {
        IpcResponse::Status { status } => {
            println!("State:            {}", status.state);
            println!("PID:              {}", status.pid);
            println!("Uptime:           {}s", status.uptime_secs);
            println!("Queued projects:  {}", status.queued_projects);
            println!(
                "Active project:   {}",
                status.active_project.as_deref().unwrap_or("-")
            );
            println!("Tasks completed:  {}", status.tasks_completed);
            println!("Tasks locked:     {}", status.tasks_locked);
            println!(
                "Confidence:       {} ({})",
                status.confidence.score, status.confidence.status
            );
            if let Some(until) = status.cooldown_until {
                println!("Cooldown until:   {}", until);
            }
            Ok(())
        }
        IpcResponse::Error { message } => Err(Error::Ipc(message)),
        other => Err(Error::Ipc(format!("unexpected response: {:?}", other))),
    }
}

async fn run_simple(request: IpcRequest, done: &str) -> Result<()> {
    let socket = Config::socket_path()?;
    match ipc::send_request(&socket, &request).await? {
        IpcResponse::Success => {
            println!("{}", done);
            Ok(())
        }
        IpcResponse::Error { message } => Err(Error::Ipc(message)),
        other => Err(Error::Ipc(format!("unexpected response: {:?}", other))),
    }
}

fn run_validate(path: &PathBuf) -> Result<()> {
    let dna = load_dna(path)?;
    let validation = validate_dna(&dna);

    for error in &validation.errors {
        println!("error: {}", error);
    }
    for warning in &validation.warnings {
        println!("warning: {}", warning);
    }
    if validation.valid {
        println!("{} is valid", path.display());
        Ok(())
    } else {
        std::process::exit(1);
    }
}

fn run_tasks(path: &PathBuf) -> Result<()> {
    let dna = load_dna(path)?;
    let tasks = extract_tasks(&dna, ProjectId::new());

    println!("{} task(s):", tasks.len());
    for task in &tasks {
        println!("  [{:>3}] {}", task.priority, task.description);
        for criterion in &task.acceptance_criteria {
            println!("        - {}", criterion);
        }
        if !task.dependencies.is_empty() {
            println!("        depends on {} task(s)", task.dependencies.len());
        }
    }
    Ok(())
}
