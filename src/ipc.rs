//! Unix-socket control channel.
//!
//! The daemon listens on a socket under the data dir and speaks
//! newline-delimited JSON: one request per line in, one response line
//! out. `status` with `follow` keeps the connection open and pushes
//! `{"type":"event",...}` lines as the daemon emits them. The CLI is
//! the only intended client, but the protocol is plain enough for
//! `socat` debugging.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::confidence::ConfidenceScore;
use crate::daemon::DaemonState;
use crate::events::EventBus;
use crate::{mlog_debug, mlog_warn, Error, Result};

/// Commands a client can send.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcRequest {
    Status {
        #[serde(default)]
        follow: bool,
    },
    Stop,
    Pause,
    Resume,
}

/// One response line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcResponse {
    Status { status: DaemonStatus },
    Success,
    Error { message: String },
}

/// Snapshot returned by `status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub state: DaemonState,
    pub pid: i32,
    pub uptime_secs: u64,
    pub queued_projects: usize,
    pub active_project: Option<String>,
    pub tasks_completed: usize,
    pub tasks_locked: usize,
    pub confidence: ConfidenceScore,
    pub cooldown_until: Option<String>,
}

/// Daemon-side actions requested over IPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Stop,
    Pause,
    Resume,
}

/// Shared handles the server needs to answer requests.
#[derive(Clone)]
pub struct IpcContext {
    /// Produces a fresh status snapshot on demand.
    pub status: Arc<dyn Fn() -> DaemonStatus + Send + Sync>,
    pub control: mpsc::Sender<ControlCommand>,
    pub events: EventBus,
    pub cancel: CancellationToken,
}

pub struct IpcServer {
    listener: UnixListener,
    path: PathBuf,
}

impl IpcServer {
    /// Bind the control socket, replacing a stale socket file from a
    /// previous run.
    pub fn bind(path: &Path) -> Result<Self> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(path)?;
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    /// Accept clients until cancelled, then remove the socket file.
    pub async fn run(self, ctx: IpcContext) {
        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            if let Err(err) = handle_client(stream, ctx).await {
                                mlog_debug!("IPC client error: {}", err);
                            }
                        });
                    }
                    Err(err) => {
                        mlog_warn!("IPC accept failed: {}", err);
                    }
                },
            }
        }
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn handle_client(stream: UnixStream, ctx: IpcContext) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request: IpcRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                write_line(
                    &mut write_half,
                    &IpcResponse::Error {
                        message: format!("bad request: {}", err),
                    },
                )
                .await?;
                continue;
            }
        };
        mlog_debug!("IPC request: {:?}", request);

        match request {
            IpcRequest::Status { follow } => {
                let snapshot = (ctx.status)();
                write_line(&mut write_half, &IpcResponse::Status { status: snapshot }).await?;
                if follow {
                    stream_events(&mut write_half, &ctx).await?;
                    return Ok(());
                }
            }
            IpcRequest::Stop => {
                write_line(&mut write_half, &IpcResponse::Success).await?;
                let _ = ctx.control.send(ControlCommand::Stop).await;
                return Ok(());
            }
            IpcRequest::Pause => {
                let _ = ctx.control.send(ControlCommand::Pause).await;
                write_line(&mut write_half, &IpcResponse::Success).await?;
            }
            IpcRequest::Resume => {
                let _ = ctx.control.send(ControlCommand::Resume).await;
                write_line(&mut write_half, &IpcResponse::Success).await?;
            }
        }
    }
    Ok(())
}

/// Push events to a follower until it disconnects or the daemon stops.
async fn stream_events(
    write_half: &mut tokio::net::unix::OwnedWriteHalf,
    ctx: &IpcContext,
) -> Result<()> {
    let mut events = ctx.events.subscribe();
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => return Ok(()),
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    // Lagged followers skip ahead; a closed bus means
                    // shutdown.
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
                };
                let payload = serde_json::json!({ "type": "event", "event": event });
                let mut line = serde_json::to_string(&payload)?;
                line.push('\n');
                if write_half.write_all(line.as_bytes()).await.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

async fn write_line(
    write_half: &mut tokio::net::unix::OwnedWriteHalf,
    response: &IpcResponse,
) -> Result<()> {
    let mut line = serde_json::to_string(response)?;
    line.push('\n');
    write_half.write_all(line.as_bytes()).await?;
    Ok(())
}

// ========== Client side ==========

/// Send one request and read one response line.
pub async fn send_request(socket: &Path, request: &IpcRequest) -> Result<IpcResponse> {
    let stream = UnixStream::connect(socket)
        .await
        .map_err(|_| Error::DaemonNotRunning)?;
    let (read_half, mut write_half) = stream.into_split();

    let mut line = serde_json::to_string(request)?;
    line.push('\n');
    write_half.write_all(line.as_bytes()).await?;

    let mut lines = BufReader::new(read_half).lines();
    match lines.next_line().await? {
        Some(line) => Ok(serde_json::from_str(&line)?),
        None => Err(Error::Ipc("connection closed before response".to_string())),
    }
}

/// Follow the daemon's status stream, handing each pushed line to the
/// callback until the daemon closes the connection.
pub async fn follow_status(socket: &Path, mut on_line: impl FnMut(&str)) -> Result<()> {
    let stream = UnixStream::connect(socket)
        .await
        .map_err(|_| Error::DaemonNotRunning)?;
    let (read_half, mut write_half) = stream.into_split();

    let mut line = serde_json::to_string(&IpcRequest::Status { follow: true })?;
    line.push('\n');
    write_half.write_all(line.as_bytes()).await?;

    let mut lines = BufReader::new(read_half).lines();
    while let Some(line) = lines.next_line().await? {
        on_line(&line);
    }
    Ok(())
}
