use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Missing project file: {0}")]
    MissingFile(String),

    #[error("Parse error in {file}: {reason}")]
    Parse { file: String, reason: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Tool execution failed ({tool}): {reason}")]
    ToolExecution { tool: String, reason: String },

    #[error("LLM call failed: {0}")]
    LlmCall(String),

    #[error("Provider rate limited: {provider}")]
    RateLimited {
        provider: String,
        retry_after: Option<std::time::Duration>,
    },

    #[error("Task locked after {attempts} failed attempts")]
    TaskLocked { attempts: u32 },

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("Daemon already running (pid {pid})")]
    DaemonRunning { pid: i32 },

    #[error("Daemon is not running")]
    DaemonNotRunning,

    #[error("IPC error: {0}")]
    Ipc(String),

    #[error("No home directory")]
    NoHomeDir,
}

impl Error {
    /// Whether this error should fail the current attempt without
    /// taking the daemon down. Anything outside this set is treated
    /// as fatal by the daemon's top-level handler.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::ToolExecution { .. } | Error::LlmCall(_) | Error::RateLimited { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
