//! Append-only file logging for the midnight daemon.
//!
//! Every entry is one line: an ISO-8601 UTC timestamp, a level tag and
//! the message. The file is never truncated, so `tail -f` keeps working
//! across daemon restarts and the history of an overnight run survives
//! a crash. Debug output is gated by `--debug` or `MIDNIGHT_DEBUG=1`.

use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static THRESHOLD: AtomicU8 = AtomicU8::new(Level::Info as u8);

/// Severity of a log entry. Entries above the active threshold are
/// dropped before touching the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
        };
        f.write_str(tag)
    }
}

/// Initialize logging at an explicit path (the daemon uses
/// `<data_dir>/midnight.log`), creating parent directories as needed.
/// The file is opened append-only and never truncated.
pub fn init_at(path: &Path, debug: bool) {
    let env_debug = matches!(
        std::env::var("MIDNIGHT_DEBUG").as_deref(),
        Ok("1") | Ok("true") | Ok("TRUE")
    );
    let threshold = if debug || env_debug {
        Level::Debug
    } else {
        Level::Info
    };
    THRESHOLD.store(threshold as u8, Ordering::SeqCst);

    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    LOG_PATH.set(path.to_path_buf()).ok();
}

fn write_entry(level: Level, msg: &str) {
    if level as u8 > THRESHOLD.load(Ordering::Relaxed) {
        return;
    }
    let Some(path) = LOG_PATH.get() else {
        return;
    };
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
        let stamp = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
        let _ = writeln!(file, "[{stamp}] [{level}] {msg}");
    }
}

pub fn error(msg: &str) {
    write_entry(Level::Error, msg);
}

pub fn warn(msg: &str) {
    write_entry(Level::Warn, msg);
}

pub fn info(msg: &str) {
    write_entry(Level::Info, msg);
}

pub fn debug(msg: &str) {
    write_entry(Level::Debug, msg);
}

/// Log macro for INFO level.
#[macro_export]
macro_rules! mlog {
    ($($arg:tt)*) => {
        $crate::log::info(&format!($($arg)*))
    };
}

/// Log macro for ERROR level.
#[macro_export]
macro_rules! mlog_error {
    ($($arg:tt)*) => {
        $crate::log::error(&format!($($arg)*))
    };
}

/// Log macro for WARN level.
#[macro_export]
macro_rules! mlog_warn {
    ($($arg:tt)*) => {
        $crate::log::warn(&format!($($arg)*))
    };
}

/// Log macro for DEBUG level (dropped unless debug mode is on).
#[macro_export]
macro_rules! mlog_debug {
    ($($arg:tt)*) => {
        $crate::log::debug(&format!($($arg)*))
    };
}
