pub mod actor;
pub mod agent_loop;
pub mod confidence;
pub mod config;
pub mod daemon;
pub mod dna;
pub mod error;
pub mod events;
pub mod ipc;
pub mod log;
pub mod orchestrator;
pub mod providers;
pub mod queue;
pub mod sentinel;
pub mod task;
pub mod worktree;

pub use error::{Error, Result};
pub use task::{MidnightTask, TaskId, TaskStatus};
