//! Task data model.
//!
//! Tasks are the atomic units of work extracted from a project's
//! definition-of-done. Each task tracks its status, priority,
//! dependencies, worktree assignment, and accumulated Sentinel verdicts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::queue::ProjectId;
use crate::sentinel::SentinelVerdict;
use crate::{Error, Result};

/// Unique identifier for a task.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Mint a fresh task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Short form for logs and branch names.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Task status in its lifecycle.
///
/// Transitions are monotonic: a task never moves back toward `Pending`,
/// and `Locked` is terminal, reachable only from `Failed` once the
/// retry budget is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task created but not yet picked up.
    Pending,
    /// Task handed to the loop, worktree not yet created.
    Assigned,
    /// An attempt is in flight.
    Running,
    /// A verdict passed and the worktree was merged.
    Completed,
    /// The most recent attempt failed; retries may remain.
    Failed,
    /// Task abandoned (unmet dependencies, project removed).
    Cancelled,
    /// Retry budget exhausted; requires external intervention.
    Locked,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Locked => "locked",
        };
        write!(f, "{}", s)
    }
}

impl TaskStatus {
    /// Valid transition matrix.
    ///
    /// - Pending -> Assigned | Cancelled
    /// - Assigned -> Running | Cancelled
    /// - Running -> Completed | Failed | Cancelled
    /// - Failed -> Running (retry) | Locked | Cancelled
    /// - Completed, Cancelled, Locked are terminal.
    pub fn can_transition(self, target: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, target),
            (Pending, Assigned)
                | (Pending, Cancelled)
                | (Assigned, Running)
                | (Assigned, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Failed, Running)
                | (Failed, Locked)
                | (Failed, Cancelled)
        )
    }
}

/// A single unit of work extracted from a definition-of-done.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MidnightTask {
    pub id: TaskId,
    pub project_id: ProjectId,
    /// `"<section>: <text>"` from the DoD checkbox line.
    pub description: String,
    /// Indented sub-bullets following the checkbox line.
    pub acceptance_criteria: Vec<String>,
    /// Higher runs earlier; lowered per DoD section, floored at 0.
    pub priority: u32,
    /// Tasks that must complete before this one starts.
    pub dependencies: Vec<TaskId>,
    pub status: TaskStatus,
    /// Worktree of the in-flight attempt, if any.
    pub worktree_path: Option<PathBuf>,
    /// Append-only verdict history, ordered by attempt.
    pub verdicts: Vec<SentinelVerdict>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl MidnightTask {
    pub fn new(project_id: ProjectId, description: impl Into<String>, priority: u32) -> Self {
        Self {
            id: TaskId::new(),
            project_id,
            description: description.into(),
            acceptance_criteria: Vec::new(),
            priority,
            dependencies: Vec::new(),
            status: TaskStatus::Pending,
            worktree_path: None,
            verdicts: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Transition to a new status, enforcing the lifecycle matrix.
    pub fn transition(&mut self, target: TaskStatus) -> Result<()> {
        if !self.status.can_transition(target) {
            return Err(Error::InvalidTransition {
                from: self.status.to_string(),
                to: target.to_string(),
            });
        }
        match target {
            TaskStatus::Running => {
                if self.started_at.is_none() {
                    self.started_at = Some(Utc::now());
                }
            }
            TaskStatus::Completed | TaskStatus::Locked | TaskStatus::Cancelled => {
                self.completed_at = Some(Utc::now());
            }
            _ => {}
        }
        self.status = target;
        Ok(())
    }

    /// Add a dependency, ignoring self-references and duplicates.
    pub fn add_dependency(&mut self, dep: TaskId) {
        if dep != self.id && !self.dependencies.contains(&dep) {
            self.dependencies.push(dep);
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Completed | TaskStatus::Cancelled | TaskStatus::Locked
        )
    }
}
