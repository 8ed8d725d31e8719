//! Priority-ordered project queue.
//!
//! The queue owns project and task status outside of active execution.
//! Selection is by highest priority, FIFO within equal priority.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::dna::{validate_dna, ProjectDna};
use crate::task::MidnightTask;
use crate::{Error, Result};

/// Unique identifier for a queued project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(pub Uuid);

impl ProjectId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Short form for logs.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for ProjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ProjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Project status in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Pending,
    Active,
    Completed,
    Failed,
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProjectStatus::Pending => "pending",
            ProjectStatus::Active => "active",
            ProjectStatus::Completed => "completed",
            ProjectStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// A project waiting for, or undergoing, unattended execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedProject {
    pub id: ProjectId,
    /// Directory containing the DNA files and the git repository.
    pub path: PathBuf,
    pub priority: u32,
    pub status: ProjectStatus,
    pub dna: ProjectDna,
    /// Extracted tasks; empty until the orchestrator extracts them.
    pub tasks: Vec<MidnightTask>,
    pub queued_at: DateTime<Utc>,
}

impl QueuedProject {
    pub fn new(path: PathBuf, priority: u32, dna: ProjectDna) -> Self {
        Self {
            id: ProjectId::new(),
            path,
            priority,
            status: ProjectStatus::Pending,
            dna,
            tasks: Vec::new(),
            queued_at: Utc::now(),
        }
    }
}

/// Priority-ordered store of projects.
///
/// Insertion order is preserved so that `next_project` is FIFO among
/// projects of equal priority.
#[derive(Debug, Default)]
pub struct ProjectQueue {
    projects: Vec<QueuedProject>,
}

impl ProjectQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a project. DNA hard errors block queueing; warnings are
    /// logged by the caller and do not.
    pub fn add_project(&mut self, path: PathBuf, priority: u32, dna: ProjectDna) -> Result<ProjectId> {
        let validation = validate_dna(&dna);
        if !validation.valid {
            return Err(Error::Validation(validation.errors.join("; ")));
        }
        let project = QueuedProject::new(path, priority, dna);
        let id = project.id;
        self.projects.push(project);
        Ok(id)
    }

    pub fn remove_project(&mut self, id: ProjectId) -> Result<QueuedProject> {
        let idx = self
            .projects
            .iter()
            .position(|p| p.id == id)
            .ok_or_else(|| Error::ProjectNotFound(id.to_string()))?;
        Ok(self.projects.remove(idx))
    }

    /// Highest-priority pending project; FIFO within equal priority.
    ///
    /// The backing vec preserves insertion order, so a strict `>` scan
    /// keeps the earliest entry among equal priorities.
    pub fn next_project(&self) -> Option<ProjectId> {
        let mut best: Option<&QueuedProject> = None;
        for project in self
            .projects
            .iter()
            .filter(|p| p.status == ProjectStatus::Pending)
        {
            match best {
                Some(current) if project.priority <= current.priority => {}
                _ => best = Some(project),
            }
        }
        best.map(|p| p.id)
    }

    pub fn reorder_project(&mut self, id: ProjectId, priority: u32) -> Result<()> {
        let project = self
            .projects
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| Error::ProjectNotFound(id.to_string()))?;
        project.priority = priority;
        Ok(())
    }

    pub fn get(&self, id: ProjectId) -> Option<&QueuedProject> {
        self.projects.iter().find(|p| p.id == id)
    }

    pub fn get_mut(&mut self, id: ProjectId) -> Option<&mut QueuedProject> {
        self.projects.iter_mut().find(|p| p.id == id)
    }

    pub fn projects(&self) -> &[QueuedProject] {
        &self.projects
    }

    pub fn len(&self) -> usize {
        self.projects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
    }

    /// Count of projects still awaiting execution.
    pub fn pending_count(&self) -> usize {
        self.projects
            .iter()
            .filter(|p| p.status == ProjectStatus::Pending)
            .count()
    }
}
