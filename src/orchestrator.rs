//! Single-flow project orchestration.
//!
//! The orchestrator owns the project queue and drives one task at a
//! time through the agent loop. Between tasks it honors the pause gate
//! and any active cooldown; a provider rate limit parks the whole
//! pipeline until `resume_at` rather than burning retry budget across
//! tasks. Confidence falling to Error raises a handoff event so a
//! human looks at the log, but the pipeline itself keeps draining
//! work.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::agent_loop::{AgentLoop, TaskContext, TaskRunOutcome};
use crate::confidence::{calculate_confidence, Health};
use crate::dna::extract_tasks;
use crate::events::{EventBus, MidnightEvent};
use crate::queue::{ProjectId, ProjectQueue, ProjectStatus};
use crate::sentinel::SentinelVerdict;
use crate::task::TaskStatus;
use crate::{mlog, mlog_error, mlog_warn, Error, Result};

/// Queue poll interval while idle.
const IDLE_POLL: Duration = Duration::from_secs(5);

/// Cooldown applied when a provider throttles without a retry-after.
const DEFAULT_COOLDOWN: Duration = Duration::from_secs(300);

/// Cooldown applied for generic completion-backend failures.
const LLM_ERROR_COOLDOWN: Duration = Duration::from_secs(60);

/// A provider throttle window. No work is pulled until `resume_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cooldown {
    pub provider: String,
    pub resume_at: DateTime<Utc>,
}

pub struct MidnightOrchestrator {
    queue: ProjectQueue,
    agent_loop: AgentLoop,
    events: EventBus,
    history: Arc<Mutex<Vec<SentinelVerdict>>>,
    cooldown: Option<Cooldown>,
    paused: watch::Receiver<bool>,
    cancel: CancellationToken,
    last_health: Health,
}

impl MidnightOrchestrator {
    pub fn new(
        agent_loop: AgentLoop,
        events: EventBus,
        history: Arc<Mutex<Vec<SentinelVerdict>>>,
        paused: watch::Receiver<bool>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            queue: ProjectQueue::new(),
            agent_loop,
            events,
            history,
            cooldown: None,
            paused,
            cancel,
            last_health: Health::Warning,
        }
    }

    pub fn queue(&self) -> &ProjectQueue {
        &self.queue
    }

    pub fn queue_mut(&mut self) -> &mut ProjectQueue {
        &mut self.queue
    }

    pub fn cooldown(&self) -> Option<&Cooldown> {
        self.cooldown.as_ref()
    }

    /// Drive the queue until cancellation.
    pub async fn run(&mut self) {
        mlog!("Orchestrator running");
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            if self.wait_if_paused().await.is_err() {
                break;
            }
            if self.wait_out_cooldown().await.is_err() {
                break;
            }

            // An Active project interrupted by a cooldown resumes
            // before new work is pulled.
            let next = self
                .queue
                .projects()
                .iter()
                .find(|p| p.status == ProjectStatus::Active)
                .map(|p| p.id)
                .or_else(|| self.queue.next_project());

            match next {
                Some(id) => {
                    if let Err(err) = self.run_project(id).await {
                        mlog_error!("Project {} failed hard: {}", id.short(), err);
                        self.fail_project(id, &err.to_string());
                    }
                }
                None => {
                    if self.idle_sleep(IDLE_POLL).await.is_err() {
                        break;
                    }
                }
            }
        }
        mlog!("Orchestrator stopped");
    }

    /// Run one project's tasks in dependency-then-priority order.
    ///
    /// Returns `Ok` for every per-task outcome including locks and
    /// cooldowns; `Err` only for failures that should fail the project.
    pub async fn run_project(&mut self, id: ProjectId) -> Result<()> {
        let (path, plan, dod) = {
            let project = self.queue.get_mut(id).ok_or_else(|| Error::ProjectNotFound(id.to_string()))?;
            if project.status == ProjectStatus::Pending {
                project.status = ProjectStatus::Active;
                let name = project
                    .path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| project.path.display().to_string());
                self.events.emit(MidnightEvent::ProjectStarted {
                    project_id: id,
                    name,
                });
            }
            if project.tasks.is_empty() {
                project.tasks = extract_tasks(&project.dna, id);
                mlog!(
                    "Extracted {} task(s) for project {}",
                    project.tasks.len(),
                    id.short()
                );
            }
            (
                project.path.clone(),
                project.dna.idea.clone(),
                project.dna.definition_of_done.clone(),
            )
        };

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            if self.wait_if_paused().await.is_err() {
                return Ok(());
            }

            self.cancel_blocked_tasks(id)?;

            let Some(task_idx) = self.pick_ready_task(id) else {
                break;
            };

            let ctx = TaskContext {
                project_path: &path,
                plan: &plan,
                definition_of_done: &dod,
            };
            let outcome = {
                let project = self.queue.get_mut(id).ok_or_else(|| Error::ProjectNotFound(id.to_string()))?;
                let task = &mut project.tasks[task_idx];
                self.agent_loop.run_task(task, &ctx, &self.cancel).await
            };

            match outcome {
                Ok(TaskRunOutcome::Completed { .. }) | Ok(TaskRunOutcome::Locked { .. }) => {
                    self.check_confidence();
                }
                Ok(TaskRunOutcome::Cancelled) => return Ok(()),
                Err(Error::RateLimited {
                    provider,
                    retry_after,
                }) => {
                    self.enter_cooldown(&provider, retry_after.unwrap_or(DEFAULT_COOLDOWN));
                    return Ok(());
                }
                Err(Error::LlmCall(reason)) => {
                    // No verdict was produced, so the interrupted
                    // attempt does not count against the retry budget;
                    // the task resumes after the cooldown.
                    mlog_warn!("Completion backend error: {}", reason);
                    self.enter_cooldown("llm", LLM_ERROR_COOLDOWN);
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        }

        self.finalize_project(id)?;
        Ok(())
    }

    /// Highest-priority runnable task; insertion order breaks ties. A
    /// task is runnable when every dependency completed and it is not
    /// in a terminal state.
    fn pick_ready_task(&self, id: ProjectId) -> Option<usize> {
        let project = self.queue.get(id)?;
        let mut best: Option<(usize, u32)> = None;
        for (idx, task) in project.tasks.iter().enumerate() {
            let runnable = matches!(task.status, TaskStatus::Pending | TaskStatus::Failed);
            if !runnable {
                continue;
            }
            let deps_done = task.dependencies.iter().all(|dep| {
                project
                    .tasks
                    .iter()
                    .find(|t| t.id == *dep)
                    .map(|t| t.status == TaskStatus::Completed)
                    .unwrap_or(true)
            });
            if !deps_done {
                continue;
            }
            match best {
                Some((_, priority)) if task.priority <= priority => {}
                _ => best = Some((idx, task.priority)),
            }
        }
        best.map(|(idx, _)| idx)
    }

    /// Cancel pending tasks whose dependencies can no longer complete.
    fn cancel_blocked_tasks(&mut self, id: ProjectId) -> Result<()> {
        loop {
            let project = self.queue.get(id).ok_or_else(|| Error::ProjectNotFound(id.to_string()))?;
            let blocked: Vec<usize> = project
                .tasks
                .iter()
                .enumerate()
                .filter(|(_, task)| task.status == TaskStatus::Pending)
                .filter(|(_, task)| {
                    task.dependencies.iter().any(|dep| {
                        project
                            .tasks
                            .iter()
                            .find(|t| t.id == *dep)
                            .map(|t| {
                                matches!(t.status, TaskStatus::Locked | TaskStatus::Cancelled)
                            })
                            .unwrap_or(false)
                    })
                })
                .map(|(idx, _)| idx)
                .collect();
            if blocked.is_empty() {
                return Ok(());
            }
            let project = self.queue.get_mut(id).ok_or_else(|| Error::ProjectNotFound(id.to_string()))?;
            for idx in blocked {
                let task = &mut project.tasks[idx];
                mlog!(
                    "Cancelling task {}: dependency locked or cancelled",
                    task.id.short()
                );
                task.transition(TaskStatus::Cancelled)?;
            }
        }
    }

    fn finalize_project(&mut self, id: ProjectId) -> Result<()> {
        let project = self.queue.get_mut(id).ok_or_else(|| Error::ProjectNotFound(id.to_string()))?;
        let total = project.tasks.len();
        let completed = project
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count();

        if completed == total {
            project.status = ProjectStatus::Completed;
            mlog!("Project {} completed ({} task(s))", id.short(), total);
            self.events
                .emit(MidnightEvent::ProjectCompleted { project_id: id });
        } else {
            let reason = format!("{} of {} task(s) did not complete", total - completed, total);
            project.status = ProjectStatus::Failed;
            mlog_warn!("Project {} failed: {}", id.short(), reason);
            self.events.emit(MidnightEvent::ProjectFailed {
                project_id: id,
                reason,
            });
        }
        self.handoff_from(id);
        Ok(())
    }

    fn fail_project(&mut self, id: ProjectId, reason: &str) {
        if let Some(project) = self.queue.get_mut(id) {
            project.status = ProjectStatus::Failed;
        }
        self.events.emit(MidnightEvent::ProjectFailed {
            project_id: id,
            reason: reason.to_string(),
        });
        self.handoff_from(id);
    }

    /// A finished project hands control to whatever is queued next.
    fn handoff_from(&self, finished: ProjectId) {
        let reason = match self.queue.next_project() {
            Some(next) => format!(
                "project {} finished, next is {}",
                finished.short(),
                next.short()
            ),
            None => format!("project {} finished, queue empty", finished.short()),
        };
        mlog!("Handoff: {}", reason);
        self.events.emit(MidnightEvent::HandoffTriggered { reason });
    }

    fn enter_cooldown(&mut self, provider: &str, wait: Duration) {
        let resume_at = Utc::now()
            + chrono::Duration::from_std(wait).unwrap_or_else(|_| chrono::Duration::seconds(300));
        mlog_warn!(
            "Entering cooldown for provider {} until {}",
            provider,
            resume_at.to_rfc3339()
        );
        self.cooldown = Some(Cooldown {
            provider: provider.to_string(),
            resume_at,
        });
        self.events.emit(MidnightEvent::CooldownEntered {
            provider: provider.to_string(),
            resume_at,
        });
    }

    /// Emit a handoff when confidence first drops to Error.
    fn check_confidence(&mut self) {
        let confidence = {
            let history = match self.history.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            calculate_confidence(&history)
        };
        if confidence.status == Health::Error && self.last_health != Health::Error {
            mlog_error!(
                "Confidence dropped to error (score {}), requesting handoff",
                confidence.score
            );
            self.events.emit(MidnightEvent::HandoffTriggered {
                reason: format!("confidence score {} with repeated failures", confidence.score),
            });
        }
        self.last_health = confidence.status;
    }

    /// Block while the pause gate is set. `Err` means cancelled.
    async fn wait_if_paused(&mut self) -> std::result::Result<(), ()> {
        while *self.paused.borrow() {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(()),
                changed = self.paused.changed() => {
                    if changed.is_err() {
                        return Err(());
                    }
                }
            }
        }
        Ok(())
    }

    /// Sleep through an active cooldown. `Err` means cancelled.
    async fn wait_out_cooldown(&mut self) -> std::result::Result<(), ()> {
        if let Some(cooldown) = &self.cooldown {
            let now = Utc::now();
            if cooldown.resume_at > now {
                let wait = (cooldown.resume_at - now)
                    .to_std()
                    .unwrap_or(DEFAULT_COOLDOWN);
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(()),
                    _ = tokio::time::sleep(wait) => {}
                }
            }
            mlog!("Cooldown for provider {} over, resuming", cooldown.provider);
            self.cooldown = None;
        }
        Ok(())
    }

    async fn idle_sleep(&self, wait: Duration) -> std::result::Result<(), ()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(()),
            _ = tokio::time::sleep(wait) => Ok(()),
        }
    }
}
