//! Actor/Sentinel attempt loop for one task.
//!
//! Every attempt is an explicit `Attempt` record moving through
//! `AttemptPhase`: worktree created, Actor running, Sentinel
//! verifying, then passed or failed. Nothing about an attempt lives in
//! shared mutable buffers; the record carries its own branch, worktree
//! path and outcome, so a crash mid-attempt leaves at worst an orphan
//! worktree that `cleanup_orphans` collects on the next start.
//!
//! The worktree is deleted on every exit path. That includes the
//! completion-backend error path: a rate limit cleans up first, then
//! bubbles to the orchestrator without consuming retry budget.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::actor::{ActorAgent, ActorContext, ActorOutcome};
use crate::confidence::calculate_confidence;
use crate::events::{EventBus, MidnightEvent};
use crate::providers::{RepoMapProvider, WorktreeManager};
use crate::sentinel::{ReviewContext, SentinelAgent, SentinelVerdict};
use crate::task::{MidnightTask, TaskStatus};
use crate::{mlog, mlog_warn, Result};

/// Retry and safety policy for the loop, derived from the trust level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopPolicy {
    /// Consecutive failed attempts before the task locks.
    pub max_retries: u32,
    /// Revert the worktree before deleting it on a failed attempt.
    pub enable_revert: bool,
    /// Run the deterministic veto catalog before the judge.
    pub enable_veto: bool,
}

impl LoopPolicy {
    /// Map a trust level (clamped to 1..=5) onto loop policy. Higher
    /// trust buys more retries and fewer guardrails; the mapping is
    /// monotonic in trust.
    pub fn from_trust(trust: u8) -> Self {
        let trust = trust.clamp(1, 5);
        Self {
            max_retries: trust as u32,
            enable_revert: trust <= 3,
            enable_veto: trust <= 4,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }
}

/// Lifecycle of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptPhase {
    Pending,
    WorktreeCreated,
    ActorRunning,
    SentinelVerifying,
    Passed,
    Failed,
}

/// One attempt at a task, self-contained.
#[derive(Debug)]
pub struct Attempt {
    pub number: u32,
    pub branch: String,
    pub phase: AttemptPhase,
    pub worktree: Option<PathBuf>,
    pub verdict: Option<SentinelVerdict>,
}

impl Attempt {
    fn new(task: &MidnightTask, number: u32) -> Self {
        Self {
            number,
            branch: format!("midnight/{}-a{}", task.id.short(), number),
            phase: AttemptPhase::Pending,
            worktree: None,
            verdict: None,
        }
    }
}

/// How a full task run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskRunOutcome {
    Completed { attempts: u32 },
    Locked { attempts: u32 },
    Cancelled,
}

/// Everything an attempt needs from the surrounding project.
pub struct TaskContext<'a> {
    pub project_path: &'a Path,
    /// The project plan (idea.md).
    pub plan: &'a str,
    pub definition_of_done: &'a str,
}

pub struct AgentLoop {
    actor: ActorAgent,
    sentinel: SentinelAgent,
    worktrees: Arc<dyn WorktreeManager>,
    repo_map: Option<Arc<dyn RepoMapProvider>>,
    events: EventBus,
    policy: LoopPolicy,
    /// Shared verdict history behind the confidence signal; the
    /// orchestrator reads the same vec for handoff decisions.
    history: Arc<Mutex<Vec<SentinelVerdict>>>,
}

impl AgentLoop {
    pub fn new(
        actor: ActorAgent,
        sentinel: SentinelAgent,
        worktrees: Arc<dyn WorktreeManager>,
        repo_map: Option<Arc<dyn RepoMapProvider>>,
        events: EventBus,
        policy: LoopPolicy,
        history: Arc<Mutex<Vec<SentinelVerdict>>>,
    ) -> Self {
        Self {
            actor,
            sentinel,
            worktrees,
            repo_map,
            events,
            policy,
            history,
        }
    }

    /// Run a task to completion, lock, or cancellation.
    ///
    /// A task re-entering after a cooldown resumes with its recorded
    /// failures still counting toward the retry budget; the rate-limit
    /// interruption itself consumed nothing.
    pub async fn run_task(
        &self,
        task: &mut MidnightTask,
        ctx: &TaskContext<'_>,
        cancel: &CancellationToken,
    ) -> Result<TaskRunOutcome> {
        match task.status {
            TaskStatus::Pending => {
                task.transition(TaskStatus::Assigned)?;
                task.transition(TaskStatus::Running)?;
            }
            TaskStatus::Failed => {
                task.transition(TaskStatus::Running)?;
            }
            TaskStatus::Running => {}
            other => {
                return Err(crate::Error::InvalidTransition {
                    from: other.to_string(),
                    to: TaskStatus::Running.to_string(),
                })
            }
        }

        let prior_failures = task.verdicts.iter().filter(|v| !v.passed).count() as u32;
        let mut failures = prior_failures;
        let mut last_directive: Option<String> = task
            .verdicts
            .iter()
            .rev()
            .find_map(|v| v.correction_directive.clone());

        while failures < self.policy.max_retries {
            if cancel.is_cancelled() {
                task.transition(TaskStatus::Cancelled)?;
                return Ok(TaskRunOutcome::Cancelled);
            }

            let number = failures + 1;
            let mut attempt = Attempt::new(task, number);
            self.events.emit(MidnightEvent::TaskStarted {
                task_id: task.id,
                attempt: number,
            });

            match self.run_attempt(task, ctx, &mut attempt, &last_directive).await {
                Ok(true) => {
                    task.transition(TaskStatus::Completed)?;
                    self.events.emit(MidnightEvent::TaskCompleted {
                        task_id: task.id,
                        attempts: number,
                    });
                    return Ok(TaskRunOutcome::Completed { attempts: number });
                }
                Ok(false) => {
                    failures += 1;
                    last_directive = attempt
                        .verdict
                        .as_ref()
                        .and_then(|v| v.correction_directive.clone())
                        .or(last_directive);
                    if failures < self.policy.max_retries {
                        task.transition(TaskStatus::Failed)?;
                        task.transition(TaskStatus::Running)?;
                    } else {
                        task.transition(TaskStatus::Failed)?;
                    }
                }
                Err(err) => {
                    // Cleanup already ran inside run_attempt. A
                    // recoverable backend error leaves the task Failed
                    // so a later run can legally resume it.
                    mlog_warn!(
                        "Attempt {} on task {} aborted: {}",
                        number,
                        task.id.short(),
                        err
                    );
                    if task.status == TaskStatus::Running {
                        task.transition(TaskStatus::Failed)?;
                    }
                    return Err(err);
                }
            }
        }

        // A task resumed with its budget already spent is still Running
        // here; Locked is only reachable from Failed.
        if task.status == TaskStatus::Running {
            task.transition(TaskStatus::Failed)?;
        }
        task.transition(TaskStatus::Locked)?;
        self.events.emit(MidnightEvent::TaskLocked {
            task_id: task.id,
            attempts: failures,
        });
        mlog!(
            "Task {} locked after {} failed attempt(s)",
            task.id.short(),
            failures
        );
        Ok(TaskRunOutcome::Locked { attempts: failures })
    }

    /// One attempt. Returns `Ok(true)` on a merged pass, `Ok(false)` on
    /// any failure that should consume retry budget. The worktree is
    /// always deleted before returning.
    async fn run_attempt(
        &self,
        task: &mut MidnightTask,
        ctx: &TaskContext<'_>,
        attempt: &mut Attempt,
        directive: &Option<String>,
    ) -> Result<bool> {
        let worktree = self
            .worktrees
            .create(ctx.project_path, &attempt.branch)
            .await?;
        attempt.worktree = Some(worktree.clone());
        attempt.phase = AttemptPhase::WorktreeCreated;
        task.worktree_path = Some(worktree.clone());

        let result = self.attempt_body(task, ctx, attempt, directive, &worktree).await;

        task.worktree_path = None;
        if let Err(delete_err) = self.worktrees.delete(&worktree).await {
            mlog_warn!("Failed to delete worktree {:?}: {}", worktree, delete_err);
        }
        result
    }

    async fn attempt_body(
        &self,
        task: &mut MidnightTask,
        ctx: &TaskContext<'_>,
        attempt: &mut Attempt,
        directive: &Option<String>,
        worktree: &Path,
    ) -> Result<bool> {
        let repo_map = match &self.repo_map {
            Some(provider) => Some(provider.repo_map().await?),
            None => None,
        };

        attempt.phase = AttemptPhase::ActorRunning;
        let actor_ctx = ActorContext {
            plan: ctx.plan.to_string(),
            repo_map: repo_map.clone(),
            correction_directive: directive.clone(),
        };
        let outcome: ActorOutcome = self.actor.run(task, worktree, &actor_ctx).await?;

        if !outcome.success {
            // Step-budget exhaustion is a failed attempt like any
            // other: it consumes retry budget and must leave a verdict
            // with a directive the next attempt can act on.
            mlog_warn!(
                "Actor exhausted its step budget on task {}",
                task.id.short()
            );
            let diff = self.worktrees.diff(worktree).await.unwrap_or_default();
            let verdict = self.sentinel.incomplete_verdict(task, &diff);
            self.record_verdict(task, attempt, verdict);
            attempt.phase = AttemptPhase::Failed;
            self.discard(worktree).await;
            return Ok(false);
        }

        attempt.phase = AttemptPhase::SentinelVerifying;
        let diff = self.worktrees.diff(worktree).await?;

        if self.policy.enable_veto {
            if let Some(violation) = self.sentinel.check_veto(&diff) {
                let verdict = self.sentinel.veto_verdict(task, &diff, &violation);
                self.events.emit(MidnightEvent::SentinelVeto {
                    task_id: task.id,
                    attempt: attempt.number,
                    message: violation.message.clone(),
                });
                self.record_verdict(task, attempt, verdict);
                attempt.phase = AttemptPhase::Failed;
                self.discard(worktree).await;
                return Ok(false);
            }
        }

        let review = ReviewContext {
            plan: ctx.plan,
            definition_of_done: ctx.definition_of_done,
            repo_map: repo_map.as_deref(),
            previous: &task.verdicts,
        };
        let verdict = self.sentinel.judge(task, &diff, &review).await?;
        let passed = verdict.passed;
        self.events.emit(MidnightEvent::SentinelVerdict {
            task_id: task.id,
            attempt: attempt.number,
            quality_score: verdict.quality_score,
            passed,
        });
        self.record_verdict(task, attempt, verdict);

        if passed {
            self.worktrees.merge(worktree).await?;
            attempt.phase = AttemptPhase::Passed;
            Ok(true)
        } else {
            attempt.phase = AttemptPhase::Failed;
            self.discard(worktree).await;
            Ok(false)
        }
    }

    /// Revert a failed attempt's worktree when policy asks for it.
    async fn discard(&self, worktree: &Path) {
        if self.policy.enable_revert {
            if let Err(err) = self.worktrees.revert(worktree).await {
                mlog_warn!("Revert of {:?} failed: {}", worktree, err);
            }
        }
    }

    fn record_verdict(&self, task: &mut MidnightTask, attempt: &mut Attempt, verdict: SentinelVerdict) {
        task.verdicts.push(verdict.clone());
        attempt.verdict = Some(verdict.clone());
        let confidence = {
            let mut history = match self.history.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            history.push(verdict);
            calculate_confidence(&history)
        };
        self.events.emit(MidnightEvent::ConfidenceUpdate { confidence });
    }
}
