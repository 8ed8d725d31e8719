//! Actor agent: the implementer side of an attempt.
//!
//! The Actor drives a bounded tool loop against a single worktree. Each
//! step sends the conversation to the completion backend and executes
//! whatever tool calls come back inside the worktree. The loop ends when
//! the model calls `task_complete`, or runs out of budget, in which case
//! the attempt is reported unsuccessful and the Sentinel never sees it
//! as a pass candidate.
//!
//! Tool failures are not fatal. They are fed back to the model as tool
//! results so it can adjust course. Only completion-backend errors
//! (`LlmCall`, `RateLimited`) abort the attempt and propagate.

use std::path::Path;
use std::sync::Arc;

use crate::providers::{ChatMessage, LlmClient, ToolExecutor};
use crate::task::MidnightTask;
use crate::{mlog, mlog_debug, Error, Result};

/// Tool name that signals the Actor considers the task done.
pub const TASK_COMPLETE_TOOL: &str = "task_complete";

/// Context injected into an attempt beyond the task itself.
#[derive(Debug, Clone, Default)]
pub struct ActorContext {
    /// The project plan (idea.md).
    pub plan: String,
    pub repo_map: Option<String>,
    /// Correction directive from the previous failing verdict, if any.
    pub correction_directive: Option<String>,
}

/// What one Actor run produced.
#[derive(Debug, Clone)]
pub struct ActorOutcome {
    /// True only when the model called `task_complete` within budget.
    pub success: bool,
    pub steps_used: u32,
    /// Tool-level transcript, for the log and for debugging locked
    /// tasks.
    pub transcript: Vec<String>,
}

pub struct ActorAgent {
    llm: Arc<dyn LlmClient>,
    tools: Arc<dyn ToolExecutor>,
    max_steps: u32,
}

impl ActorAgent {
    pub fn new(llm: Arc<dyn LlmClient>, tools: Arc<dyn ToolExecutor>, max_steps: u32) -> Self {
        Self {
            llm,
            tools,
            max_steps,
        }
    }

    /// Run one implementation attempt inside `worktree`.
    ///
    /// Returns `Ok` with `success=false` on budget exhaustion; errors
    /// only for completion-backend failures, which the caller treats
    /// per the recovery taxonomy.
    pub async fn run(
        &self,
        task: &MidnightTask,
        worktree: &Path,
        ctx: &ActorContext,
    ) -> Result<ActorOutcome> {
        let mut messages = vec![
            ChatMessage::system(self.build_system_prompt(worktree)),
            ChatMessage::user(build_task_prompt(task, ctx)),
        ];
        let mut transcript = Vec::new();

        for step in 1..=self.max_steps {
            let response = self.llm.chat(&messages).await?;

            if !response.content.is_empty() {
                messages.push(ChatMessage::assistant(response.content.clone()));
            }

            if response.tool_calls.is_empty() {
                // A turn with no tool call burns a step but keeps the
                // conversation going.
                messages.push(ChatMessage::user(
                    "Continue. Use tools to make progress, or call task_complete when done."
                        .to_string(),
                ));
                continue;
            }

            for call in &response.tool_calls {
                if call.name == TASK_COMPLETE_TOOL {
                    mlog!(
                        "Actor finished task {} in {} step(s)",
                        task.id.short(),
                        step
                    );
                    return Ok(ActorOutcome {
                        success: true,
                        steps_used: step,
                        transcript,
                    });
                }

                let result = match self.tools.execute(worktree, &call.name, &call.arguments).await {
                    Ok(output) => output,
                    Err(Error::ToolExecution { tool, reason }) => {
                        mlog_debug!("tool {} failed: {}", tool, reason);
                        format!("ERROR running {}: {}", tool, reason)
                    }
                    Err(other) => return Err(other),
                };
                transcript.push(format!("{}: {}", call.name, truncate(&result, 200)));
                messages.push(ChatMessage::tool(format!(
                    "[{}] {}",
                    call.name, result
                )));
            }
        }

        mlog!(
            "Actor exhausted {} steps on task {} without completing",
            self.max_steps,
            task.id.short()
        );
        Ok(ActorOutcome {
            success: false,
            steps_used: self.max_steps,
            transcript,
        })
    }

    fn build_system_prompt(&self, worktree: &Path) -> String {
        format!(
            "You are Actor, an autonomous software implementer. You work inside an \
             isolated git worktree at {} and nowhere else. Make the smallest change \
             that satisfies the task, then call the task_complete tool. Available \
             tools are executed for you; their results come back as tool messages.",
            worktree.display()
        )
    }
}

fn build_task_prompt(task: &MidnightTask, ctx: &ActorContext) -> String {
    let mut prompt = format!("TASK:\n{}\n", task.description);
    if !task.acceptance_criteria.is_empty() {
        prompt.push_str("\nACCEPTANCE CRITERIA:\n");
        for criterion in &task.acceptance_criteria {
            prompt.push_str(&format!("- {}\n", criterion));
        }
    }
    if !ctx.plan.is_empty() {
        prompt.push_str(&format!("\nPROJECT PLAN:\n{}\n", ctx.plan));
    }
    if let Some(map) = &ctx.repo_map {
        prompt.push_str(&format!("\nREPOSITORY MAP:\n{}\n", map));
    }
    if let Some(directive) = &ctx.correction_directive {
        prompt.push_str(&format!(
            "\nA previous attempt at this task was rejected. You MUST address \
             this correction before anything else:\n{}\n",
            directive
        ));
    }
    prompt
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}
