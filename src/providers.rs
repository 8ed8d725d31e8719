//! Consumed collaborator interfaces.
//!
//! Midnight drives a completion backend, a tool sandbox, a git worktree
//! layer, and a repository-map source, but owns none of them. Each is
//! specified here as a dyn-safe async trait so production backends and
//! test mocks are interchangeable. Pre/post-conditions are documented on
//! the trait methods; the rest of the crate relies only on those.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::Result;

/// Role of a chat message in a completion request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    /// Result of a tool execution, fed back to the model.
    Tool,
}

/// One message in a completion conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Tool name, e.g. `write_file` or `task_complete`.
    pub name: String,
    /// Tool arguments as free-form JSON.
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// Token accounting for one completion call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Response from one completion call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Free-text content of the assistant turn.
    pub content: String,
    /// Tool calls requested by the model, in order.
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub usage: Usage,
}

/// Completion backend.
///
/// Errors: implementations return `Error::LlmCall` for transport or
/// model failures and `Error::RateLimited` when the provider throttles;
/// both are recoverable at the loop level (§ error taxonomy).
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat(&self, messages: &[ChatMessage]) -> Result<ChatResponse>;
}

/// Sandboxed tool execution.
///
/// `execute` runs one named tool with JSON arguments inside the given
/// worktree and returns its textual result. Failures surface as
/// `Error::ToolExecution`; the Actor feeds those back to the model
/// instead of aborting the attempt.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, worktree: &Path, name: &str, args: &serde_json::Value)
        -> Result<String>;
}

/// Git worktree lifecycle for one task attempt.
///
/// Contract: exactly one worktree per in-flight attempt. `create`
/// returns the worktree path; `merge` lands the attempt's changes on
/// the project branch (called on PASS); `revert` discards uncommitted
/// work (called on FAIL/VETO); `delete` removes the worktree and its
/// bookkeeping and must succeed on every exit path, including for
/// orphans left behind by a crash.
#[async_trait]
pub trait WorktreeManager: Send + Sync {
    async fn create(&self, project_path: &Path, branch: &str) -> Result<PathBuf>;
    async fn diff(&self, worktree: &Path) -> Result<String>;
    async fn merge(&self, worktree: &Path) -> Result<()>;
    async fn revert(&self, worktree: &Path) -> Result<()>;
    async fn delete(&self, worktree: &Path) -> Result<()>;
}

/// Source of a condensed repository map given to the Sentinel judge.
#[async_trait]
pub trait RepoMapProvider: Send + Sync {
    async fn repo_map(&self) -> Result<String>;
}

/// Placeholder backend used until a completion provider is wired in.
///
/// Every call fails recoverably, so a daemon started without a backend
/// idles through cooldowns instead of crashing or fabricating work.
pub struct UnconfiguredBackend;

#[async_trait]
impl LlmClient for UnconfiguredBackend {
    async fn chat(&self, _messages: &[ChatMessage]) -> Result<ChatResponse> {
        Err(crate::Error::LlmCall(
            "no completion backend configured".to_string(),
        ))
    }
}

#[async_trait]
impl ToolExecutor for UnconfiguredBackend {
    async fn execute(
        &self,
        _worktree: &Path,
        name: &str,
        _args: &serde_json::Value,
    ) -> Result<String> {
        Err(crate::Error::ToolExecution {
            tool: name.to_string(),
            reason: "no tool backend configured".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_message_constructors() {
        assert_eq!(ChatMessage::system("s").role, Role::System);
        assert_eq!(ChatMessage::user("u").role, Role::User);
        assert_eq!(ChatMessage::assistant("a").role, Role::Assistant);
        assert_eq!(ChatMessage::tool("t").role, Role::Tool);
    }

    #[test]
    fn test_tool_call_deserializes_without_arguments() {
        let call: ToolCall = serde_json::from_str(r#"{"name":"task_complete"}"#).unwrap();
        assert_eq!(call.name, "task_complete");
        assert!(call.arguments.is_null());
    }

    #[test]
    fn test_chat_response_defaults() {
        let resp: ChatResponse = serde_json::from_str(r#"{"content":"done"}"#).unwrap();
        assert_eq!(resp.content, "done");
        assert!(resp.tool_calls.is_empty());
        assert_eq!(resp.usage.input_tokens, 0);
    }
}
