//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Creating temporary git repositories and project DNA on disk
//! - A mock completion backend for Actor and Sentinel turns
//! - A tool executor that really writes files into the worktree

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use midnight::providers::{
    ChatMessage, ChatResponse, LlmClient, ToolCall, ToolExecutor, Usage,
};
use midnight::Result;

/// A test repository with a temporary directory and initialized git.
pub struct TestRepo {
    /// Keeps the directory alive for the test duration.
    pub temp_dir: TempDir,
    /// Path to the repository root.
    pub path: PathBuf,
}

impl TestRepo {
    /// Create a new test repository with an initial commit.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().to_path_buf();

        git(&path, &["init", "-b", "main"]);
        git(&path, &["config", "user.email", "test@test.com"]);
        git(&path, &["config", "user.name", "Test User"]);

        std::fs::write(path.join("README.md"), "# Test Repository\n")
            .expect("Failed to write README");
        git(&path, &["add", "."]);
        git(&path, &["commit", "-m", "Initial commit"]);

        Self { temp_dir, path }
    }

    /// Write the three DNA files into the repo, committed so worktree
    /// checkouts carry them.
    pub fn with_dna(self, dod: &str) -> Self {
        std::fs::write(
            self.path.join("idea.md"),
            "An authentication module with registration, login and password hashing.",
        )
        .expect("Failed to write idea.md");
        std::fs::write(
            self.path.join("tech_stack.json"),
            r#"{"language": "typescript", "runtime": "node@20.11.0", "testing": "vitest"}"#,
        )
        .expect("Failed to write tech_stack.json");
        std::fs::write(self.path.join("definition_of_done.md"), dod)
            .expect("Failed to write definition_of_done.md");
        git(&self.path, &["add", "."]);
        git(&self.path, &["commit", "-m", "Add project DNA"]);
        self
    }

    /// Whether a committed file exists on the current HEAD checkout.
    pub fn has_file(&self, name: &str) -> bool {
        self.path.join(name).is_file()
    }

    pub fn head_commit_message(&self) -> String {
        let output = Command::new("git")
            .args(["log", "-1", "--format=%s"])
            .current_dir(&self.path)
            .output()
            .expect("Failed to read git log");
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }
}

fn git(path: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(path)
        .output()
        .expect("Failed to run git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

/// A definition-of-done long enough to validate, with a single
/// dependency-free task per line.
pub const AUTH_DOD: &str = "\
## Core\n\
- [ ] Implement user registration with hashed passwords\n\
  - bcrypt or argon2 for hashing\n\
- [ ] Implement login with session issuance\n\
- [ ] Test registration and login flows\n";

/// Scripted completion backend shared by Actor and Sentinel.
///
/// Actor turns are stateless: the opening turn of each attempt asks for
/// one `write_file` call, every later turn calls `task_complete`. Judge
/// turns replay the scripted verdicts and fall back to a pass.
pub struct MockBackend {
    /// Content the Actor writes on each attempt.
    pub file_content: String,
    judge_responses: Mutex<Vec<String>>,
    rate_limits_remaining: Mutex<u32>,
}

impl MockBackend {
    pub fn passing() -> Arc<Self> {
        Arc::new(Self {
            file_content: "export function login() { return true; }\n".to_string(),
            judge_responses: Mutex::new(Vec::new()),
            rate_limits_remaining: Mutex::new(0),
        })
    }

    pub fn writing(content: &str) -> Arc<Self> {
        Arc::new(Self {
            file_content: content.to_string(),
            judge_responses: Mutex::new(Vec::new()),
            rate_limits_remaining: Mutex::new(0),
        })
    }

    pub fn with_judge(responses: Vec<&str>) -> Arc<Self> {
        Arc::new(Self {
            file_content: "export function login() { return true; }\n".to_string(),
            judge_responses: Mutex::new(
                responses.into_iter().rev().map(String::from).collect(),
            ),
            rate_limits_remaining: Mutex::new(0),
        })
    }

    pub fn rate_limited_once() -> Arc<Self> {
        Arc::new(Self {
            file_content: "export function login() { return true; }\n".to_string(),
            judge_responses: Mutex::new(Vec::new()),
            rate_limits_remaining: Mutex::new(1),
        })
    }
}

#[async_trait]
impl LlmClient for MockBackend {
    async fn chat(&self, messages: &[ChatMessage]) -> Result<ChatResponse> {
        {
            let mut remaining = self.rate_limits_remaining.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(midnight::Error::RateLimited {
                    provider: "mock".to_string(),
                    retry_after: Some(std::time::Duration::from_millis(5)),
                });
            }
        }

        let is_judge = messages
            .first()
            .map(|m| m.content.contains("Sentinel"))
            .unwrap_or(false);
        if is_judge {
            let content = self
                .judge_responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| r#"{"quality_score": 95, "passed": true}"#.to_string());
            return Ok(ChatResponse {
                content,
                tool_calls: Vec::new(),
                usage: Usage::default(),
            });
        }

        // Actor: opening turn writes the file, later turns finish.
        let call = if messages.len() == 2 {
            ToolCall {
                name: "write_file".to_string(),
                arguments: serde_json::json!({
                    "path": "src/auth.ts",
                    "content": self.file_content,
                }),
            }
        } else {
            ToolCall {
                name: "task_complete".to_string(),
                arguments: serde_json::Value::Null,
            }
        };
        Ok(ChatResponse {
            content: String::new(),
            tool_calls: vec![call],
            usage: Usage::default(),
        })
    }
}

/// Executes `write_file` for real inside the worktree.
pub struct FileTools;

#[async_trait]
impl ToolExecutor for FileTools {
    async fn execute(
        &self,
        worktree: &Path,
        name: &str,
        args: &serde_json::Value,
    ) -> Result<String> {
        match name {
            "write_file" => {
                let rel = args["path"].as_str().unwrap_or("out.txt");
                let content = args["content"].as_str().unwrap_or("");
                let path = worktree.join(rel);
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&path, content)?;
                Ok(format!("wrote {}", rel))
            }
            other => Err(midnight::Error::ToolExecution {
                tool: other.to_string(),
                reason: "unknown tool".to_string(),
            }),
        }
    }
}
