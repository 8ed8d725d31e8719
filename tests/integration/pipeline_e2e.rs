//! End-to-end pipeline: project DNA in, merged commits out.
//!
//! Uses real git repositories and worktrees; only the completion
//! backend is scripted.

use std::sync::{Arc, Mutex};

use tempfile::TempDir;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use midnight::actor::ActorAgent;
use midnight::agent_loop::{AgentLoop, LoopPolicy};
use midnight::dna::load_dna;
use midnight::events::EventBus;
use midnight::orchestrator::MidnightOrchestrator;
use midnight::queue::ProjectStatus;
use midnight::sentinel::SentinelAgent;
use midnight::task::TaskStatus;
use midnight::worktree::GitWorktrees;
use midnight::Error;

use crate::fixtures::{FileTools, MockBackend, TestRepo, AUTH_DOD};

fn build_orchestrator(
    backend: Arc<MockBackend>,
    trust: u8,
) -> (MidnightOrchestrator, EventBus, TempDir) {
    let worktree_root = TempDir::new().expect("Failed to create worktree root");
    let worktrees = Arc::new(GitWorktrees::new(worktree_root.path().to_path_buf()));
    let events = EventBus::new();
    let history = Arc::new(Mutex::new(Vec::new()));
    let (_pause_tx, pause_rx) = watch::channel(false);

    let agent_loop = AgentLoop::new(
        ActorAgent::new(backend.clone(), Arc::new(FileTools), 24),
        SentinelAgent::new(backend, 85),
        worktrees,
        None,
        events.clone(),
        LoopPolicy::from_trust(trust),
        history.clone(),
    );
    let orchestrator = MidnightOrchestrator::new(
        agent_loop,
        events.clone(),
        history,
        pause_rx,
        CancellationToken::new(),
    );
    (orchestrator, events, worktree_root)
}

#[tokio::test]
async fn test_authentication_module_runs_to_merged_commits() {
    let repo = TestRepo::new().with_dna(AUTH_DOD);
    let dna = load_dna(&repo.path).unwrap();
    let (mut orch, _events, _root) = build_orchestrator(MockBackend::passing(), 2);
    let id = orch
        .queue_mut()
        .add_project(repo.path.clone(), 50, dna)
        .unwrap();

    orch.run_project(id).await.unwrap();

    let project = orch.queue().get(id).unwrap();
    assert_eq!(project.status, ProjectStatus::Completed);
    assert_eq!(project.tasks.len(), 3);
    for task in &project.tasks {
        assert_eq!(task.status, TaskStatus::Completed);
        // First-attempt pass: exactly one verdict each.
        assert_eq!(task.verdicts.len(), 1);
        assert!(task.verdicts[0].passed);
        assert_eq!(task.verdicts[0].merkle_verification_hash.len(), 64);
    }

    // The Actor's file landed on the project's HEAD checkout.
    assert!(repo.has_file("src/auth.ts"));
}

#[tokio::test]
async fn test_hardcoded_secret_is_vetoed_and_never_merged() {
    let dod = "\
- [ ] Implement config loading for the service\n\
  - read settings from the environment with sane defaults\n\
  - never commit credentials to the repository\n";
    let repo = TestRepo::new().with_dna(dod);
    let dna = load_dna(&repo.path).unwrap();
    let secret_source = format!("const KEY = \"sk-{}\";\n", "a".repeat(40));
    let (mut orch, _events, _root) =
        build_orchestrator(MockBackend::writing(&secret_source), 1);
    let id = orch
        .queue_mut()
        .add_project(repo.path.clone(), 50, dna)
        .unwrap();

    orch.run_project(id).await.unwrap();

    let project = orch.queue().get(id).unwrap();
    assert_eq!(project.status, ProjectStatus::Failed);
    let task = &project.tasks[0];
    assert_eq!(task.status, TaskStatus::Locked);
    // The veto short-circuited the judge: deterministic zero-score
    // verdict with the exact catalog message.
    assert_eq!(task.verdicts.len(), 1);
    assert_eq!(task.verdicts[0].quality_score, 0);
    assert_eq!(
        task.verdicts[0].correction_directive.as_deref(),
        Some("VETO: Hardcoded secret or API key detected")
    );
    assert!(!repo.has_file("src/auth.ts"));
}

#[tokio::test]
async fn test_failed_attempt_retries_with_directive_and_passes() {
    let dod = "\
- [ ] Implement login with session issuance\n\
  - verify credentials against stored users\n\
  - reject empty passwords with a clear error\n";
    let repo = TestRepo::new().with_dna(dod);
    let dna = load_dna(&repo.path).unwrap();
    let backend = MockBackend::with_judge(vec![
        r#"{"quality_score": 55, "passed": false, "correction_directive": "Handle the empty-password case"}"#,
        r#"{"quality_score": 93, "passed": true}"#,
    ]);
    let (mut orch, _events, _root) = build_orchestrator(backend, 2);
    let id = orch
        .queue_mut()
        .add_project(repo.path.clone(), 50, dna)
        .unwrap();

    orch.run_project(id).await.unwrap();

    let project = orch.queue().get(id).unwrap();
    assert_eq!(project.status, ProjectStatus::Completed);
    let task = &project.tasks[0];
    assert_eq!(task.verdicts.len(), 2);
    assert!(!task.verdicts[0].passed);
    assert!(task.verdicts[1].passed);
    assert!(repo.has_file("src/auth.ts"));
}

#[tokio::test]
async fn test_invalid_dna_is_rejected_at_queue_time() {
    let repo = TestRepo::new().with_dna("too short");
    let dna = load_dna(&repo.path).unwrap();
    let (mut orch, _events, _root) = build_orchestrator(MockBackend::passing(), 2);

    let err = orch
        .queue_mut()
        .add_project(repo.path.clone(), 50, dna)
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert!(orch.queue().is_empty());
}
