//! Recovery behavior: cooldowns, crash leftovers and intake hygiene.

use std::sync::{Arc, Mutex};

use tempfile::TempDir;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use midnight::actor::ActorAgent;
use midnight::agent_loop::{AgentLoop, LoopPolicy};
use midnight::config::Config;
use midnight::daemon::scan_projects;
use midnight::dna::load_dna;
use midnight::events::EventBus;
use midnight::orchestrator::MidnightOrchestrator;
use midnight::queue::ProjectStatus;
use midnight::sentinel::SentinelAgent;
use midnight::worktree::GitWorktrees;

use crate::fixtures::{FileTools, MockBackend, TestRepo, AUTH_DOD};

fn build_orchestrator(
    backend: Arc<MockBackend>,
) -> (MidnightOrchestrator, TempDir) {
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
        LoopPolicy::from_trust(2),
        history.clone(),
    );
    let orchestrator = MidnightOrchestrator::new(
        agent_loop,
        events,
        history,
        pause_rx,
        CancellationToken::new(),
    );
    (orchestrator, worktree_root)
}

#[tokio::test]
async fn test_rate_limit_parks_then_project_finishes() {
    let repo = TestRepo::new().with_dna(AUTH_DOD);
    let dna = load_dna(&repo.path).unwrap();
    let (mut orch, _root) = build_orchestrator(MockBackend::rate_limited_once());
    let id = orch
        .queue_mut()
        .add_project(repo.path.clone(), 50, dna)
        .unwrap();

    // First pull hits the throttle and parks the project.
    orch.run_project(id).await.unwrap();
    let cooldown = orch.cooldown().expect("cooldown should be set");
    assert_eq!(cooldown.provider, "mock");
    assert_eq!(orch.queue().get(id).unwrap().status, ProjectStatus::Active);
    // No retry budget was spent on the throttle.
    assert!(orch
        .queue()
        .get(id)
        .unwrap()
        .tasks
        .iter()
        .all(|t| t.verdicts.is_empty()));

    // The driver loop would sleep the cooldown out; the resumed run
    // completes the project.
    orch.run_project(id).await.unwrap();
    assert_eq!(
        orch.queue().get(id).unwrap().status,
        ProjectStatus::Completed
    );
    assert!(repo.has_file("src/auth.ts"));
}

#[tokio::test]
async fn test_intake_scan_queues_valid_and_skips_invalid() {
    let projects_root = TempDir::new().unwrap();

    // One valid project with an explicit priority.
    let valid = projects_root.path().join("good");
    std::fs::create_dir_all(&valid).unwrap();
    std::fs::write(
        valid.join("idea.md"),
        "An authentication module with registration and login endpoints.",
    )
    .unwrap();
    std::fs::write(valid.join("tech_stack.json"), r#"{"runtime": "node@20.11.0"}"#).unwrap();
    std::fs::write(valid.join("definition_of_done.md"), AUTH_DOD).unwrap();
    std::fs::write(valid.join("priority"), "80\n").unwrap();

    // One with a too-short idea (hard validation error).
    let invalid = projects_root.path().join("bad");
    std::fs::create_dir_all(&invalid).unwrap();
    std::fs::write(invalid.join("idea.md"), "tiny").unwrap();
    std::fs::write(invalid.join("tech_stack.json"), r#"{"runtime": "node@20.11.0"}"#).unwrap();
    std::fs::write(invalid.join("definition_of_done.md"), AUTH_DOD).unwrap();

    // A directory with no DNA at all is ignored outright.
    std::fs::create_dir_all(projects_root.path().join("not-a-project")).unwrap();

    let config = Config {
        projects_dir: Some(projects_root.path().display().to_string()),
        ..Config::default()
    };
    let (mut orch, _root) = build_orchestrator(MockBackend::passing());

    let queued = scan_projects(&config, &mut orch).unwrap();

    assert_eq!(queued, 1);
    assert_eq!(orch.queue().len(), 1);
    let project = &orch.queue().projects()[0];
    assert_eq!(project.priority, 80);
    assert!(project.path.ends_with("good"));
}

#[test]
fn test_log_file_is_append_only_across_restarts() {
    let dir = TempDir::new().unwrap();
    let log_path = dir.path().join("midnight.log");
    std::fs::write(&log_path, "line from a previous run\n").unwrap();

    // A second init must not truncate the file.
    midnight::log::init_at(&log_path, false);
    midnight::log::info("daemon restarted");

    let content = std::fs::read_to_string(&log_path).unwrap();
    assert!(content.contains("line from a previous run"));
}
