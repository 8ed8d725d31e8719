//! Worktree lifecycle against real git repositories.

use std::path::PathBuf;

use midnight::providers::WorktreeManager;
use midnight::worktree::{GitWorktrees, WorktreeStatus};
use tempfile::TempDir;

use crate::fixtures::TestRepo;

fn manager() -> (GitWorktrees, TempDir) {
    let root = TempDir::new().expect("Failed to create worktree root");
    (GitWorktrees::new(root.path().to_path_buf()), root)
}

#[tokio::test]
async fn test_create_makes_isolated_checkout() {
    let repo = TestRepo::new();
    let (manager, _root) = manager();

    let worktree = manager
        .create(&repo.path, "midnight/task1-a1")
        .await
        .unwrap();

    assert!(worktree.is_dir());
    assert!(worktree.join("README.md").is_file());
    // Changes in the worktree do not appear in the project checkout.
    std::fs::write(worktree.join("new.ts"), "export {};\n").unwrap();
    assert!(!repo.path.join("new.ts").exists());
}

#[tokio::test]
async fn test_diff_reports_untracked_and_modified() {
    let repo = TestRepo::new();
    let (manager, _root) = manager();
    let worktree = manager
        .create(&repo.path, "midnight/task2-a1")
        .await
        .unwrap();

    std::fs::write(worktree.join("auth.ts"), "const x = 1;\n").unwrap();
    std::fs::write(worktree.join("README.md"), "# Changed\n").unwrap();

    let diff = manager.diff(&worktree).await.unwrap();
    assert!(diff.contains("+const x = 1;"));
    assert!(diff.contains("+# Changed"));
    assert!(diff.contains("-# Test Repository"));
}

#[tokio::test]
async fn test_merge_lands_changes_on_project_head() {
    let repo = TestRepo::new();
    let (manager, _root) = manager();
    let worktree = manager
        .create(&repo.path, "midnight/task3-a1")
        .await
        .unwrap();

    std::fs::write(worktree.join("auth.ts"), "export const ok = true;\n").unwrap();
    manager.merge(&worktree).await.unwrap();
    manager.delete(&worktree).await.unwrap();

    assert!(repo.has_file("auth.ts"));
    assert_eq!(repo.head_commit_message(), "midnight: midnight/task3-a1");
}

#[tokio::test]
async fn test_registry_tracks_worktree_status() {
    let repo = TestRepo::new();
    let (manager, _root) = manager();
    let worktree = manager
        .create(&repo.path, "midnight/task8-a1")
        .await
        .unwrap();

    let info = manager.info(&worktree).await.unwrap();
    assert_eq!(info.branch, "midnight/task8-a1");
    assert_eq!(info.status, WorktreeStatus::Active);

    std::fs::write(worktree.join("auth.ts"), "export const ok = true;\n").unwrap();
    manager.merge(&worktree).await.unwrap();
    assert_eq!(
        manager.info(&worktree).await.unwrap().status,
        WorktreeStatus::Merged
    );

    manager.delete(&worktree).await.unwrap();
    assert!(manager.info(&worktree).await.is_none());
}

#[tokio::test]
async fn test_revert_discards_uncommitted_changes() {
    let repo = TestRepo::new();
    let (manager, _root) = manager();
    let worktree = manager
        .create(&repo.path, "midnight/task4-a1")
        .await
        .unwrap();

    std::fs::write(worktree.join("README.md"), "# Mangled\n").unwrap();
    manager.revert(&worktree).await.unwrap();

    let content = std::fs::read_to_string(worktree.join("README.md")).unwrap();
    assert_eq!(content, "# Test Repository\n");
}

#[tokio::test]
async fn test_delete_removes_worktree_and_bookkeeping() {
    let repo = TestRepo::new();
    let (manager, _root) = manager();
    let worktree = manager
        .create(&repo.path, "midnight/task5-a1")
        .await
        .unwrap();

    manager.delete(&worktree).await.unwrap();

    assert!(!worktree.exists());
    // The admin dir must be gone or git still thinks the branch is
    // checked out.
    let admin = repo.path.join(".git/worktrees/midnight-task5-a1");
    assert!(!admin.exists());
    // The same branch can be created again immediately.
    let again = manager
        .create(&repo.path, "midnight/task5-a1")
        .await
        .unwrap();
    manager.delete(&again).await.unwrap();
}

#[tokio::test]
async fn test_branch_reuse_after_crash_leftover() {
    let repo = TestRepo::new();
    let (manager, _root) = manager();

    // First manager crashes without deleting; a fresh manager must be
    // able to claim the same branch with force.
    let worktree = manager
        .create(&repo.path, "midnight/task6-a1")
        .await
        .unwrap();
    std::fs::remove_dir_all(&worktree).unwrap();

    let (manager2, _root2) = self::manager();
    let worktree2 = manager2
        .create(&repo.path, "midnight/task6-a2")
        .await
        .unwrap();
    assert!(worktree2.is_dir());
}

#[tokio::test]
async fn test_cleanup_orphans_removes_unregistered_worktrees() {
    let repo = TestRepo::new();
    let root = TempDir::new().unwrap();
    let root_path: PathBuf = root.path().to_path_buf();

    // A first manager creates a worktree and "crashes".
    {
        let crashed = GitWorktrees::new(root_path.clone());
        crashed
            .create(&repo.path, "midnight/task7-a1")
            .await
            .unwrap();
    }

    // A fresh manager sees it as an orphan.
    let manager = GitWorktrees::new(root_path.clone());
    let removed = manager.cleanup_orphans(&repo.path).await.unwrap();

    assert_eq!(removed.len(), 1);
    assert!(!removed[0].exists());

    // A second pass finds nothing.
    let removed = manager.cleanup_orphans(&repo.path).await.unwrap();
    assert!(removed.is_empty());
}

#[tokio::test]
async fn test_cleanup_orphans_spares_registered_worktrees() {
    let repo = TestRepo::new();
    let (manager, _root) = manager();
    let worktree = manager
        .create(&repo.path, "midnight/task8-a1")
        .await
        .unwrap();

    let removed = manager.cleanup_orphans(&repo.path).await.unwrap();
    assert!(removed.is_empty());
    assert!(worktree.is_dir());
}
