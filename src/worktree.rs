//! Git worktree isolation for task attempts.
//!
//! Every attempt runs inside its own worktree on its own branch, so the
//! shared project repository is never touched by an unverified change.
//! `GitWorktrees` implements the `WorktreeManager` contract: merged on
//! PASS, reverted on FAIL/VETO, and always deleted at attempt end.
//! Orphans left behind by a crash are removed by `cleanup_orphans` on
//! daemon startup.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use git2::{
    BranchType, DiffFormat, DiffOptions, ErrorCode, IndexAddOption, Repository, ResetType,
    Signature,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::providers::WorktreeManager;
use crate::{mlog_debug, mlog_warn, Error, Result};

/// Worktree lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorktreeStatus {
    Active,
    Merged,
    Abandoned,
}

/// One attempt's isolated working copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: String,
    pub created_at: DateTime<Utc>,
    pub status: WorktreeStatus,
}

impl WorktreeInfo {
    pub fn new(path: PathBuf, branch: impl Into<String>) -> Self {
        Self {
            path,
            branch: branch.into(),
            created_at: Utc::now(),
            status: WorktreeStatus::Active,
        }
    }
}

#[derive(Debug, Clone)]
struct WorktreeEntry {
    project_path: PathBuf,
    info: WorktreeInfo,
}

/// git2-backed worktree manager.
///
/// Worktrees live under one root directory; each is registered at
/// creation so merge/revert/delete can find the owning repository.
/// Deletion falls back to on-disk discovery for worktrees the registry
/// has never seen (crash leftovers).
pub struct GitWorktrees {
    worktrees_root: PathBuf,
    registry: Mutex<HashMap<PathBuf, WorktreeEntry>>,
}

impl GitWorktrees {
    pub fn new(worktrees_root: PathBuf) -> Self {
        Self {
            worktrees_root,
            registry: Mutex::new(HashMap::new()),
        }
    }

    pub fn worktrees_root(&self) -> &Path {
        &self.worktrees_root
    }

    /// Registered lifecycle record for a worktree, if any.
    pub async fn info(&self, worktree: &Path) -> Option<WorktreeInfo> {
        self.registry
            .lock()
            .await
            .get(worktree)
            .map(|entry| entry.info.clone())
    }

    fn open_project(path: &Path) -> Result<Repository> {
        Ok(Repository::discover(path)?)
    }

    fn commit_all(worktree: &Path, message: &str) -> Result<()> {
        mlog_debug!(
            "GitWorktrees::commit_all path={} message={}",
            worktree.display(),
            message
        );
        let repo = Repository::open(worktree)?;
        let mut index = repo.index()?;
        index.add_all(["."].iter(), IndexAddOption::DEFAULT, None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let sig = repo
            .signature()
            .or_else(|_| Signature::now("Midnight", "midnight@localhost"))?;

        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(e) if e.code() == ErrorCode::UnbornBranch => None,
            Err(e) => return Err(e.into()),
        };

        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        mlog_debug!("Commit created: {}", commit_id);
        Ok(())
    }

    /// Merge an attempt branch into the project's current branch.
    /// Fast-forwards when possible, otherwise creates a merge commit.
    fn merge_branch(project_path: &Path, branch: &str) -> Result<()> {
        let repo = Self::open_project(project_path)?;
        let branch_ref = repo.find_branch(branch, BranchType::Local)?;
        let annotated = repo.reference_to_annotated_commit(branch_ref.get())?;
        let (analysis, _) = repo.merge_analysis(&[&annotated])?;

        if analysis.is_up_to_date() {
            mlog_debug!("merge_branch: {} already up to date", branch);
            return Ok(());
        }

        if analysis.is_fast_forward() {
            let head = repo.head()?;
            let refname = head
                .name()
                .ok_or_else(|| Error::Validation("project HEAD has no refname".to_string()))?
                .to_string();
            drop(head);
            repo.reference(
                &refname,
                annotated.id(),
                true,
                &format!("midnight: fast-forward to {}", branch),
            )?;
            repo.set_head(&refname)?;
            repo.checkout_head(Some(git2::build::CheckoutBuilder::default().force()))?;
            mlog_debug!("merge_branch: fast-forwarded to {}", branch);
            return Ok(());
        }

        repo.merge(&[&annotated], None, None)?;
        let mut index = repo.index()?;
        if index.has_conflicts() {
            repo.cleanup_state()?;
            return Err(Error::Validation(format!(
                "merge of {} produced conflicts",
                branch
            )));
        }
        let tree_id = index.write_tree_to(&repo)?;
        let tree = repo.find_tree(tree_id)?;
        let sig = repo
            .signature()
            .or_else(|_| Signature::now("Midnight", "midnight@localhost"))?;
        let head_commit = repo.head()?.peel_to_commit()?;
        let branch_commit = repo.find_commit(annotated.id())?;
        repo.commit(
            Some("HEAD"),
            &sig,
            &sig,
            &format!("Merge {}", branch),
            &tree,
            &[&head_commit, &branch_commit],
        )?;
        repo.cleanup_state()?;
        repo.checkout_head(Some(git2::build::CheckoutBuilder::default().force()))?;
        mlog_debug!("merge_branch: merge commit created for {}", branch);
        Ok(())
    }

    /// Remove a worktree and all its bookkeeping.
    ///
    /// Attempts cleanup even if individual steps fail. Fully
    /// disassociating the branch from the worktree matters: a stale
    /// `.git/worktrees/<name>` admin dir makes git believe the branch
    /// is still checked out.
    fn remove_worktree(project_path: &Path, worktree_path: &Path) -> Result<()> {
        mlog_debug!(
            "GitWorktrees::remove_worktree path={}",
            worktree_path.display()
        );
        let repo = Self::open_project(project_path)?;
        let worktrees = repo.worktrees()?;

        // Resolve the worktree name by path, falling back to the
        // folder name (path canonicalization can differ).
        let folder_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|s| s.to_string());
        let worktree_name: Option<String> = worktrees
            .iter()
            .flatten()
            .find(|name| {
                repo.find_worktree(name)
                    .map(|wt| wt.path() == worktree_path)
                    .unwrap_or(false)
            })
            .map(|s| s.to_string())
            .or_else(|| {
                folder_name.as_ref().and_then(|fname| {
                    worktrees
                        .iter()
                        .flatten()
                        .find(|name| *name == fname.as_str())
                        .map(|s| s.to_string())
                })
            });

        if let Some(ref name) = worktree_name {
            if let Ok(worktree) = repo.find_worktree(name) {
                let _ = worktree.unlock();
                let prune_result = worktree.prune(Some(
                    git2::WorktreePruneOptions::new()
                        .valid(true)
                        .working_tree(true)
                        .locked(true),
                ));
                if let Err(e) = prune_result {
                    mlog_warn!("Worktree prune failed for '{}': {}", name, e);
                }
            }
        }

        if worktree_path.exists() {
            std::fs::remove_dir_all(worktree_path)?;
        }

        // Clean the admin dir by both resolved and folder name.
        let git_dir = repo.path().to_path_buf();
        for name in [worktree_name.as_ref(), folder_name.as_ref()]
            .into_iter()
            .flatten()
        {
            let admin_dir = git_dir.join("worktrees").join(name);
            if admin_dir.exists() {
                mlog_debug!("Cleaning worktree admin dir: {}", admin_dir.display());
                let _ = std::fs::remove_dir_all(&admin_dir);
            }
        }

        // Prune any other stale references while we are here.
        drop(repo);
        if let Ok(repo) = Self::open_project(project_path) {
            if let Ok(worktrees) = repo.worktrees() {
                for name in worktrees.iter().flatten() {
                    if let Ok(wt) = repo.find_worktree(name) {
                        if !wt.path().exists() {
                            mlog_debug!("Pruning stale worktree reference: {}", name);
                            let _ = wt.prune(Some(
                                git2::WorktreePruneOptions::new()
                                    .valid(true)
                                    .working_tree(true)
                                    .locked(true),
                            ));
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Delete a local branch. Ok even if the branch doesn't exist;
    /// other failures are logged, not propagated; the worktree being
    /// gone is what matters.
    fn delete_branch(project_path: &Path, branch: &str) {
        let Ok(repo) = Self::open_project(project_path) else {
            return;
        };
        match repo.find_branch(branch, BranchType::Local) {
            Ok(mut branch_ref) => {
                if let Err(e) = branch_ref.delete() {
                    mlog_warn!("Failed to delete branch '{}': {}", branch, e);
                }
            }
            Err(e) if e.code() == ErrorCode::NotFound => {}
            Err(e) => {
                mlog_warn!("Error looking up branch '{}': {}", branch, e);
            }
        };
    }

    /// Remove worktrees of a project that are not registered to any
    /// in-flight attempt. Safe to call on startup: a crashed daemon's
    /// leftovers hold no uncommitted state anyone depends on.
    ///
    /// Returns the paths removed.
    pub async fn cleanup_orphans(&self, project_path: &Path) -> Result<Vec<PathBuf>> {
        let registry = self.registry.lock().await;
        let repo = Self::open_project(project_path)?;
        let mut removed = Vec::new();

        for name in repo.worktrees()?.iter().flatten() {
            let Ok(wt) = repo.find_worktree(name) else {
                continue;
            };
            let path = wt.path().to_path_buf();
            let ours = path.starts_with(&self.worktrees_root);
            if !ours || registry.contains_key(&path) {
                continue;
            }
            mlog_debug!("cleanup_orphans: removing {}", path.display());
            Self::remove_worktree(project_path, &path)?;
            Self::delete_branch(project_path, name);
            removed.push(path);
        }
        Ok(removed)
    }
}

#[async_trait]
impl WorktreeManager for GitWorktrees {
    async fn create(&self, project_path: &Path, branch: &str) -> Result<PathBuf> {
        mlog_debug!(
            "GitWorktrees::create project={} branch={}",
            project_path.display(),
            branch
        );
        // Worktree folder name doubles as the worktree name (branch
        // names may contain slashes).
        let worktree_name = branch.replace('/', "-");
        let worktree_path = self.worktrees_root.join(&worktree_name);

        // git2 handles are not Send; finish all repository work before
        // the registry lock is awaited.
        {
            let repo = Self::open_project(project_path)?;
            let head = repo.head()?;
            let commit = head.peel_to_commit()?;
            // Force: a crashed previous attempt may have left the branch.
            let branch_obj = repo.branch(branch, &commit, true)?;
            let branch_ref = branch_obj.into_reference();
            let mut opts = git2::WorktreeAddOptions::new();
            opts.reference(Some(&branch_ref));
            std::fs::create_dir_all(&self.worktrees_root)?;
            repo.worktree(&worktree_name, &worktree_path, Some(&opts))?;
        }

        self.registry.lock().await.insert(
            worktree_path.clone(),
            WorktreeEntry {
                project_path: project_path.to_path_buf(),
                info: WorktreeInfo::new(worktree_path.clone(), branch),
            },
        );
        Ok(worktree_path)
    }

    async fn diff(&self, worktree: &Path) -> Result<String> {
        let repo = Repository::open(worktree)?;
        let head_tree = repo.head()?.peel_to_tree()?;
        let mut opts = DiffOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .show_untracked_content(true);
        let diff = repo.diff_tree_to_workdir_with_index(Some(&head_tree), Some(&mut opts))?;

        let mut text = String::new();
        diff.print(DiffFormat::Patch, |_delta, _hunk, line| {
            match line.origin() {
                '+' | '-' | ' ' => text.push(line.origin()),
                _ => {}
            }
            text.push_str(std::str::from_utf8(line.content()).unwrap_or(""));
            true
        })?;
        Ok(text)
    }

    async fn merge(&self, worktree: &Path) -> Result<()> {
        let entry = {
            let registry = self.registry.lock().await;
            registry
                .get(worktree)
                .cloned()
                .ok_or_else(|| Error::Validation(format!(
                    "unregistered worktree: {}",
                    worktree.display()
                )))?
        };
        Self::commit_all(worktree, &format!("midnight: {}", entry.info.branch))?;
        Self::merge_branch(&entry.project_path, &entry.info.branch)?;
        if let Some(entry) = self.registry.lock().await.get_mut(worktree) {
            entry.info.status = WorktreeStatus::Merged;
        }
        Ok(())
    }

    async fn revert(&self, worktree: &Path) -> Result<()> {
        mlog_debug!("GitWorktrees::revert path={}", worktree.display());
        {
            let repo = Repository::open(worktree)?;
            let head = repo.head()?.peel_to_commit()?;
            repo.reset(head.as_object(), ResetType::Hard, None)?;
        }
        if let Some(entry) = self.registry.lock().await.get_mut(worktree) {
            entry.info.status = WorktreeStatus::Abandoned;
        }
        Ok(())
    }

    async fn delete(&self, worktree: &Path) -> Result<()> {
        let entry = self.registry.lock().await.remove(worktree);
        match entry {
            Some(entry) => {
                Self::remove_worktree(&entry.project_path, worktree)?;
                Self::delete_branch(&entry.project_path, &entry.info.branch);
                Ok(())
            }
            None => {
                // Crash leftover: discover the owning repository through
                // the worktree's own gitlink before removing it.
                if let Ok(repo) = Repository::open(worktree) {
                    // .git/worktrees/<name> -> .git -> project
                    let admin = repo.path().to_path_buf();
                    drop(repo);
                    if let Some(project_git) = admin.parent().and_then(|p| p.parent()) {
                        if let Some(project) = project_git.parent() {
                            return Self::remove_worktree(project, worktree);
                        }
                    }
                }
                if worktree.exists() {
                    std::fs::remove_dir_all(worktree)?;
                }
                Ok(())
            }
        }
    }
}
