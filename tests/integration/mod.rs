//! Integration test suite for Midnight.
//!
//! These tests exercise the full pipeline from project DNA to merged
//! commits, using real temporary git repositories and a scripted
//! completion backend. No network, no real model calls.
//!
//! # Test Categories
//!
//! - `worktree_lifecycle`: Worktree create/diff/merge/revert/delete
//! - `pipeline_e2e`: DNA intake through Actor/Sentinel to merge
//! - `recovery`: Crash leftovers, cooldowns and the append-only log

mod fixtures;

mod pipeline_e2e;
mod recovery;
mod worktree_lifecycle;
