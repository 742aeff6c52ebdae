//! The VCS adapter (C1, §4.1): shells out to `git` and the hosting CLI
//! (`gh`) and parses their output into typed records. Stateless — every
//! function takes the directory to operate in and returns a record or a
//! [`CoreError`]; no adapter-level caching happens here (that's [`crate::cache`]'s
//! job, composed by the scanner).

pub mod exec;
pub mod gh;
pub mod git;
pub mod types;

use std::path::Path;

pub use types::{AheadBehind, BranchRecord, CheckConclusion, Heartbeat, PrRecord, ReviewDecision, WorktreeRecord};

/// Default branch resolution, §4.1: `origin/HEAD` → hosting CLI → name
/// heuristic → first branch / literal `main`.
pub fn resolve_default_branch(repo_dir: &Path, branches: &[BranchRecord]) -> String {
    if let Some(name) = git::default_branch_via_origin_head(repo_dir) {
        return name;
    }
    if let Some(name) = gh::default_branch_query(repo_dir) {
        return name;
    }
    git::default_branch_name_heuristic(branches).unwrap_or_else(|| "main".to_string())
}

/// Repo id detection, §4.1: hosting CLI `nameWithOwner` → remote URL parse →
/// `local/<basename>-<hash8>` (see DESIGN.md's Open Question 4 decision:
/// the hash suffix avoids collisions between same-named sibling checkouts).
pub fn resolve_repo_id(repo_dir: &Path) -> String {
    if let Some(id) = gh::repo_name_with_owner(repo_dir) {
        return id;
    }
    if let Some(id) = git::repo_id_from_remote_url(repo_dir) {
        return id;
    }
    git::local_repo_id(repo_dir)
}

/// Whether a worktree's most recent heartbeat file is fresh enough to count
/// as an active agent session, per the glossary's "active" definition.
pub fn worktree_is_active(worktree_path: &Path) -> bool {
    git::read_heartbeat(worktree_path)
        .map(|hb| git::heartbeat_is_active(&hb))
        .unwrap_or(false)
}

