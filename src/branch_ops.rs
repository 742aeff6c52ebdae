//! Branch operations (C7, §4.7): safe checkout/pull/rebase/merge-parent/
//! push/delete/delete-worktree, each running preconditions, mutating via the
//! VCS adapter (C1), updating the store (C3), and invalidating the relevant
//! cache prefix.
//!
//! Grounded on `src/git.rs`'s subprocess patterns, reused here through
//! [`crate::vcs`] rather than re-implemented.

use std::path::Path;

use serde::Serialize;

use crate::broadcast::{Broadcaster, Event};
use crate::cache::Cache;
use crate::error::{CoreError, CoreResult};
use crate::store::Store;
use crate::vcs::git;
use crate::vcs::types::AheadBehind;

fn require_clean(repo_or_worktree: &Path) -> CoreResult<()> {
    if git::is_dirty(repo_or_worktree)? {
        return Err(CoreError::bad_request(format!(
            "{} has uncommitted changes",
            repo_or_worktree.display()
        )));
    }
    Ok(())
}

fn invalidate_repo_cache(cache: &Cache<AheadBehind>, repo_id: &str) {
    cache.invalidate_by_prefix(&format!("{repo_id}:"));
}

pub fn create_branch(
    store: &Store,
    broadcaster: &Broadcaster,
    cache: &Cache<AheadBehind>,
    repo_id: &str,
    repo_path: &Path,
    branch_name: &str,
    base_branch: &str,
) -> CoreResult<()> {
    git::validate_branch_name(branch_name)?;
    if git::branch_exists(repo_path, branch_name)? {
        return Err(CoreError::bad_request(format!("branch '{branch_name}' already exists")));
    }
    git::create_branch(repo_path, branch_name, base_branch)?;
    invalidate_repo_cache(cache, repo_id);
    broadcaster.broadcast(Event::branches_changed(repo_id));
    Ok(())
}

/// Worktree path is the branch name with `/` replaced by `-`, §4.7.
pub fn worktree_path_for_branch(worktrees_dir: &Path, branch_name: &str) -> std::path::PathBuf {
    worktrees_dir.join(branch_name.replace('/', "-"))
}

pub fn create_worktree_for_existing_branch(
    broadcaster: &Broadcaster,
    cache: &Cache<AheadBehind>,
    repo_id: &str,
    repo_path: &Path,
    worktrees_dir: &Path,
    branch_name: &str,
) -> CoreResult<std::path::PathBuf> {
    if !git::branch_exists(repo_path, branch_name)? {
        return Err(CoreError::bad_request(format!("branch '{branch_name}' does not exist")));
    }
    let worktree_path = worktree_path_for_branch(worktrees_dir, branch_name);
    if !worktree_path.exists() {
        git::worktree_add(repo_path, &worktree_path, branch_name)?;
    }
    invalidate_repo_cache(cache, repo_id);
    broadcaster.broadcast(Event::branches_changed(repo_id));
    Ok(worktree_path)
}

pub fn checkout(
    broadcaster: &Broadcaster,
    repo_id: &str,
    repo_path: &Path,
    branch_name: &str,
) -> CoreResult<()> {
    if !git::branch_exists(repo_path, branch_name)? {
        return Err(CoreError::bad_request(format!("branch '{branch_name}' does not exist")));
    }
    if git::current_branch(repo_path)?.as_deref() == Some(branch_name) {
        return Err(CoreError::bad_request(format!("already on '{branch_name}'")));
    }
    require_clean(repo_path)?;
    git::checkout(repo_path, branch_name)?;
    broadcaster.broadcast(Event::branches_changed(repo_id));
    Ok(())
}

/// Pulls `branch_name`, either directly (if checked out somewhere clean) or
/// via a fast-forward-only fetch into the local ref otherwise, §4.7.
pub fn pull(
    repo_path: &Path,
    worktree_path: Option<&Path>,
    branch_name: &str,
) -> CoreResult<String> {
    let main_branch = git::current_branch(repo_path)?;
    if main_branch.as_deref() == Some(branch_name) {
        require_clean(repo_path)?;
        return git::pull(repo_path);
    }
    if let Some(worktree_path) = worktree_path {
        if worktree_path.exists() {
            require_clean(worktree_path)?;
            return git::pull(worktree_path);
        }
    }

    if git::fetch_branch_ff(repo_path, branch_name)? {
        Ok(format!("fast-forwarded '{branch_name}' from origin"))
    } else {
        Err(CoreError::bad_request(
            "remote has diverged; checkout and merge manually".to_string(),
        ))
    }
}

fn resolve_checked_out_dir<'a>(
    repo_path: &'a Path,
    worktree_path: Option<&'a Path>,
    branch_name: &str,
) -> CoreResult<&'a Path> {
    if git::current_branch(repo_path)?.as_deref() == Some(branch_name) {
        return Ok(repo_path);
    }
    if let Some(wt) = worktree_path {
        if git::current_branch(wt)?.as_deref() == Some(branch_name) {
            return Ok(wt);
        }
    }
    Err(CoreError::bad_request(format!(
        "branch '{branch_name}' is not checked out in the repo or the given worktree"
    )))
}

pub fn rebase_onto_parent(
    cache: &Cache<AheadBehind>,
    repo_id: &str,
    repo_path: &Path,
    worktree_path: Option<&Path>,
    branch_name: &str,
    parent_branch: &str,
) -> CoreResult<()> {
    let dir = resolve_checked_out_dir(repo_path, worktree_path, branch_name)?;
    require_clean(dir)?;

    git::fetch(repo_path, parent_branch)?;
    let remote_parent = format!("origin/{parent_branch}");
    let onto = if git::remote_ref_exists(repo_path, &remote_parent) {
        remote_parent
    } else {
        parent_branch.to_string()
    };

    git::rebase_onto(dir, &onto)?;
    invalidate_repo_cache(cache, repo_id);
    Ok(())
}

pub fn merge_parent_in(
    cache: &Cache<AheadBehind>,
    repo_id: &str,
    repo_path: &Path,
    worktree_path: Option<&Path>,
    branch_name: &str,
    parent_branch: &str,
) -> CoreResult<()> {
    let dir = resolve_checked_out_dir(repo_path, worktree_path, branch_name)?;
    require_clean(dir)?;

    git::fetch(repo_path, parent_branch)?;
    let remote_parent = format!("origin/{parent_branch}");
    let from = if git::remote_ref_exists(repo_path, &remote_parent) {
        remote_parent
    } else {
        parent_branch.to_string()
    };

    git::merge_no_edit(dir, &from)?;
    invalidate_repo_cache(cache, repo_id);
    Ok(())
}

pub fn push(
    repo_path: &Path,
    worktree_path: Option<&Path>,
    branch_name: &str,
    force: bool,
) -> CoreResult<String> {
    let dir = resolve_checked_out_dir(repo_path, worktree_path, branch_name)?;
    git::push(dir, branch_name, force)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletableReason {
    BranchNotFound,
    CurrentlyCheckedOut,
    PushedToRemote,
    HasCommits,
    CheckFailed,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckDeletable {
    pub deletable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DeletableReason>,
}

/// `{deletable, reason}`, §4.7. `parent_branch` is resolved by the caller
/// from a tree-spec edge if present, else the spec's base branch, else
/// `main`/`master` (the scanner already knows how to do this resolution;
/// this function just needs the answer).
pub fn check_deletable(repo_path: &Path, branch_name: &str, parent_branch: &str) -> CheckDeletable {
    let exists = match git::branch_exists(repo_path, branch_name) {
        Ok(exists) => exists,
        Err(_) => {
            return CheckDeletable { deletable: false, reason: Some(DeletableReason::CheckFailed) }
        }
    };
    if !exists {
        return CheckDeletable { deletable: false, reason: Some(DeletableReason::BranchNotFound) };
    }

    match git::current_branch(repo_path) {
        Ok(Some(current)) if current == branch_name => {
            return CheckDeletable { deletable: false, reason: Some(DeletableReason::CurrentlyCheckedOut) }
        }
        Err(_) => return CheckDeletable { deletable: false, reason: Some(DeletableReason::CheckFailed) },
        _ => {}
    }

    if git::pushed_to_remote(repo_path, branch_name) {
        return CheckDeletable { deletable: false, reason: Some(DeletableReason::PushedToRemote) };
    }

    match git::log_count_between(repo_path, parent_branch, branch_name) {
        Ok(0) => CheckDeletable { deletable: true, reason: None },
        Ok(_) => CheckDeletable { deletable: false, reason: Some(DeletableReason::HasCommits) },
        Err(_) => CheckDeletable { deletable: false, reason: Some(DeletableReason::CheckFailed) },
    }
}

/// Deletes `branch_name`: normal/force delete, best-effort remote delete,
/// reparent-children, then cascade-delete dependent store rows. Cascade
/// failures are logged and swallowed — the branch delete has already
/// succeeded, §4.7/§7.
pub fn delete_branch(
    store: &Store,
    broadcaster: &Broadcaster,
    cache: &Cache<AheadBehind>,
    repo_id: &str,
    repo_path: &Path,
    branch_name: &str,
    force: bool,
) -> CoreResult<()> {
    if git::current_branch(repo_path)?.as_deref() == Some(branch_name) {
        return Err(CoreError::bad_request(format!(
            "cannot delete '{branch_name}': currently checked out"
        )));
    }

    git::delete_branch(repo_path, branch_name, force)?;
    git::delete_remote_branch_best_effort(repo_path, branch_name);

    store.reparent_children_on_branch_delete(repo_id, branch_name);

    if let Err(e) = store.cascade_delete_branch(repo_id, branch_name) {
        tracing::warn!(repo_id, branch_name, error = %e, "cascade delete failed after branch delete");
    }

    invalidate_repo_cache(cache, repo_id);
    broadcaster.broadcast(Event::branches_changed(repo_id));
    Ok(())
}

/// Deletes store rows whose `branchName` no longer exists among
/// `repo_path`'s local branches, §4.7.
pub fn cleanup_orphaned(store: &Store, repo_path: &Path, repo_id: &str) -> CoreResult<usize> {
    let live: Vec<String> = git::list_branches(repo_path)?.into_iter().map(|b| b.name).collect();
    store.cleanup_orphaned(repo_id, &live)
}

pub fn delete_worktree(
    broadcaster: &Broadcaster,
    cache: &Cache<AheadBehind>,
    repo_id: &str,
    repo_path: &Path,
    worktree_path: &Path,
) -> CoreResult<()> {
    if !worktree_path.exists() {
        return Err(CoreError::bad_request(format!(
            "worktree path does not exist: {}",
            worktree_path.display()
        )));
    }
    require_clean(worktree_path)?;
    git::worktree_remove(repo_path, worktree_path)?;
    invalidate_repo_cache(cache, repo_id);
    broadcaster.broadcast(Event::branches_changed(repo_id));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worktree_path_replaces_slashes_with_dashes() {
        let dir = Path::new("/repos/acme-worktrees");
        let path = worktree_path_for_branch(dir, "feat/login-bug");
        assert_eq!(path, Path::new("/repos/acme-worktrees/feat-login-bug"));
    }
}
