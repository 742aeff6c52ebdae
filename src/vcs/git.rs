//! Git operations exposed by the VCS adapter (§4.1). Grounded on
//! `git.rs`'s `Command`-per-operation shape from the teacher repo, composed
//! here on top of the shared [`super::exec::run_git`] primitive instead of
//! each function building its own `Command`.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::CoreError;

use super::exec::{run_git, run_git_lenient, LOCAL_TIMEOUT, NETWORK_TIMEOUT, REBASE_TIMEOUT};
use super::types::{AheadBehind, BranchRecord, Heartbeat, WorktreeRecord};

/// Branch names accepted anywhere a caller supplies one. The adapter must
/// never trust user-supplied branch names (§4.1): this is enforced at the
/// request surface, but re-checked here as defense in depth.
pub static BRANCH_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9/_-]+$").unwrap());

pub fn validate_branch_name(name: &str) -> Result<(), CoreError> {
    if BRANCH_NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(CoreError::bad_request(format!(
            "invalid branch name '{name}': must match ^[A-Za-z0-9/_-]+$"
        )))
    }
}

/// Lists branches ordered by committer date descending, per §4.1.
pub fn list_branches(repo_dir: &Path) -> Result<Vec<BranchRecord>, CoreError> {
    let out = run_git(
        repo_dir,
        &[
            "for-each-ref",
            "--sort=-committerdate",
            "--format=%(refname:short)%00%(objectname)%00%(committerdate:iso-strict)",
            "refs/heads",
        ],
        LOCAL_TIMEOUT,
    )?;

    let mut branches = Vec::new();
    for line in out.lines() {
        let mut parts = line.splitn(3, '\0');
        let (Some(name), Some(commit), Some(date)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        let last_commit_at = parse_iso_strict(date).unwrap_or_else(Utc::now);
        branches.push(BranchRecord {
            name: name.to_string(),
            commit: commit.to_string(),
            last_commit_at,
        });
    }
    Ok(branches)
}

fn parse_iso_strict(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Lists worktrees via `worktree list --porcelain`, computing `dirty` with a
/// status probe per worktree.
pub fn list_worktrees(repo_dir: &Path) -> Result<Vec<WorktreeRecord>, CoreError> {
    let out = run_git(repo_dir, &["worktree", "list", "--porcelain"], LOCAL_TIMEOUT)?;

    let mut worktrees = Vec::new();
    let mut path: Option<String> = None;
    let mut branch: Option<String> = None;
    let mut commit: Option<String> = None;

    let flush = |path: &mut Option<String>,
                 branch: &mut Option<String>,
                 commit: &mut Option<String>,
                 out: &mut Vec<WorktreeRecord>| {
        if let Some(p) = path.take() {
            let dirty = is_dirty(Path::new(&p)).unwrap_or(false);
            out.push(WorktreeRecord {
                path: p,
                branch: branch.take(),
                commit: commit.take().unwrap_or_default(),
                dirty,
            });
        }
    };

    for line in out.lines() {
        if let Some(p) = line.strip_prefix("worktree ") {
            flush(&mut path, &mut branch, &mut commit, &mut worktrees);
            path = Some(p.to_string());
        } else if let Some(h) = line.strip_prefix("HEAD ") {
            commit = Some(h.to_string());
        } else if let Some(b) = line.strip_prefix("branch ") {
            branch = Some(b.trim_start_matches("refs/heads/").to_string());
        } else if line.is_empty() {
            flush(&mut path, &mut branch, &mut commit, &mut worktrees);
        }
    }
    flush(&mut path, &mut branch, &mut commit, &mut worktrees);

    Ok(worktrees)
}

/// Runs a status probe in `worktree_path` to determine dirtiness.
pub fn is_dirty(worktree_path: &Path) -> Result<bool, CoreError> {
    let out = run_git(worktree_path, &["status", "--porcelain"], LOCAL_TIMEOUT)?;
    Ok(!out.trim().is_empty())
}

/// Default branch resolution, §4.1 priority order (1)-(4). The hosting-CLI
/// lookup is performed by the caller (the adapter composes `git.rs` +
/// `gh.rs`); this function only implements the git-local parts of the
/// fallback chain, called with the hosting CLI's answer already attempted.
pub fn default_branch_via_origin_head(repo_dir: &Path) -> Option<String> {
    let out = run_git(
        repo_dir,
        &["symbolic-ref", "--short", "refs/remotes/origin/HEAD"],
        LOCAL_TIMEOUT,
    )
    .ok()?;
    out.trim()
        .strip_prefix("origin/")
        .map(|s| s.to_string())
        .or_else(|| Some(out.trim().to_string()))
        .filter(|s| !s.is_empty())
}

pub fn default_branch_name_heuristic(branches: &[BranchRecord]) -> Option<String> {
    for candidate in ["main", "master", "develop"] {
        if branches.iter().any(|b| b.name == candidate) {
            return Some(candidate.to_string());
        }
    }
    branches.first().map(|b| b.name.clone())
}

/// Ahead/behind of `branch` relative to `base`, via left-right rev-list.
pub fn ahead_behind(repo_dir: &Path, base: &str, branch: &str) -> Result<AheadBehind, CoreError> {
    let spec = format!("{base}...{branch}");
    let out = run_git(
        repo_dir,
        &["rev-list", "--left-right", "--count", &spec],
        LOCAL_TIMEOUT,
    )?;
    let mut parts = out.split_whitespace();
    let behind = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let ahead = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    Ok(AheadBehind { ahead, behind })
}

pub fn branch_exists(repo_dir: &Path, branch: &str) -> Result<bool, CoreError> {
    let out = run_git_lenient(
        repo_dir,
        &["show-ref", "--verify", "--quiet", &format!("refs/heads/{branch}")],
        LOCAL_TIMEOUT,
    )?;
    Ok(out.status_success)
}

pub fn current_branch(repo_dir: &Path) -> Result<Option<String>, CoreError> {
    let out = run_git_lenient(repo_dir, &["symbolic-ref", "--short", "-q", "HEAD"], LOCAL_TIMEOUT)?;
    if out.status_success {
        Ok(Some(out.stdout.trim().to_string()))
    } else {
        Ok(None)
    }
}

pub fn create_branch(repo_dir: &Path, branch: &str, base: &str) -> Result<(), CoreError> {
    run_git(repo_dir, &["branch", branch, base], LOCAL_TIMEOUT)?;
    Ok(())
}

pub fn delete_branch(repo_dir: &Path, branch: &str, force: bool) -> Result<(), CoreError> {
    let flag = if force { "-D" } else { "-d" };
    run_git(repo_dir, &["branch", flag, branch], LOCAL_TIMEOUT)?;
    Ok(())
}

pub fn delete_remote_branch_best_effort(repo_dir: &Path, branch: &str) {
    let _ = run_git(repo_dir, &["push", "origin", "--delete", branch], NETWORK_TIMEOUT);
}

pub fn worktree_add(repo_dir: &Path, worktree_path: &Path, branch: &str) -> Result<(), CoreError> {
    run_git(
        repo_dir,
        &["worktree", "add", &worktree_path.to_string_lossy(), branch],
        LOCAL_TIMEOUT,
    )?;
    Ok(())
}

pub fn worktree_remove(repo_dir: &Path, worktree_path: &Path) -> Result<(), CoreError> {
    run_git(
        repo_dir,
        &["worktree", "remove", &worktree_path.to_string_lossy()],
        LOCAL_TIMEOUT,
    )?;
    Ok(())
}

pub fn checkout(repo_dir: &Path, branch: &str) -> Result<(), CoreError> {
    run_git(repo_dir, &["checkout", branch], LOCAL_TIMEOUT)?;
    Ok(())
}

pub fn pull(dir: &Path) -> Result<String, CoreError> {
    run_git(dir, &["pull"], NETWORK_TIMEOUT)
}

/// Fast-forward-only fetch of `branch` into the local ref of the same name,
/// used by the "pull, but not checked out anywhere" path of §4.7.
pub fn fetch_branch_ff(repo_dir: &Path, branch: &str) -> Result<bool, CoreError> {
    let spec = format!("{branch}:{branch}");
    let out = run_git_lenient(repo_dir, &["fetch", "origin", &spec], NETWORK_TIMEOUT)?;
    Ok(out.status_success)
}

pub fn fetch(repo_dir: &Path, refspec: &str) -> Result<(), CoreError> {
    run_git(repo_dir, &["fetch", "origin", refspec], NETWORK_TIMEOUT)?;
    Ok(())
}

pub fn remote_ref_exists(repo_dir: &Path, refname: &str) -> bool {
    run_git(repo_dir, &["rev-parse", "--verify", "--quiet", refname], LOCAL_TIMEOUT)
        .map(|s| !s.trim().is_empty())
        .unwrap_or(false)
}

pub fn rebase_onto(dir: &Path, onto: &str) -> Result<(), CoreError> {
    let out = run_git_lenient(dir, &["rebase", onto], REBASE_TIMEOUT)?;
    if !out.status_success {
        let _ = run_git_lenient(dir, &["rebase", "--abort"], LOCAL_TIMEOUT);
        return Err(crate::error::subprocess_failure("git rebase", &out.stderr));
    }
    Ok(())
}

pub fn merge_no_edit(dir: &Path, from: &str) -> Result<(), CoreError> {
    let out = run_git_lenient(dir, &["merge", "--no-edit", from], REBASE_TIMEOUT)?;
    if !out.status_success {
        let _ = run_git_lenient(dir, &["merge", "--abort"], LOCAL_TIMEOUT);
        return Err(crate::error::subprocess_failure("git merge", &out.stderr));
    }
    Ok(())
}

pub fn push(dir: &Path, branch: &str, force_with_lease: bool) -> Result<String, CoreError> {
    let mut args = vec!["push"];
    if force_with_lease {
        args.push("--force-with-lease");
    }
    args.push("-u");
    args.push("origin");
    args.push(branch);
    run_git(dir, &args, NETWORK_TIMEOUT)
}

pub fn log_count_between(repo_dir: &Path, parent: &str, branch: &str) -> Result<usize, CoreError> {
    let spec = format!("{parent}..{branch}");
    let out = run_git(repo_dir, &["log", "--oneline", &spec], LOCAL_TIMEOUT)?;
    Ok(out.lines().filter(|l| !l.trim().is_empty()).count())
}

pub fn pushed_to_remote(repo_dir: &Path, branch: &str) -> bool {
    run_git(repo_dir, &["ls-remote", "--heads", "origin", branch], NETWORK_TIMEOUT)
        .map(|s| !s.trim().is_empty())
        .unwrap_or(false)
}

/// Repo id detection step (2): parses `[host][:/]owner/repo(.git)?` out of
/// `origin`'s URL.
pub fn repo_id_from_remote_url(repo_dir: &Path) -> Option<String> {
    let out = run_git(repo_dir, &["remote", "get-url", "origin"], LOCAL_TIMEOUT).ok()?;
    parse_owner_repo(out.trim())
}

fn parse_owner_repo(url: &str) -> Option<String> {
    static RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"[:/]([A-Za-z0-9_.-]+)/([A-Za-z0-9_.-]+?)(?:\.git)?/?$").unwrap());
    let caps = RE.captures(url)?;
    Some(format!("{}/{}", &caps[1], &caps[2]))
}

/// Reads `<worktreePath>/.vibetree/heartbeat.json` and reports whether the
/// worktree is "active" per the glossary (updated within the last 30s).
pub fn read_heartbeat(worktree_path: &Path) -> Option<Heartbeat> {
    let path = worktree_path.join(".vibetree").join("heartbeat.json");
    let contents = std::fs::read_to_string(path).ok()?;
    let value: serde_json::Value = serde_json::from_str(&contents).ok()?;
    let updated_at = value.get("updatedAt")?.as_str()?;
    let updated_at = DateTime::parse_from_rfc3339(updated_at)
        .ok()?
        .with_timezone(&Utc);
    let agent = value
        .get("agent")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    Some(Heartbeat { updated_at, agent })
}

pub const HEARTBEAT_FRESHNESS: Duration = Duration::from_secs(30);

pub fn heartbeat_is_active(heartbeat: &Heartbeat) -> bool {
    let age = Utc::now().signed_duration_since(heartbeat.updated_at);
    age.to_std().map(|d| d <= HEARTBEAT_FRESHNESS).unwrap_or(false)
}

/// `local/<basename>` repo id fallback (step 4), namespaced by a short hash
/// of the absolute path to avoid the collision the spec calls out (Open
/// Question 4).
pub fn local_repo_id(path: &Path) -> String {
    let abs = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let basename = abs
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "repo".to_string());
    let hash = short_hash(&abs.to_string_lossy());
    format!("local/{basename}-{hash}")
}

fn short_hash(s: &str) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    s.hash(&mut hasher);
    format!("{:08x}", (hasher.finish() & 0xFFFF_FFFF) as u32)
}

/// Hint used by [`crate::error::CoreError`] callers for "is this a git repo
/// at all" preflight checks, mirroring `git_repo_root` from the teacher.
pub fn repo_root(path: &Path) -> Option<std::path::PathBuf> {
    let out = run_git(path, &["rev-parse", "--show-toplevel"], LOCAL_TIMEOUT).ok()?;
    let trimmed = out.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(std::path::PathBuf::from(trimmed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_branch_names() {
        assert!(validate_branch_name("feat/a-b_1").is_ok());
        assert!(validate_branch_name("feat a").is_err());
        assert!(validate_branch_name("feat;rm -rf").is_err());
    }

    #[test]
    fn parses_owner_repo_from_ssh_and_https() {
        assert_eq!(
            parse_owner_repo("git@github.com:acme/widgets.git"),
            Some("acme/widgets".to_string())
        );
        assert_eq!(
            parse_owner_repo("https://github.com/acme/widgets"),
            Some("acme/widgets".to_string())
        );
    }

    #[test]
    fn default_branch_heuristic_prefers_main_then_master_then_develop() {
        let branches = |names: &[&str]| {
            names
                .iter()
                .map(|n| BranchRecord {
                    name: n.to_string(),
                    commit: "abc".into(),
                    last_commit_at: Utc::now(),
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(
            default_branch_name_heuristic(&branches(&["develop", "main", "master"])),
            Some("main".to_string())
        );
        assert_eq!(
            default_branch_name_heuristic(&branches(&["develop", "master"])),
            Some("master".to_string())
        );
        assert_eq!(
            default_branch_name_heuristic(&branches(&["feat/a"])),
            Some("feat/a".to_string())
        );
    }
}
