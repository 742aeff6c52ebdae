//! Hosting-CLI operations (`gh`), §4.1: repo metadata, PR listing, PR
//! creation. Built on the same [`super::exec::run_gh`] primitive as the git
//! operations in [`super::git`], parsing `gh`'s `--json` output instead of
//! porcelain text.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

use super::exec::{run_gh, NETWORK_TIMEOUT};
use super::types::{CheckConclusion, PrRecord, ReviewDecision};

#[derive(Debug, Deserialize)]
struct RepoViewJson {
    #[serde(rename = "nameWithOwner")]
    name_with_owner: String,
}

/// Repo id detection step (1): the hosting CLI's own `nameWithOwner`.
pub fn repo_name_with_owner(repo_dir: &Path) -> Option<String> {
    let out = run_gh(
        repo_dir,
        &["repo", "view", "--json", "nameWithOwner"],
        NETWORK_TIMEOUT,
    )
    .ok()?;
    serde_json::from_str::<RepoViewJson>(&out)
        .ok()
        .map(|v| v.name_with_owner)
}

/// `origin/HEAD` fallback step (2): the hosting CLI's default-branch query.
pub fn default_branch_query(repo_dir: &Path) -> Option<String> {
    #[derive(Deserialize)]
    struct Json {
        #[serde(rename = "defaultBranchRef")]
        default_branch_ref: Option<BranchRef>,
    }
    #[derive(Deserialize)]
    struct BranchRef {
        name: String,
    }
    let out = run_gh(
        repo_dir,
        &["repo", "view", "--json", "defaultBranchRef"],
        NETWORK_TIMEOUT,
    )
    .ok()?;
    serde_json::from_str::<Json>(&out)
        .ok()
        .and_then(|v| v.default_branch_ref)
        .map(|b| b.name)
}

const PR_LIST_FIELDS: &str = "number,title,state,url,headRefName,isDraft,labels,assignees,reviewDecision,statusCheckRollup,additions,deletions,changedFiles";

#[derive(Debug, Deserialize)]
struct GhPr {
    number: u64,
    title: String,
    state: String,
    url: String,
    #[serde(rename = "headRefName")]
    head_ref_name: String,
    #[serde(rename = "isDraft")]
    is_draft: bool,
    #[serde(default)]
    labels: Vec<GhLabel>,
    #[serde(default)]
    assignees: Vec<GhAssignee>,
    #[serde(rename = "reviewDecision")]
    review_decision: Option<String>,
    #[serde(rename = "statusCheckRollup", default)]
    status_check_rollup: Vec<GhCheck>,
    #[serde(default)]
    additions: u64,
    #[serde(default)]
    deletions: u64,
    #[serde(rename = "changedFiles", default)]
    changed_files: u64,
}

#[derive(Debug, Deserialize)]
struct GhLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct GhAssignee {
    login: String,
}

#[derive(Debug, Deserialize)]
struct GhCheck {
    conclusion: Option<String>,
    status: Option<String>,
}

/// Lists PRs for the current repo with the field set from §4.1.
pub fn list_prs(repo_dir: &Path) -> Result<Vec<PrRecord>, CoreError> {
    let out = run_gh(
        repo_dir,
        &["pr", "list", "--state", "all", "--json", PR_LIST_FIELDS],
        NETWORK_TIMEOUT,
    )?;
    let raw: Vec<GhPr> = serde_json::from_str(&out)
        .map_err(|e| CoreError::internal(format!("failed to parse `gh pr list` output: {e}")))?;

    Ok(raw.into_iter().map(pr_record_from_gh).collect())
}

fn pr_record_from_gh(pr: GhPr) -> PrRecord {
    let review_decision = pr.review_decision.as_deref().and_then(|s| match s {
        "APPROVED" => Some(ReviewDecision::Approved),
        "CHANGES_REQUESTED" => Some(ReviewDecision::ChangesRequested),
        "REVIEW_REQUIRED" => Some(ReviewDecision::ReviewRequired),
        _ => None,
    });

    let check_conclusion = rollup_conclusion(&pr.status_check_rollup);

    PrRecord {
        number: pr.number,
        title: pr.title,
        state: pr.state,
        url: pr.url,
        branch: pr.head_ref_name,
        draft: pr.is_draft,
        labels: pr.labels.into_iter().map(|l| l.name).collect(),
        assignees: pr.assignees.into_iter().map(|a| a.login).collect(),
        review_decision,
        check_conclusion,
        additions: pr.additions,
        deletions: pr.deletions,
        changed_files: pr.changed_files,
    }
}

/// Rolls up a list of per-check statuses into one conclusion: any failure
/// wins, then any still-pending check, else success — §4.4's badge rule
/// ("CI rollup conclusion").
fn rollup_conclusion(checks: &[GhCheck]) -> Option<CheckConclusion> {
    if checks.is_empty() {
        return None;
    }
    let mut any_pending = false;
    for check in checks {
        match check.conclusion.as_deref() {
            Some("FAILURE") | Some("TIMED_OUT") | Some("CANCELLED") | Some("ERROR") => {
                return Some(CheckConclusion::Failure)
            }
            Some("SUCCESS") | Some("NEUTRAL") | Some("SKIPPED") => continue,
            _ => {
                if !matches!(check.status.as_deref(), Some("COMPLETED")) {
                    any_pending = true;
                }
            }
        }
    }
    Some(if any_pending {
        CheckConclusion::Pending
    } else {
        CheckConclusion::Success
    })
}

/// Finds an existing open PR for `branch`, if one exists — used by the tree
/// materializer's `createPrs` step to avoid duplicate PR creation.
pub fn find_pr_for_branch(repo_dir: &Path, branch: &str) -> Result<Option<PrRecord>, CoreError> {
    let out = run_gh(
        repo_dir,
        &[
            "pr",
            "list",
            "--head",
            branch,
            "--state",
            "all",
            "--json",
            PR_LIST_FIELDS,
        ],
        NETWORK_TIMEOUT,
    )?;
    let raw: Vec<GhPr> = serde_json::from_str(&out)
        .map_err(|e| CoreError::internal(format!("failed to parse `gh pr list` output: {e}")))?;
    Ok(raw.into_iter().next().map(pr_record_from_gh))
}

#[derive(Debug, Deserialize)]
struct GhPrCreateJson {
    url: String,
}

/// Creates a PR against `base` from the current branch, with title and body.
/// Returns the created PR's url.
pub fn create_pr(
    repo_dir: &Path,
    base: &str,
    title: &str,
    body: &str,
) -> Result<String, CoreError> {
    let out = run_gh(
        repo_dir,
        &[
            "pr", "create", "--base", base, "--title", title, "--body", body, "--json", "url",
        ],
        NETWORK_TIMEOUT,
    )?;
    if let Ok(parsed) = serde_json::from_str::<GhPrCreateJson>(&out) {
        return Ok(parsed.url);
    }
    Ok(out.trim().to_string())
}

#[derive(Debug, Clone, Serialize)]
pub struct RepoSummary {
    pub name_with_owner: String,
    pub description: Option<String>,
    pub default_branch: Option<String>,
    pub url: String,
}

const REPO_VIEW_FIELDS: &str = "nameWithOwner,description,defaultBranchRef,url";

#[derive(Deserialize)]
struct RepoViewFullJson {
    #[serde(rename = "nameWithOwner")]
    name_with_owner: String,
    description: Option<String>,
    #[serde(rename = "defaultBranchRef")]
    default_branch_ref: Option<DefaultBranchRef>,
    url: String,
}

#[derive(Deserialize)]
struct DefaultBranchRef {
    name: String,
}

impl From<RepoViewFullJson> for RepoSummary {
    fn from(v: RepoViewFullJson) -> Self {
        RepoSummary {
            name_with_owner: v.name_with_owner,
            description: v.description,
            default_branch: v.default_branch_ref.map(|b| b.name),
            url: v.url,
        }
    }
}

/// `GET /repos/:owner/:name` metadata, §6, when called from inside a
/// checkout that already has `origin` pointed at the repo.
pub fn repo_metadata(repo_dir: &Path) -> Result<RepoSummary, CoreError> {
    let out = run_gh(repo_dir, &["repo", "view", "--json", REPO_VIEW_FIELDS], NETWORK_TIMEOUT)?;
    let parsed: RepoViewFullJson = serde_json::from_str(&out)
        .map_err(|e| CoreError::internal(format!("failed to parse `gh repo view` output: {e}")))?;
    Ok(parsed.into())
}

/// `GET /repos/:owner/:name` metadata by slug, for callers with no local
/// checkout to run `gh` from (the hosting CLI accepts an explicit
/// `OWNER/NAME` argument in place of inferring the repo from `cwd`).
pub fn repo_metadata_by_slug(cwd: &Path, owner: &str, name: &str) -> Result<RepoSummary, CoreError> {
    let slug = format!("{owner}/{name}");
    let out = run_gh(cwd, &["repo", "view", &slug, "--json", REPO_VIEW_FIELDS], NETWORK_TIMEOUT)?;
    let parsed: RepoViewFullJson = serde_json::from_str(&out)
        .map_err(|e| CoreError::internal(format!("failed to parse `gh repo view` output: {e}")))?;
    Ok(parsed.into())
}

#[derive(Deserialize)]
struct RepoListEntryJson {
    #[serde(rename = "nameWithOwner")]
    name_with_owner: String,
    description: Option<String>,
    url: String,
}

/// `GET /repos`, §6: the hosting CLI's listing of repos visible to the
/// authenticated account, cached for 5 minutes by the caller. `gh repo
/// list`'s JSON fields don't include the default branch, unlike `repo
/// view`; the listing endpoint leaves it unset rather than issuing one
/// `repo view` per row.
pub fn list_repos(cwd: &Path) -> Result<Vec<RepoSummary>, CoreError> {
    let out = run_gh(
        cwd,
        &["repo", "list", "--json", "nameWithOwner,description,url", "--limit", "200"],
        NETWORK_TIMEOUT,
    )?;
    let parsed: Vec<RepoListEntryJson> = serde_json::from_str(&out)
        .map_err(|e| CoreError::internal(format!("failed to parse `gh repo list` output: {e}")))?;
    Ok(parsed
        .into_iter()
        .map(|v| RepoSummary {
            name_with_owner: v.name_with_owner,
            description: v.description,
            default_branch: None,
            url: v.url,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollup_prefers_failure_over_pending_over_success() {
        let failing = vec![
            GhCheck { conclusion: Some("SUCCESS".into()), status: Some("COMPLETED".into()) },
            GhCheck { conclusion: Some("FAILURE".into()), status: Some("COMPLETED".into()) },
        ];
        assert_eq!(rollup_conclusion(&failing), Some(CheckConclusion::Failure));

        let pending = vec![
            GhCheck { conclusion: None, status: Some("IN_PROGRESS".into()) },
            GhCheck { conclusion: Some("SUCCESS".into()), status: Some("COMPLETED".into()) },
        ];
        assert_eq!(rollup_conclusion(&pending), Some(CheckConclusion::Pending));

        let passing = vec![GhCheck { conclusion: Some("SUCCESS".into()), status: Some("COMPLETED".into()) }];
        assert_eq!(rollup_conclusion(&passing), Some(CheckConclusion::Success));

        assert_eq!(rollup_conclusion(&[]), None);
    }
}
