//! Scanner (C4, §4.4): composes the VCS adapter (C1) and the store (C3) into
//! an ephemeral [`ScanSnapshot`] — nodes, inferred edges, badges, warnings.
//! A scan is read-only; multiple concurrent scans against the same repo are
//! safe.
//!
//! Grounded on `src/serve_session.rs::check_tree_freshness`/`validate_tree`'s
//! snapshot-then-diff shape, and the per-branch ahead/behind fan-out uses
//! `rayon` the way every pack example's Cargo.toml brings it in.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::broadcast::{Broadcaster, Event};
use crate::error::{CoreError, CoreResult};
use crate::store::types::BranchNamingRule;
use crate::store::Store;
use crate::vcs::{self, AheadBehind, BranchRecord, CheckConclusion, PrRecord, ReviewDecision, WorktreeRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Badge {
    Dirty,
    Active,
    Pr,
    PrMerged,
    Draft,
    CiFail,
    CiPass,
    Approved,
    ChangesRequested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeEdge {
    pub parent: String,
    pub child: String,
    pub confidence: Confidence,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_designed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeNode {
    pub branch_name: String,
    pub badges: Vec<Badge>,
    pub last_commit_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr: Option<PrRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worktree: Option<WorktreeRecord>,
    pub ahead_behind: AheadBehind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningSeverity {
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WarningCode {
    #[serde(rename = "BEHIND_PARENT")]
    BehindParent,
    #[serde(rename = "DIRTY")]
    Dirty,
    #[serde(rename = "CI_FAIL")]
    CiFail,
    #[serde(rename = "BRANCH_NAMING_VIOLATION")]
    BranchNamingViolation,
    #[serde(rename = "TREE_DIVERGENCE")]
    TreeDivergence,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Warning {
    pub severity: WarningSeverity,
    pub code: WarningCode,
    pub message: String,
    pub meta: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSnapshot {
    pub repo_id: String,
    pub default_branch: String,
    pub branches: Vec<BranchRecord>,
    pub nodes: Vec<TreeNode>,
    pub edges: Vec<TreeEdge>,
    pub warnings: Vec<Warning>,
    pub worktrees: Vec<WorktreeRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_naming_rule: Option<BranchNamingRule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tree_spec: Option<crate::store::types::TreeSpec>,
}

/// Expands a leading `~` to the user's home directory, per §4.4 step 1.
pub fn expand_path(local_path: &str) -> CoreResult<PathBuf> {
    if let Some(rest) = local_path.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| CoreError::bad_request("cannot resolve '~': no home directory"))?;
        return Ok(home.join(rest));
    }
    if local_path == "~" {
        return dirs::home_dir().ok_or_else(|| CoreError::bad_request("cannot resolve '~': no home directory"));
    }
    Ok(PathBuf::from(local_path))
}

/// Performs a full scan of the repo at `local_path`, broadcasting the result
/// and returning it.
pub fn scan(store: &Store, broadcaster: &Broadcaster, local_path: &str) -> CoreResult<ScanSnapshot> {
    let path = expand_path(local_path)?;
    if !path.exists() {
        return Err(CoreError::bad_request(format!("path does not exist: {}", path.display())));
    }

    let repo_id = vcs::resolve_repo_id(&path);
    let branches = vcs::git::list_branches(&path)?;

    let pins = store.get_repo_pins(&repo_id);
    let default_branch = pins
        .as_ref()
        .and_then(|p| p.base_branch_override.clone())
        .filter(|base| branches.iter().any(|b| &b.name == base))
        .unwrap_or_else(|| vcs::resolve_default_branch(&path, &branches));

    let worktrees = vcs::git::list_worktrees(&path)?;
    let prs = vcs::gh::list_prs(&path).unwrap_or_default();
    let branch_naming_rule = store.get_branch_naming_rule(&repo_id);
    let tree_spec = store.get_tree_spec(&repo_id);

    let designed_edges = designed_edges_from_spec(tree_spec.as_ref());
    let edges = infer_edges(&branches, &default_branch, &designed_edges);

    let ahead_behind_by_branch: HashMap<String, AheadBehind> = branches
        .par_iter()
        .filter(|b| b.name != default_branch)
        .map(|b| {
            let ab = vcs::git::ahead_behind(&path, &default_branch, &b.name).unwrap_or_default();
            (b.name.clone(), ab)
        })
        .collect();

    let worktree_by_branch: HashMap<&str, &WorktreeRecord> = worktrees
        .iter()
        .filter_map(|w| w.branch.as_deref().map(|b| (b, w)))
        .collect();
    let pr_by_branch: HashMap<&str, &PrRecord> = prs.iter().map(|p| (p.branch.as_str(), p)).collect();

    let nodes: Vec<TreeNode> = branches
        .iter()
        .map(|b| {
            let worktree = worktree_by_branch.get(b.name.as_str()).cloned().cloned();
            let pr = pr_by_branch.get(b.name.as_str()).cloned().cloned();
            let ahead_behind = ahead_behind_by_branch.get(&b.name).copied().unwrap_or_default();
            let active = worktree
                .as_ref()
                .map(|w| vcs::worktree_is_active(Path::new(&w.path)))
                .unwrap_or(false);
            let badges = derive_badges(worktree.as_ref(), active, pr.as_ref());
            TreeNode {
                branch_name: b.name.clone(),
                badges,
                last_commit_at: b.last_commit_at,
                pr,
                worktree,
                ahead_behind,
            }
        })
        .collect();

    let naming_regex = branch_naming_rule
        .as_ref()
        .and_then(|rule| compile_naming_pattern(&rule.pattern).ok());

    let warnings = derive_warnings(
        &nodes,
        &edges,
        &default_branch,
        naming_regex.as_ref(),
        &designed_edges,
    );

    let restart = synthesize_restart_hint(&nodes, &warnings);

    let snapshot = ScanSnapshot {
        repo_id: repo_id.clone(),
        default_branch,
        branches,
        nodes,
        edges,
        warnings,
        worktrees,
        branch_naming_rule,
        restart,
        tree_spec,
    };

    broadcaster.broadcast(Event::scan_updated(&repo_id, &snapshot));

    Ok(snapshot)
}

fn designed_edges_from_spec(tree_spec: Option<&crate::store::types::TreeSpec>) -> HashMap<String, String> {
    let Some(spec) = tree_spec else { return HashMap::new() };
    // Designed edges overlay regardless of draft/confirmed/generated status (§8 property 2).
    let by_id: HashMap<_, _> = spec.nodes.iter().map(|n| (n.id, n)).collect();
    let mut edges = HashMap::new();
    for edge in &spec.edges {
        let (Some(parent), Some(child)) = (by_id.get(&edge.from), by_id.get(&edge.to)) else {
            continue;
        };
        if let (Some(parent_branch), Some(child_branch)) = (&parent.branch_name, &child.branch_name) {
            edges.insert(child_branch.clone(), parent_branch.clone());
        }
    }
    edges
}

/// Edge inference, §4.4 step 4: longest-prefix-match among sibling branches,
/// falling back to the default branch, overridden by any designed edge.
fn infer_edges(
    branches: &[BranchRecord],
    default_branch: &str,
    designed_edges: &HashMap<String, String>,
) -> Vec<TreeEdge> {
    let names: Vec<&str> = branches.iter().map(|b| b.name.as_str()).collect();

    branches
        .iter()
        .filter(|b| b.name != default_branch)
        .map(|b| {
            if let Some(designed_parent) = designed_edges.get(&b.name) {
                return TreeEdge {
                    parent: designed_parent.clone(),
                    child: b.name.clone(),
                    confidence: Confidence::High,
                    is_designed: true,
                };
            }

            let best_parent = names
                .iter()
                .filter(|&&other| other != b.name)
                .filter_map(|&other| {
                    b.name
                        .strip_prefix(other)
                        .filter(|rest| rest.starts_with('/') || rest.starts_with('-'))
                        .map(|_| other)
                })
                .max_by_key(|other| other.len());

            match best_parent {
                Some(parent) => TreeEdge {
                    parent: parent.to_string(),
                    child: b.name.clone(),
                    confidence: Confidence::High,
                    is_designed: false,
                },
                None => TreeEdge {
                    parent: default_branch.to_string(),
                    child: b.name.clone(),
                    confidence: Confidence::Low,
                    is_designed: false,
                },
            }
        })
        .collect()
}

fn derive_badges(worktree: Option<&WorktreeRecord>, active: bool, pr: Option<&PrRecord>) -> Vec<Badge> {
    let mut badges = Vec::new();
    if worktree.map(|w| w.dirty).unwrap_or(false) {
        badges.push(Badge::Dirty);
    }
    if active {
        badges.push(Badge::Active);
    }
    if let Some(pr) = pr {
        if pr.state.eq_ignore_ascii_case("merged") {
            badges.push(Badge::PrMerged);
        } else {
            badges.push(Badge::Pr);
        }
        if pr.draft {
            badges.push(Badge::Draft);
        }
        match pr.check_conclusion {
            Some(CheckConclusion::Success) => badges.push(Badge::CiPass),
            Some(CheckConclusion::Failure) => badges.push(Badge::CiFail),
            _ => {}
        }
        match pr.review_decision {
            Some(ReviewDecision::Approved) => badges.push(Badge::Approved),
            Some(ReviewDecision::ChangesRequested) => badges.push(Badge::ChangesRequested),
            _ => {}
        }
    }
    badges
}

/// Compiles a branch-naming pattern into a regex by substituting
/// `{planId}` → `\d+` and `{taskSlug}` → `[a-z0-9-]+`, §4.4 step 7.
fn compile_naming_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    let escaped = regex::escape(pattern);
    let with_task_slug = escaped.replace(&regex::escape("{taskSlug}"), "[a-z0-9-]+");
    let with_plan_id = with_task_slug.replace(&regex::escape("{planId}"), r"\d+");
    Regex::new(&format!("^{with_plan_id}$"))
}

fn derive_warnings(
    nodes: &[TreeNode],
    edges: &[TreeEdge],
    default_branch: &str,
    naming_regex: Option<&Regex>,
    designed_edges: &HashMap<String, String>,
) -> Vec<Warning> {
    let mut warnings = Vec::new();

    for node in nodes {
        let behind = node.ahead_behind.behind;
        if behind >= 1 {
            warnings.push(Warning {
                severity: if behind >= 5 { WarningSeverity::Error } else { WarningSeverity::Warn },
                code: WarningCode::BehindParent,
                message: format!("{} is {behind} commit(s) behind its parent", node.branch_name),
                meta: serde_json::json!({ "branch": node.branch_name, "behind": behind }),
            });
        }

        if node.worktree.as_ref().map(|w| w.dirty).unwrap_or(false) {
            warnings.push(Warning {
                severity: WarningSeverity::Warn,
                code: WarningCode::Dirty,
                message: format!("{} has uncommitted changes", node.branch_name),
                meta: serde_json::json!({ "branch": node.branch_name }),
            });
        }

        if let Some(pr) = &node.pr {
            if pr.check_conclusion == Some(CheckConclusion::Failure) {
                warnings.push(Warning {
                    severity: WarningSeverity::Error,
                    code: WarningCode::CiFail,
                    message: format!("PR #{} for {} is failing CI", pr.number, node.branch_name),
                    meta: serde_json::json!({ "branch": node.branch_name, "prNumber": pr.number }),
                });
            }
        }

        if node.branch_name != default_branch {
            if let Some(regex) = naming_regex {
                if !regex.is_match(&node.branch_name) {
                    warnings.push(Warning {
                        severity: WarningSeverity::Warn,
                        code: WarningCode::BranchNamingViolation,
                        message: format!("{} does not match the branch naming rule", node.branch_name),
                        meta: serde_json::json!({ "branch": node.branch_name }),
                    });
                }
            }
        }
    }

    let inferred: std::collections::HashSet<(&str, &str)> = edges
        .iter()
        .map(|e| (e.parent.as_str(), e.child.as_str()))
        .collect();
    for (child, parent) in designed_edges {
        if !inferred.contains(&(parent.as_str(), child.as_str())) {
            warnings.push(Warning {
                severity: WarningSeverity::Warn,
                code: WarningCode::TreeDivergence,
                message: format!("designed edge {parent} -> {child} has no matching branch in git"),
                meta: serde_json::json!({ "parent": parent, "child": child }),
            });
        }
    }

    warnings
}

/// Synthesizes a restart-hint markdown block, §4.4 step 8.
fn synthesize_restart_hint(nodes: &[TreeNode], warnings: &[Warning]) -> Option<String> {
    let active_node = nodes.iter().find(|n| n.badges.contains(&Badge::Active))?;
    restart_prompt_for_node(active_node, warnings)
}

/// `GET /scan/restart-prompt`, §6: the same markdown block as
/// [`synthesize_restart_hint`], but for a caller-chosen worktree rather than
/// whichever node happens to carry the `active` badge.
pub fn restart_prompt_for_worktree(
    nodes: &[TreeNode],
    warnings: &[Warning],
    worktree_path: &str,
) -> Option<String> {
    let node = nodes
        .iter()
        .find(|n| n.worktree.as_ref().map(|w| w.path.as_str()) == Some(worktree_path))?;
    restart_prompt_for_node(node, warnings)
}

fn restart_prompt_for_node(node: &TreeNode, warnings: &[Warning]) -> Option<String> {
    let worktree = node.worktree.as_ref()?;

    let mut action_items: Vec<&Warning> = warnings
        .iter()
        .filter(|w| w.meta.get("branch").and_then(|v| v.as_str()) == Some(&node.branch_name))
        .collect();
    action_items.truncate(3);

    let mut block = format!(
        "```\ncd {}\n```\n\n**Current state:** `{}` ({} ahead, {} behind)\n",
        worktree.path, node.branch_name, node.ahead_behind.ahead, node.ahead_behind.behind
    );

    if !action_items.is_empty() {
        block.push_str("\n**Action items:**\n");
        for item in action_items {
            block.push_str(&format!("- {}\n", item.message));
        }
    }

    Some(block)
}

/// Debug-only acyclic check: every non-default branch's child chain must
/// terminate without revisiting a node, §8's "edge uniqueness" invariant.
#[cfg(debug_assertions)]
pub fn assert_acyclic(edges: &[TreeEdge]) {
    let mut parent_of: HashMap<&str, &str> = HashMap::new();
    for edge in edges {
        parent_of.insert(edge.child.as_str(), edge.parent.as_str());
    }
    for start in parent_of.keys() {
        let mut seen = std::collections::HashSet::new();
        let mut current = *start;
        seen.insert(current);
        while let Some(&parent) = parent_of.get(current) {
            if !seen.insert(parent) {
                panic!("cycle detected in inferred tree edges at {parent}");
            }
            current = parent;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn branch(name: &str) -> BranchRecord {
        BranchRecord {
            name: name.to_string(),
            commit: "abc123".to_string(),
            last_commit_at: Utc::now(),
        }
    }

    #[test]
    fn infer_edges_picks_longest_prefix_match() {
        let branches = vec![branch("main"), branch("feat"), branch("feat-x"), branch("feat-x/sub")];
        let edges = infer_edges(&branches, "main", &HashMap::new());

        let edge_for = |child: &str| edges.iter().find(|e| e.child == child).unwrap();
        assert_eq!(edge_for("feat-x").parent, "feat");
        assert_eq!(edge_for("feat-x/sub").parent, "feat-x");
        assert_eq!(edge_for("feat").parent, "main");
        assert_eq!(edge_for("feat").confidence, Confidence::Low);
    }

    #[test]
    fn designed_edge_overrides_inferred_one() {
        let branches = vec![branch("main"), branch("feat-a"), branch("feat-a-sub")];
        let mut designed = HashMap::new();
        designed.insert("feat-a-sub".to_string(), "main".to_string());

        let edges = infer_edges(&branches, "main", &designed);
        let edge = edges.iter().find(|e| e.child == "feat-a-sub").unwrap();
        assert_eq!(edge.parent, "main");
        assert!(edge.is_designed);
    }

    #[test]
    fn naming_pattern_substitutes_placeholders() {
        let regex = compile_naming_pattern("task/{taskSlug}").unwrap();
        assert!(regex.is_match("task/fix-login-bug"));
        assert!(!regex.is_match("task/Fix_Login"));
    }

    #[test]
    fn behind_parent_severity_escalates_at_five() {
        let node = |behind: u32| TreeNode {
            branch_name: "feat/a".to_string(),
            badges: vec![],
            last_commit_at: Utc::now(),
            pr: None,
            worktree: None,
            ahead_behind: AheadBehind { ahead: 0, behind },
        };

        let warn = derive_warnings(&[node(2)], &[], "main", None, &HashMap::new());
        assert_eq!(warn[0].severity, WarningSeverity::Warn);

        let err = derive_warnings(&[node(5)], &[], "main", None, &HashMap::new());
        assert_eq!(err[0].severity, WarningSeverity::Error);
    }

    #[test]
    fn acyclic_assertion_passes_on_a_tree() {
        let edges = vec![
            TreeEdge { parent: "main".into(), child: "a".into(), confidence: Confidence::High, is_designed: false },
            TreeEdge { parent: "a".into(), child: "b".into(), confidence: Confidence::High, is_designed: false },
        ];
        assert_acyclic(&edges);
    }

    #[test]
    fn scan_snapshot_serialization_shape_is_stable() {
        let snapshot = ScanSnapshot {
            repo_id: "repo-1".to_string(),
            default_branch: "main".to_string(),
            branches: vec![],
            nodes: vec![],
            edges: vec![],
            warnings: vec![],
            worktrees: vec![],
            branch_naming_rule: None,
            restart: None,
            tree_spec: None,
        };

        insta::assert_json_snapshot!(snapshot, @r###"
        {
          "repo_id": "repo-1",
          "default_branch": "main",
          "branches": [],
          "nodes": [],
          "edges": [],
          "warnings": [],
          "worktrees": []
        }
        "###);
    }
}
