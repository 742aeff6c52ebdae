//! Row types for every table in §3. Kept as plain serde structs rather than
//! an ORM schema, matching the teacher's `src/syncback/meta.rs` style of a
//! hand-written struct per JSON document shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanningSessionStatus {
    Draft,
    Confirmed,
    Discarded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    Doing,
    Done,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNode {
    pub id: Uuid,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_session_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEdgeSpec {
    pub from: Uuid,
    pub to: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanningSession {
    pub id: Uuid,
    pub repo_id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,
    pub status: PlanningSessionStatus,
    pub nodes: Vec<TaskNode>,
    pub edges: Vec<TreeEdgeSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_session_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TreeSpecStatus {
    Draft,
    Confirmed,
    Generated,
}

/// The legacy tree spec, keyed by repo id, coexisting with planning
/// sessions per §3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeSpec {
    pub repo_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,
    pub status: TreeSpecStatus,
    pub nodes: Vec<TaskNode>,
    pub edges: Vec<TreeEdgeSpec>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchNamingRule {
    pub repo_id: String,
    pub pattern: String,
    pub description: String,
    pub examples: Vec<String>,
}

/// Per-repo worktree customization, consulted by the materializer in place
/// of the default `git worktree add` step (§4.6 step 3). Both scripts are
/// optional; either may be configured independently of the other.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorktreeRule {
    pub repo_id: String,
    /// Run in place of the default worktree-add, with `{worktreePath}`,
    /// `{branchName}`, `{localPath}` substituted in.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_script: Option<String>,
    /// Kicked off fire-and-forget inside the new worktree once it exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_creation_script: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalSessionStatus {
    Running,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalSessionRow {
    pub id: Uuid,
    pub repo_id: String,
    pub worktree_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub status: TerminalSessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_output: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatSessionStatus {
    Active,
    Archived,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: Uuid,
    pub worktree_path: String,
    pub branch_name: String,
    pub status: ChatSessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub chat_session_id: Uuid,
    pub role: ChatRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchLinkType {
    Issue,
    Pr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchLink {
    pub repo_id: String,
    pub branch_name: String,
    pub link_type: BranchLinkType,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checks: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reviewers: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalLinkType {
    Notion,
    Figma,
    GithubIssue,
    GithubPr,
    Url,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalLink {
    pub id: Uuid,
    pub planning_session_id: Uuid,
    pub url: String,
    pub link_type: ExternalLinkType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_cache: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_fetched_at: Option<DateTime<Utc>>,
}

/// The user's preferred base-branch override and related per-repo
/// settings, consulted by the scanner (§4.4 step 2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoPins {
    pub repo_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_branch_override: Option<String>,
}

/// Append-only audit row recorded for select mutating operations
/// (materialize, branch create/delete) — cascade-deleted with the branch it
/// names, per §4.3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstructionsLogRow {
    pub id: Uuid,
    pub repo_id: String,
    pub branch_name: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Freeform per-branch agent instructions, cascade-deleted with the branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInstruction {
    pub id: Uuid,
    pub repo_id: String,
    pub branch_name: String,
    pub content: String,
    pub updated_at: DateTime<Utc>,
}
