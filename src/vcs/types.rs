//! Typed records returned by the VCS adapter. Kept separate from the
//! scanner's snapshot types in [`crate::scanner`] since the adapter's job is
//! only to parse subprocess output, not to infer structure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchRecord {
    pub name: String,
    pub commit: String,
    pub last_commit_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorktreeRecord {
    pub path: String,
    pub branch: Option<String>,
    pub commit: String,
    pub dirty: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AheadBehind {
    pub ahead: u32,
    pub behind: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approved,
    ChangesRequested,
    ReviewRequired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckConclusion {
    Success,
    Failure,
    Pending,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrRecord {
    pub number: u64,
    pub title: String,
    pub state: String,
    pub url: String,
    pub branch: String,
    pub draft: bool,
    pub labels: Vec<String>,
    pub assignees: Vec<String>,
    pub review_decision: Option<ReviewDecision>,
    pub check_conclusion: Option<CheckConclusion>,
    pub additions: u64,
    pub deletions: u64,
    pub changed_files: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heartbeat {
    pub updated_at: DateTime<Utc>,
    pub agent: Option<String>,
}
