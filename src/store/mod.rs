//! Durable relational state (C3, §4.3): one row type per table in §3,
//! guarded by a single mutex and persisted to a JSON file on every mutation.
//!
//! Grounded on `src/syncback/meta.rs::upsert_meta_name`'s JSON-file
//! read-parse-merge-write pattern and
//! `src/serve_session.rs`'s `Arc<Mutex<RojoTree>>` ownership model — no
//! example repo's dependency stack carries a SQL engine, so "relational
//! persistence" here means a typed in-process document store rather than an
//! embedded database.

pub mod types;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

use types::{
    BranchLink, BranchNamingRule, ChatMessage, ChatSession, ChatSessionStatus,
    ExternalLink, InstructionsLogRow, PlanningSession, RepoPins, TaskInstruction,
    TerminalSessionRow, TerminalSessionStatus, TreeEdgeSpec, TreeSpec, WorktreeRule,
};

const STORE_FILE_NAME: &str = "store.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreData {
    #[serde(default)]
    planning_sessions: HashMap<Uuid, PlanningSession>,
    #[serde(default)]
    tree_specs: HashMap<String, TreeSpec>,
    #[serde(default)]
    branch_naming_rules: HashMap<String, BranchNamingRule>,
    #[serde(default)]
    worktree_rules: HashMap<String, WorktreeRule>,
    #[serde(default)]
    terminal_sessions: HashMap<Uuid, TerminalSessionRow>,
    #[serde(default)]
    chat_sessions: HashMap<Uuid, ChatSession>,
    #[serde(default)]
    chat_messages: HashMap<Uuid, ChatMessage>,
    #[serde(default)]
    branch_links: Vec<BranchLink>,
    #[serde(default)]
    external_links: HashMap<Uuid, ExternalLink>,
    #[serde(default)]
    repo_pins: HashMap<String, RepoPins>,
    #[serde(default)]
    instructions_log: Vec<InstructionsLogRow>,
    #[serde(default)]
    task_instructions: Vec<TaskInstruction>,
    /// Freeform per-repo documents for the CRUD surfaces that are
    /// "orthogonal to the coordination core" (§6): requirements, ai,
    /// system. Keyed by `"<table>/<repoId>"`.
    #[serde(default)]
    documents: HashMap<String, serde_json::Value>,
}

/// The store: one JSON file per repo's local checkout, at
/// `<repoLocalPath>/.vibetree/store.json`.
pub struct Store {
    path: PathBuf,
    data: Mutex<StoreData>,
}

impl Store {
    /// Opens (or creates) the store rooted at `repo_local_path`.
    pub fn open(repo_local_path: &Path) -> CoreResult<Self> {
        let dir = repo_local_path.join(".vibetree");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(STORE_FILE_NAME);

        let data = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            serde_json::from_str(&contents)
                .map_err(|e| CoreError::internal(format!("corrupt store file {path:?}: {e}")))?
        } else {
            StoreData::default()
        };

        let store = Store {
            path,
            data: Mutex::new(data),
        };
        // Server-restart semantics, §3: live PTYs don't survive, so every
        // persisted terminal session row resets to stopped on open.
        store.reset_terminal_sessions_on_open();
        Ok(store)
    }

    fn reset_terminal_sessions_on_open(&self) {
        let mut data = self.lock();
        for session in data.terminal_sessions.values_mut() {
            session.status = TerminalSessionStatus::Stopped;
            session.pid = None;
        }
        drop(data);
        let _ = self.persist();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreData> {
        self.data.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    fn persist(&self) -> CoreResult<()> {
        let data = self.lock();
        let json = serde_json::to_string_pretty(&*data)
            .map_err(|e| CoreError::internal(format!("failed to serialize store: {e}")))?;
        fs_err::write(&self.path, json)?;
        Ok(())
    }

    // ---- Planning sessions ----------------------------------------------

    pub fn upsert_planning_session(&self, mut session: PlanningSession) -> CoreResult<PlanningSession> {
        let mut data = self.lock();
        session.updated_at = Utc::now();
        if !data.planning_sessions.contains_key(&session.id) {
            session.created_at = session.updated_at;
        } else if let Some(existing) = data.planning_sessions.get(&session.id) {
            session.created_at = existing.created_at;
        }
        data.planning_sessions.insert(session.id, session.clone());
        drop(data);
        self.persist()?;
        Ok(session)
    }

    pub fn get_planning_session(&self, id: Uuid) -> Option<PlanningSession> {
        self.lock().planning_sessions.get(&id).cloned()
    }

    pub fn list_planning_sessions(&self, repo_id: &str) -> Vec<PlanningSession> {
        self.lock()
            .planning_sessions
            .values()
            .filter(|s| s.repo_id == repo_id)
            .cloned()
            .collect()
    }

    pub fn delete_planning_session(&self, id: Uuid) -> CoreResult<()> {
        self.lock().planning_sessions.remove(&id);
        self.persist()
    }

    // ---- Tree specs ------------------------------------------------------

    /// Atomic upsert, §4.3: the whole document is replaced under the lock in
    /// one step, never read-modify-write across separate calls.
    pub fn upsert_tree_spec(&self, mut spec: TreeSpec) -> CoreResult<TreeSpec> {
        let mut data = self.lock();
        let now = Utc::now();
        spec.updated_at = now;
        if !data.tree_specs.contains_key(&spec.repo_id) {
            spec.created_at = now;
        } else if let Some(existing) = data.tree_specs.get(&spec.repo_id) {
            spec.created_at = existing.created_at;
        }
        data.tree_specs.insert(spec.repo_id.clone(), spec.clone());
        drop(data);
        self.persist()?;
        Ok(spec)
    }

    pub fn get_tree_spec(&self, repo_id: &str) -> Option<TreeSpec> {
        self.lock().tree_specs.get(repo_id).cloned()
    }

    pub fn mark_tree_spec_generated(&self, repo_id: &str) -> CoreResult<()> {
        let mut data = self.lock();
        if let Some(spec) = data.tree_specs.get_mut(repo_id) {
            spec.status = types::TreeSpecStatus::Generated;
            spec.updated_at = Utc::now();
        }
        drop(data);
        self.persist()
    }

    // ---- Branch naming rules ---------------------------------------------

    pub fn get_branch_naming_rule(&self, repo_id: &str) -> Option<BranchNamingRule> {
        self.lock().branch_naming_rules.get(repo_id).cloned()
    }

    pub fn set_branch_naming_rule(&self, rule: BranchNamingRule) -> CoreResult<()> {
        self.lock()
            .branch_naming_rules
            .insert(rule.repo_id.clone(), rule);
        self.persist()
    }

    // ---- Worktree rules -----------------------------------------------------

    pub fn get_worktree_rule(&self, repo_id: &str) -> Option<WorktreeRule> {
        self.lock().worktree_rules.get(repo_id).cloned()
    }

    pub fn set_worktree_rule(&self, rule: WorktreeRule) -> CoreResult<()> {
        self.lock().worktree_rules.insert(rule.repo_id.clone(), rule);
        self.persist()
    }

    // ---- Terminal sessions -------------------------------------------------

    /// Returns the existing row for `(repo_id, worktree_path)` if one
    /// exists, else creates it — terminal session worktree path is unique,
    /// §3.
    pub fn get_or_create_terminal_session(
        &self,
        repo_id: &str,
        worktree_path: &str,
    ) -> CoreResult<TerminalSessionRow> {
        let mut data = self.lock();
        if let Some(existing) = data
            .terminal_sessions
            .values()
            .find(|s| s.worktree_path == worktree_path)
        {
            return Ok(existing.clone());
        }
        let now = Utc::now();
        let row = TerminalSessionRow {
            id: Uuid::new_v4(),
            repo_id: repo_id.to_string(),
            worktree_path: worktree_path.to_string(),
            pid: None,
            status: TerminalSessionStatus::Stopped,
            last_output: None,
            created_at: now,
            updated_at: now,
        };
        data.terminal_sessions.insert(row.id, row.clone());
        drop(data);
        self.persist()?;
        Ok(row)
    }

    pub fn get_terminal_session(&self, id: Uuid) -> Option<TerminalSessionRow> {
        self.lock().terminal_sessions.get(&id).cloned()
    }

    pub fn update_terminal_session(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut TerminalSessionRow),
    ) -> CoreResult<TerminalSessionRow> {
        let mut data = self.lock();
        let row = data
            .terminal_sessions
            .get_mut(&id)
            .ok_or_else(|| CoreError::not_found(format!("terminal session {id}")))?;
        f(row);
        row.updated_at = Utc::now();
        let result = row.clone();
        drop(data);
        self.persist()?;
        Ok(result)
    }

    // ---- Chat sessions / messages -----------------------------------------

    pub fn create_chat_session(&self, worktree_path: &str, branch_name: &str) -> CoreResult<ChatSession> {
        let now = Utc::now();
        let session = ChatSession {
            id: Uuid::new_v4(),
            worktree_path: worktree_path.to_string(),
            branch_name: branch_name.to_string(),
            status: ChatSessionStatus::Active,
            created_at: now,
            updated_at: now,
        };
        let mut data = self.lock();
        data.chat_sessions.insert(session.id, session.clone());
        drop(data);
        self.persist()?;
        Ok(session)
    }

    pub fn append_chat_message(
        &self,
        chat_session_id: Uuid,
        role: types::ChatRole,
        content: &str,
    ) -> CoreResult<ChatMessage> {
        let message = ChatMessage {
            id: Uuid::new_v4(),
            chat_session_id,
            role,
            content: content.to_string(),
            created_at: Utc::now(),
        };
        let mut data = self.lock();
        data.chat_messages.insert(message.id, message.clone());
        drop(data);
        self.persist()?;
        Ok(message)
    }

    pub fn list_chat_messages(&self, chat_session_id: Uuid) -> Vec<ChatMessage> {
        let mut messages: Vec<_> = self
            .lock()
            .chat_messages
            .values()
            .filter(|m| m.chat_session_id == chat_session_id)
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.created_at);
        messages
    }

    // ---- Branch links ------------------------------------------------------

    pub fn upsert_branch_link(&self, link: BranchLink) -> CoreResult<()> {
        let mut data = self.lock();
        data.branch_links
            .retain(|l| !(l.repo_id == link.repo_id && l.branch_name == link.branch_name && l.link_type == link.link_type));
        data.branch_links.push(link);
        drop(data);
        self.persist()
    }

    pub fn list_branch_links(&self, repo_id: &str, branch_name: &str) -> Vec<BranchLink> {
        self.lock()
            .branch_links
            .iter()
            .filter(|l| l.repo_id == repo_id && l.branch_name == branch_name)
            .cloned()
            .collect()
    }

    // ---- External links ------------------------------------------------------

    pub fn create_external_link(&self, link: ExternalLink) -> CoreResult<ExternalLink> {
        let mut data = self.lock();
        data.external_links.insert(link.id, link.clone());
        drop(data);
        self.persist()?;
        Ok(link)
    }

    pub fn update_external_link(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut ExternalLink),
    ) -> CoreResult<ExternalLink> {
        let mut data = self.lock();
        let link = data
            .external_links
            .get_mut(&id)
            .ok_or_else(|| CoreError::not_found(format!("external link {id}")))?;
        f(link);
        let result = link.clone();
        drop(data);
        self.persist()?;
        Ok(result)
    }

    pub fn delete_external_link(&self, id: Uuid) -> CoreResult<()> {
        self.lock().external_links.remove(&id);
        self.persist()
    }

    pub fn get_external_link(&self, id: Uuid) -> Option<ExternalLink> {
        self.lock().external_links.get(&id).cloned()
    }

    pub fn list_external_links(&self, planning_session_id: Uuid) -> Vec<ExternalLink> {
        self.lock()
            .external_links
            .values()
            .filter(|l| l.planning_session_id == planning_session_id)
            .cloned()
            .collect()
    }

    // ---- Repo pins -----------------------------------------------------------

    pub fn get_repo_pins(&self, repo_id: &str) -> Option<RepoPins> {
        self.lock().repo_pins.get(repo_id).cloned()
    }

    pub fn set_repo_pins(&self, pins: RepoPins) -> CoreResult<()> {
        self.lock().repo_pins.insert(pins.repo_id.clone(), pins);
        self.persist()
    }

    // ---- Orthogonal document CRUD (requirements/ai/system) -------------------

    pub fn get_document(&self, table: &str, repo_id: &str) -> Option<serde_json::Value> {
        self.lock().documents.get(&format!("{table}/{repo_id}")).cloned()
    }

    pub fn put_document(&self, table: &str, repo_id: &str, value: serde_json::Value) -> CoreResult<()> {
        self.lock()
            .documents
            .insert(format!("{table}/{repo_id}"), value);
        self.persist()
    }

    // ---- Cascade delete + reparent on branch delete --------------------------

    /// Rewrites every tree spec's and planning session's edges for `repo_id`
    /// so that deleting `branch_name` reparents its children onto its own
    /// parent (or the base branch if it had none) — §4.3's "reparent
    /// children" transaction, one document at a time under the lock.
    pub fn reparent_children_on_branch_delete(&self, repo_id: &str, branch_name: &str) {
        let mut data = self.lock();

        if let Some(spec) = data.tree_specs.get_mut(repo_id) {
            reparent_edges(&mut spec.edges, &spec.nodes, branch_name, spec.base_branch.as_deref());
        }

        let session_ids: Vec<Uuid> = data
            .planning_sessions
            .values()
            .filter(|s| s.repo_id == repo_id)
            .map(|s| s.id)
            .collect();
        for id in session_ids {
            if let Some(session) = data.planning_sessions.get_mut(&id) {
                let base = session.base_branch.clone();
                reparent_edges(&mut session.edges, &session.nodes, branch_name, base.as_deref());
            }
        }

        drop(data);
        let _ = self.persist();
    }

    /// Cascade-deletes chat sessions+messages, task instructions, branch
    /// links, instructions-log rows for `branch_name` in `repo_id`. Each
    /// step is independent and non-fatal on failure per §4.7's policy — this
    /// function can't itself fail since it only mutates in-memory maps, but
    /// callers are expected to log-and-continue around it regardless.
    pub fn cascade_delete_branch(&self, repo_id: &str, branch_name: &str) -> CoreResult<()> {
        let mut data = self.lock();

        let chat_session_ids: Vec<Uuid> = data
            .chat_sessions
            .values()
            .filter(|s| s.branch_name == branch_name)
            .map(|s| s.id)
            .collect();
        for id in &chat_session_ids {
            data.chat_sessions.remove(id);
        }
        data.chat_messages
            .retain(|_, m| !chat_session_ids.contains(&m.chat_session_id));

        data.task_instructions
            .retain(|t| !(t.repo_id == repo_id && t.branch_name == branch_name));

        data.branch_links
            .retain(|l| !(l.repo_id == repo_id && l.branch_name == branch_name));

        data.instructions_log
            .retain(|r| !(r.repo_id == repo_id && r.branch_name == branch_name));

        drop(data);
        self.persist()
    }

    /// Given the set of branch names currently present in the repo, deletes
    /// every store row referencing a branch no longer in that set — §4.7's
    /// "cleanup orphaned".
    pub fn cleanup_orphaned(&self, repo_id: &str, live_branches: &[String]) -> CoreResult<usize> {
        let mut removed = 0usize;
        let mut data = self.lock();

        let dead_chat_sessions: Vec<Uuid> = data
            .chat_sessions
            .values()
            .filter(|s| !live_branches.iter().any(|b| b == &s.branch_name))
            .map(|s| s.id)
            .collect();
        removed += dead_chat_sessions.len();
        for id in &dead_chat_sessions {
            data.chat_sessions.remove(id);
        }
        data.chat_messages
            .retain(|_, m| !dead_chat_sessions.contains(&m.chat_session_id));

        let before = data.task_instructions.len();
        data.task_instructions
            .retain(|t| t.repo_id != repo_id || live_branches.iter().any(|b| b == &t.branch_name));
        removed += before - data.task_instructions.len();

        let before = data.branch_links.len();
        data.branch_links
            .retain(|l| l.repo_id != repo_id || live_branches.iter().any(|b| b == &l.branch_name));
        removed += before - data.branch_links.len();

        let before = data.instructions_log.len();
        data.instructions_log
            .retain(|r| r.repo_id != repo_id || live_branches.iter().any(|b| b == &r.branch_name));
        removed += before - data.instructions_log.len();

        drop(data);
        self.persist()?;
        Ok(removed)
    }

    pub fn append_instructions_log(&self, row: InstructionsLogRow) -> CoreResult<()> {
        self.lock().instructions_log.push(row);
        self.persist()
    }

    pub fn upsert_task_instruction(&self, instruction: TaskInstruction) -> CoreResult<()> {
        let mut data = self.lock();
        data.task_instructions
            .retain(|t| !(t.repo_id == instruction.repo_id && t.branch_name == instruction.branch_name));
        data.task_instructions.push(instruction);
        drop(data);
        self.persist()
    }
}

/// Removes the edge targeting `removed_branch` and rewrites every edge
/// whose parent is `removed_branch` to point at its own parent (or
/// `fallback_base` if it had none), per §4.3.
fn reparent_edges(
    edges: &mut Vec<TreeEdgeSpec>,
    nodes: &[types::TaskNode],
    removed_branch: &str,
    fallback_base: Option<&str>,
) {
    let removed_id = nodes
        .iter()
        .find(|n| n.branch_name.as_deref() == Some(removed_branch))
        .map(|n| n.id);
    let Some(removed_id) = removed_id else { return };

    let grandparent = edges
        .iter()
        .find(|e| e.to == removed_id)
        .map(|e| e.from);

    edges.retain(|e| e.to != removed_id);

    if let Some(grandparent_id) = grandparent {
        for edge in edges.iter_mut() {
            if edge.from == removed_id {
                edge.from = grandparent_id;
            }
        }
    } else {
        // No grandparent: the removed branch was itself a root. Its
        // children become roots too (base branch is implicit for roots),
        // so their edges are simply dropped.
        let _ = fallback_base;
        edges.retain(|e| e.from != removed_id);
    }
}

#[cfg(test)]
mod tests {
    use super::types::*;
    use super::*;
    use tempfile::tempdir;

    fn node(id: Uuid, branch: &str) -> TaskNode {
        TaskNode {
            id,
            title: branch.to_string(),
            description: None,
            status: TaskStatus::Todo,
            branch_name: Some(branch.to_string()),
            worktree_path: None,
            chat_session_id: None,
            pr_url: None,
            pr_number: None,
        }
    }

    #[test]
    fn terminal_session_lookup_is_unique_per_worktree_path() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        let a = store.get_or_create_terminal_session("acme/widgets", "/repo-worktrees/a").unwrap();
        let b = store.get_or_create_terminal_session("acme/widgets", "/repo-worktrees/a").unwrap();
        assert_eq!(a.id, b.id);

        let c = store.get_or_create_terminal_session("acme/widgets", "/repo-worktrees/b").unwrap();
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn reparent_rewrites_grandchild_edges_onto_grandparent() {
        let root = Uuid::new_v4();
        let mid = Uuid::new_v4();
        let leaf = Uuid::new_v4();
        let nodes = vec![node(root, "main"), node(mid, "feat/a"), node(leaf, "feat/a-sub")];
        let mut edges = vec![
            TreeEdgeSpec { from: root, to: mid },
            TreeEdgeSpec { from: mid, to: leaf },
        ];

        reparent_edges(&mut edges, &nodes, "feat/a", Some("main"));

        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0], TreeEdgeSpec { from: root, to: leaf });
    }

    #[test]
    fn reparent_of_a_root_drops_its_children_edges() {
        let root = Uuid::new_v4();
        let leaf = Uuid::new_v4();
        let nodes = vec![node(root, "feat/root"), node(leaf, "feat/root-child")];
        let mut edges = vec![TreeEdgeSpec { from: root, to: leaf }];

        reparent_edges(&mut edges, &nodes, "feat/root", Some("main"));

        assert!(edges.is_empty());
    }

    #[test]
    fn cascade_delete_removes_chat_messages_with_their_session() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        let session = store.create_chat_session("/wt/a", "feat/a").unwrap();
        store
            .append_chat_message(session.id, ChatRole::User, "hello")
            .unwrap();

        store.cascade_delete_branch("acme/widgets", "feat/a").unwrap();

        assert!(store.list_chat_messages(session.id).is_empty());
    }

    #[test]
    fn store_persists_and_reloads_across_open_calls() {
        let dir = tempdir().unwrap();
        {
            let store = Store::open(dir.path()).unwrap();
            store
                .set_repo_pins(RepoPins {
                    repo_id: "acme/widgets".to_string(),
                    base_branch_override: Some("develop".to_string()),
                })
                .unwrap();
        }
        let store = Store::open(dir.path()).unwrap();
        let pins = store.get_repo_pins("acme/widgets").unwrap();
        assert_eq!(pins.base_branch_override.as_deref(), Some("develop"));
    }

    #[test]
    fn terminal_sessions_reset_to_stopped_on_reopen() {
        let dir = tempdir().unwrap();
        let id = {
            let store = Store::open(dir.path()).unwrap();
            let row = store.get_or_create_terminal_session("acme/widgets", "/wt/a").unwrap();
            store
                .update_terminal_session(row.id, |r| {
                    r.status = TerminalSessionStatus::Running;
                    r.pid = Some(1234);
                })
                .unwrap();
            row.id
        };

        let store = Store::open(dir.path()).unwrap();
        let row = store.get_terminal_session(id).unwrap();
        assert_eq!(row.status, TerminalSessionStatus::Stopped);
        assert!(row.pid.is_none());
    }
}
