//! The HTTP/WS request surface (§6), all routes prefixed `/api` except the
//! two bare `/ws*` stream endpoints. Routing is a manual `(method, path)`
//! match rather than a router crate, the same shape the teacher's API
//! dispatcher used for its own (much larger) set of routes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use futures::{sink::SinkExt, stream::StreamExt};
use http_body_util::{BodyExt, Full};
use hyper::{body::Incoming, Method, Request, Response, StatusCode};
use hyper_tungstenite::{is_upgrade_request, tungstenite::Message, upgrade, HyperWebsocket};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::app::AppState;
use crate::branch_ops;
use crate::error::{CoreError, CoreResult};
use crate::materializer::{self, MaterializeInput};
use crate::scanner;
use crate::store::types::{
    BranchLink, BranchLinkType, BranchNamingRule, ChatRole, ExternalLink, ExternalLinkType,
    PlanningSession, PlanningSessionStatus, RepoPins, TreeEdgeSpec, TreeSpec, TreeSpecStatus,
    WorktreeRule,
};
use crate::vcs::{self, git, gh};

use super::util::{error_response, json, json_ok, not_found};

pub async fn call(state: Arc<AppState>, mut request: Request<Incoming>) -> Response<Full<Bytes>> {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();

    match (&method, segments.as_slice()) {
        (&Method::GET, ["ws"]) => {
            return handle_ws(&state, &mut request).await;
        }
        (&Method::GET, ["ws", "term"]) => {
            return handle_ws_term(&state, &mut request).await;
        }
        _ => {}
    }

    let result: CoreResult<Response<Full<Bytes>>> = match (&method, segments.as_slice()) {
        (&Method::GET, ["api", "health"]) => Ok(health()),

        (&Method::GET, ["api", "repos"]) => repos_list(&state).await,
        (&Method::GET, ["api", "repos", owner, name]) => repos_view(&state, owner, name).await,

        (&Method::GET, ["api", "project-rules"]) => project_rules_get(&state, request.uri()),
        (&Method::POST, ["api", "project-rules"]) => {
            project_rules_set(&state, body(request).await?)
        }

        (&Method::POST, ["api", "scan"]) => scan(&state, body(request).await?),
        (&Method::GET, ["api", "scan", "restart-prompt"]) => {
            scan_restart_prompt(&state, request.uri())
        }

        (&Method::POST, ["api", "tree-spec"]) => tree_spec_upsert(&state, body(request).await?),
        (&Method::POST, ["api", "tree-spec", "confirm"]) => {
            tree_spec_confirm(&state, body(request).await?)
        }
        (&Method::POST, ["api", "tree-spec", "unconfirm"]) => {
            tree_spec_unconfirm(&state, body(request).await?)
        }

        (&Method::POST, ["api", "branch", "create"]) => {
            branch_create(&state, body(request).await?)
        }
        (&Method::POST, ["api", "branch", "create-worktree"]) => {
            branch_create_worktree(&state, body(request).await?)
        }
        (&Method::POST, ["api", "branch", "create-tree"]) => {
            branch_create_tree(&state, body(request).await?)
        }
        (&Method::POST, ["api", "branch", "checkout"]) => {
            branch_checkout(&state, body(request).await?)
        }
        (&Method::POST, ["api", "branch", "pull"]) => branch_pull(&state, body(request).await?),
        (&Method::POST, ["api", "branch", "rebase"]) => {
            branch_rebase(&state, body(request).await?)
        }
        (&Method::POST, ["api", "branch", "merge-parent"]) => {
            branch_merge_parent(&state, body(request).await?)
        }
        (&Method::POST, ["api", "branch", "push"]) => branch_push(&state, body(request).await?),
        (&Method::POST, ["api", "branch", "delete"]) => {
            branch_delete(&state, body(request).await?)
        }
        (&Method::POST, ["api", "branch", "delete-worktree"]) => {
            branch_delete_worktree(&state, body(request).await?)
        }
        (&Method::POST, ["api", "branch", "check-deletable"]) => {
            branch_check_deletable(&state, body(request).await?)
        }
        (&Method::POST, ["api", "branch", "cleanup-orphaned"]) => {
            branch_cleanup_orphaned(&state, body(request).await?)
        }

        (&Method::POST, ["api", "term", "sessions"]) => {
            term_sessions_create(&state, body(request).await?)
        }
        (&Method::POST, ["api", "term", "sessions", id, "start"]) => {
            term_sessions_start(&state, id)
        }
        (&Method::POST, ["api", "term", "sessions", id, "stop"]) => term_sessions_stop(&state, id),
        (&Method::POST, ["api", "term", "sessions", id, "write"]) => {
            term_sessions_write(&state, id, body(request).await?)
        }
        (&Method::POST, ["api", "term", "sessions", id, "resize"]) => {
            term_sessions_resize(&state, id, body(request).await?)
        }
        (&Method::GET, ["api", "term", "sessions", id]) => term_sessions_get(&state, id),

        (&Method::GET, ["api", "external-links"]) => {
            external_links_list(&state, request.uri())
        }
        (&Method::POST, ["api", "external-links"]) => {
            external_links_create(&state, body(request).await?)
        }
        (&Method::PATCH, ["api", "external-links", id]) => {
            external_links_update(&state, id, body(request).await?)
        }
        (&Method::DELETE, ["api", "external-links", id]) => {
            external_links_delete(&state, id)
        }
        (&Method::POST, ["api", "external-links", id, "refresh"]) => {
            external_links_refresh(&state, id).await
        }
        (&Method::GET, ["api", "external-links", "context"]) => {
            external_links_context(&state, request.uri())
        }

        (&Method::GET, ["api", "planning-sessions"]) => {
            planning_sessions_list(&state, request.uri())
        }
        (&Method::POST, ["api", "planning-sessions"]) => {
            planning_sessions_upsert(&state, body(request).await?)
        }
        (&Method::DELETE, ["api", "planning-sessions", id]) => {
            planning_sessions_delete(&state, id)
        }

        (&Method::POST, ["api", "chat", "sessions"]) => {
            chat_create_session(&state, body(request).await?)
        }
        (&Method::GET, ["api", "chat", "messages"]) => {
            chat_list_messages(&state, request.uri())
        }
        (&Method::POST, ["api", "chat", "messages"]) => {
            chat_append_message(&state, body(request).await?)
        }

        (&Method::GET, ["api", "branch-links"]) => branch_links_list(&state, request.uri()),
        (&Method::POST, ["api", "branch-links"]) => {
            branch_links_upsert(&state, body(request).await?)
        }

        (&Method::GET, ["api", "repo-pins"]) => repo_pins_get(&state, request.uri()),
        (&Method::POST, ["api", "repo-pins"]) => repo_pins_set(&state, body(request).await?),

        (&Method::GET, ["api", table @ ("instructions" | "requirements" | "ai" | "system")]) => {
            document_get(&state, table, request.uri())
        }
        (&Method::POST, ["api", table @ ("instructions" | "requirements" | "ai" | "system")]) => {
            document_put(&state, table, request.uri(), body(request).await?)
        }

        _ => Err(CoreError::not_found(format!("no such route: {} {}", method, path))),
    };

    match result {
        Ok(response) => response,
        Err(CoreError::NotFound(msg)) if msg.starts_with("no such route") => not_found(),
        Err(err) => error_response(err),
    }
}

fn health() -> Response<Full<Bytes>> {
    #[derive(Serialize)]
    struct Health {
        status: &'static str,
        timestamp: chrono::DateTime<Utc>,
    }
    json_ok(Health { status: "ok", timestamp: Utc::now() })
}

// ---- request body / query helpers -----------------------------------------

async fn body<T: DeserializeOwned>(request: Request<Incoming>) -> CoreResult<T> {
    let bytes = request
        .into_body()
        .collect()
        .await
        .map_err(|e| CoreError::bad_request(format!("failed to read request body: {e}")))?
        .to_bytes();
    serde_json::from_slice(&bytes).map_err(|e| crate::error::validation_from_serde_json(&e))
}

fn query_params(uri: &hyper::Uri) -> std::collections::HashMap<String, String> {
    uri.query()
        .map(|q| {
            q.split('&')
                .filter_map(|pair| {
                    let mut parts = pair.splitn(2, '=');
                    let key = parts.next()?;
                    let value = parts.next().unwrap_or("");
                    Some((urlencoding_decode(key), urlencoding_decode(value)))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Minimal `application/x-www-form-urlencoded` value decoder — query values
/// here are paths and uuids, never needing full RFC 3986 generality.
fn urlencoding_decode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        match c {
            '%' => {
                let hex: String = chars.by_ref().take(2).collect();
                if let Ok(byte) = u8::from_str_radix(&hex, 16) {
                    out.push(byte as char);
                } else {
                    out.push('%');
                    out.push_str(&hex);
                }
            }
            '+' => out.push(' '),
            other => out.push(other),
        }
    }
    out
}

fn query_required<'a>(
    params: &'a std::collections::HashMap<String, String>,
    key: &str,
) -> CoreResult<&'a str> {
    params
        .get(key)
        .map(|s| s.as_str())
        .ok_or_else(|| CoreError::bad_request(format!("missing query parameter '{key}'")))
}

fn parse_uuid(raw: &str) -> CoreResult<Uuid> {
    Uuid::parse_str(raw).map_err(|_| CoreError::bad_request(format!("invalid id '{raw}'")))
}

// ---- /api/repos -------------------------------------------------------------

async fn repos_list(state: &Arc<AppState>) -> CoreResult<Response<Full<Bytes>>> {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let cache = &state.repos_cache;
    let repos = cache.get_or_fetch("repos", std::time::Duration::from_secs(5 * 60), || {
        gh::list_repos(&cwd)
    })?;
    Ok(json_ok(repos))
}

async fn repos_view(
    state: &Arc<AppState>,
    owner: &str,
    name: &str,
) -> CoreResult<Response<Full<Bytes>>> {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let _ = state;
    let summary = gh::repo_metadata_by_slug(&cwd, owner, name)?;
    Ok(json_ok(summary))
}

// ---- /api/project-rules -----------------------------------------------------

#[derive(Serialize)]
struct ProjectRules {
    #[serde(rename = "branchNamingRule", skip_serializing_if = "Option::is_none")]
    branch_naming_rule: Option<BranchNamingRule>,
    #[serde(rename = "worktreeRule", skip_serializing_if = "Option::is_none")]
    worktree_rule: Option<WorktreeRule>,
}

fn project_rules_get(state: &Arc<AppState>, uri: &hyper::Uri) -> CoreResult<Response<Full<Bytes>>> {
    let params = query_params(uri);
    let repo_id = query_required(&params, "repoId")?;
    let store = state.store_for_repo_id(repo_id)?;
    Ok(json_ok(ProjectRules {
        branch_naming_rule: store.get_branch_naming_rule(repo_id),
        worktree_rule: store.get_worktree_rule(repo_id),
    }))
}

#[derive(Deserialize)]
struct ProjectRulesSetRequest {
    #[serde(rename = "branchNamingRule")]
    branch_naming_rule: Option<BranchNamingRule>,
    #[serde(rename = "worktreeRule")]
    worktree_rule: Option<WorktreeRule>,
}

fn project_rules_set(
    state: &Arc<AppState>,
    req: ProjectRulesSetRequest,
) -> CoreResult<Response<Full<Bytes>>> {
    if let Some(rule) = req.branch_naming_rule {
        let store = state.store_for_repo_id(&rule.repo_id)?;
        store.set_branch_naming_rule(rule)?;
    }
    if let Some(rule) = req.worktree_rule {
        let store = state.store_for_repo_id(&rule.repo_id)?;
        store.set_worktree_rule(rule)?;
    }
    Ok(json_ok(serde_json::json!({"ok": true})))
}

// ---- /api/scan ---------------------------------------------------------------

#[derive(Deserialize)]
struct ScanRequest {
    #[serde(rename = "localPath")]
    local_path: String,
}

fn scan(state: &Arc<AppState>, req: ScanRequest) -> CoreResult<Response<Full<Bytes>>> {
    let path = scanner::expand_path(&req.local_path)?;
    let repo_id = vcs::resolve_repo_id(&path);
    let store = state.store_for_path(&path)?;
    state.register_repo_path(&repo_id, &path);
    let snapshot = scanner::scan(&store, &state.broadcaster, &req.local_path)?;
    Ok(json_ok(snapshot))
}

fn scan_restart_prompt(
    state: &Arc<AppState>,
    uri: &hyper::Uri,
) -> CoreResult<Response<Full<Bytes>>> {
    let params = query_params(uri);
    let local_path = query_required(&params, "localPath")?;
    let worktree_path = query_required(&params, "worktreePath")?;
    let path = scanner::expand_path(local_path)?;
    let store = state.store_for_path(&path)?;
    let snapshot = scanner::scan(&store, &state.broadcaster, local_path)?;
    let prompt = scanner::restart_prompt_for_worktree(&snapshot.nodes, &snapshot.warnings, worktree_path);
    Ok(json_ok(serde_json::json!({ "restart": prompt })))
}

// ---- /api/tree-spec ----------------------------------------------------------

fn tree_spec_upsert(state: &Arc<AppState>, mut spec: TreeSpec) -> CoreResult<Response<Full<Bytes>>> {
    if spec.status != TreeSpecStatus::Confirmed {
        spec.status = TreeSpecStatus::Draft;
    }
    let store = state.store_for_repo_id(&spec.repo_id)?;
    let saved = store.upsert_tree_spec(spec)?;
    Ok(json_ok(saved))
}

#[derive(Deserialize)]
struct RepoIdBody {
    #[serde(rename = "repoId")]
    repo_id: String,
}

fn tree_spec_confirm(state: &Arc<AppState>, req: RepoIdBody) -> CoreResult<Response<Full<Bytes>>> {
    let store = state.store_for_repo_id(&req.repo_id)?;
    let mut spec = store
        .get_tree_spec(&req.repo_id)
        .ok_or_else(|| CoreError::not_found(format!("no tree spec for repo '{}'", req.repo_id)))?;

    if spec.base_branch.is_none() {
        return Err(CoreError::bad_request("cannot confirm: baseBranch is not set"));
    }
    if spec.nodes.is_empty() {
        return Err(CoreError::bad_request("cannot confirm: tree has no nodes"));
    }
    let has_root = spec.nodes.iter().any(|n| !spec.edges.iter().any(|e| e.to == n.id));
    if !has_root {
        return Err(CoreError::bad_request("cannot confirm: tree has no root node"));
    }

    for node in spec.nodes.iter_mut() {
        if node.branch_name.is_none() {
            node.branch_name = Some(materializer::slugify_title(&node.title, node.id));
        }
    }

    spec.status = TreeSpecStatus::Confirmed;
    let saved = store.upsert_tree_spec(spec)?;
    Ok(json_ok(saved))
}

fn tree_spec_unconfirm(state: &Arc<AppState>, req: RepoIdBody) -> CoreResult<Response<Full<Bytes>>> {
    let store = state.store_for_repo_id(&req.repo_id)?;
    let mut spec = store
        .get_tree_spec(&req.repo_id)
        .ok_or_else(|| CoreError::not_found(format!("no tree spec for repo '{}'", req.repo_id)))?;
    spec.status = TreeSpecStatus::Draft;
    let saved = store.upsert_tree_spec(spec)?;
    Ok(json_ok(saved))
}

// ---- /api/branch/* -----------------------------------------------------------

#[derive(Deserialize)]
struct BranchCreateRequest {
    #[serde(rename = "localPath")]
    local_path: String,
    #[serde(rename = "branchName")]
    branch_name: String,
    #[serde(rename = "baseBranch")]
    base_branch: String,
}

fn branch_create(state: &Arc<AppState>, req: BranchCreateRequest) -> CoreResult<Response<Full<Bytes>>> {
    let repo_path = Path::new(&req.local_path);
    let repo_id = vcs::resolve_repo_id(repo_path);
    let store = state.store_for_path(repo_path)?;
    state.register_repo_path(&repo_id, repo_path);
    branch_ops::create_branch(
        &store,
        &state.broadcaster,
        &state.ahead_behind_cache,
        &repo_id,
        repo_path,
        &req.branch_name,
        &req.base_branch,
    )?;
    Ok(json_ok(serde_json::json!({"ok": true})))
}

#[derive(Deserialize)]
struct BranchCreateWorktreeRequest {
    #[serde(rename = "localPath")]
    local_path: String,
    #[serde(rename = "branchName")]
    branch_name: String,
}

fn branch_create_worktree(
    state: &Arc<AppState>,
    req: BranchCreateWorktreeRequest,
) -> CoreResult<Response<Full<Bytes>>> {
    let repo_path = Path::new(&req.local_path);
    let repo_id = vcs::resolve_repo_id(repo_path);
    state.register_repo_path(&repo_id, repo_path);
    let worktrees_dir = materializer::worktrees_parent_dir(repo_path)?;
    std::fs::create_dir_all(&worktrees_dir)?;
    let worktree_path = branch_ops::create_worktree_for_existing_branch(
        &state.broadcaster,
        &state.ahead_behind_cache,
        &repo_id,
        repo_path,
        &worktrees_dir,
        &req.branch_name,
    )?;
    Ok(json_ok(serde_json::json!({ "worktreePath": worktree_path })))
}

fn branch_create_tree(
    state: &Arc<AppState>,
    req: MaterializeInput,
) -> CoreResult<Response<Full<Bytes>>> {
    let repo_path = Path::new(&req.local_path);
    state.register_repo_path(&req.repo_id, repo_path);
    let store = state.store_for_path(repo_path)?;
    let result = materializer::materialize(&store, &state.pr_cache, req)?;
    Ok(json_ok(result))
}

#[derive(Deserialize)]
struct BranchPathRequest {
    #[serde(rename = "localPath")]
    local_path: String,
    #[serde(rename = "branchName")]
    branch_name: String,
    #[serde(rename = "worktreePath")]
    worktree_path: Option<String>,
}

fn branch_checkout(state: &Arc<AppState>, req: BranchPathRequest) -> CoreResult<Response<Full<Bytes>>> {
    let repo_path = Path::new(&req.local_path);
    let repo_id = vcs::resolve_repo_id(repo_path);
    branch_ops::checkout(&state.broadcaster, &repo_id, repo_path, &req.branch_name)?;
    Ok(json_ok(serde_json::json!({"ok": true})))
}

fn branch_pull(state: &Arc<AppState>, req: BranchPathRequest) -> CoreResult<Response<Full<Bytes>>> {
    let _ = state;
    let repo_path = Path::new(&req.local_path);
    let worktree_path = req.worktree_path.as_ref().map(Path::new);
    let message = branch_ops::pull(repo_path, worktree_path, &req.branch_name)?;
    Ok(json_ok(serde_json::json!({ "message": message })))
}

#[derive(Deserialize)]
struct BranchParentRequest {
    #[serde(rename = "localPath")]
    local_path: String,
    #[serde(rename = "branchName")]
    branch_name: String,
    #[serde(rename = "worktreePath")]
    worktree_path: Option<String>,
    #[serde(rename = "parentBranch")]
    parent_branch: String,
}

fn branch_rebase(state: &Arc<AppState>, req: BranchParentRequest) -> CoreResult<Response<Full<Bytes>>> {
    let repo_path = Path::new(&req.local_path);
    let repo_id = vcs::resolve_repo_id(repo_path);
    let worktree_path = req.worktree_path.as_ref().map(Path::new);
    branch_ops::rebase_onto_parent(
        &state.ahead_behind_cache,
        &repo_id,
        repo_path,
        worktree_path,
        &req.branch_name,
        &req.parent_branch,
    )?;
    Ok(json_ok(serde_json::json!({"ok": true})))
}

fn branch_merge_parent(
    state: &Arc<AppState>,
    req: BranchParentRequest,
) -> CoreResult<Response<Full<Bytes>>> {
    let repo_path = Path::new(&req.local_path);
    let repo_id = vcs::resolve_repo_id(repo_path);
    let worktree_path = req.worktree_path.as_ref().map(Path::new);
    branch_ops::merge_parent_in(
        &state.ahead_behind_cache,
        &repo_id,
        repo_path,
        worktree_path,
        &req.branch_name,
        &req.parent_branch,
    )?;
    Ok(json_ok(serde_json::json!({"ok": true})))
}

#[derive(Deserialize)]
struct BranchPushRequest {
    #[serde(rename = "localPath")]
    local_path: String,
    #[serde(rename = "branchName")]
    branch_name: String,
    #[serde(rename = "worktreePath")]
    worktree_path: Option<String>,
    #[serde(default)]
    force: bool,
}

fn branch_push(state: &Arc<AppState>, req: BranchPushRequest) -> CoreResult<Response<Full<Bytes>>> {
    let _ = state;
    let repo_path = Path::new(&req.local_path);
    let worktree_path = req.worktree_path.as_ref().map(Path::new);
    let message = branch_ops::push(repo_path, worktree_path, &req.branch_name, req.force)?;
    Ok(json_ok(serde_json::json!({ "message": message })))
}

#[derive(Deserialize)]
struct BranchDeleteRequest {
    #[serde(rename = "localPath")]
    local_path: String,
    #[serde(rename = "branchName")]
    branch_name: String,
    #[serde(default)]
    force: bool,
}

fn branch_delete(state: &Arc<AppState>, req: BranchDeleteRequest) -> CoreResult<Response<Full<Bytes>>> {
    let repo_path = Path::new(&req.local_path);
    let repo_id = vcs::resolve_repo_id(repo_path);
    let store = state.store_for_path(repo_path)?;
    branch_ops::delete_branch(
        &store,
        &state.broadcaster,
        &state.ahead_behind_cache,
        &repo_id,
        repo_path,
        &req.branch_name,
        req.force,
    )?;
    Ok(json_ok(serde_json::json!({"ok": true})))
}

#[derive(Deserialize)]
struct BranchDeleteWorktreeRequest {
    #[serde(rename = "localPath")]
    local_path: String,
    #[serde(rename = "worktreePath")]
    worktree_path: String,
}

fn branch_delete_worktree(
    state: &Arc<AppState>,
    req: BranchDeleteWorktreeRequest,
) -> CoreResult<Response<Full<Bytes>>> {
    let repo_path = Path::new(&req.local_path);
    let repo_id = vcs::resolve_repo_id(repo_path);
    branch_ops::delete_worktree(
        &state.broadcaster,
        &state.ahead_behind_cache,
        &repo_id,
        repo_path,
        Path::new(&req.worktree_path),
    )?;
    Ok(json_ok(serde_json::json!({"ok": true})))
}

#[derive(Deserialize)]
struct CheckDeletableRequest {
    #[serde(rename = "localPath")]
    local_path: String,
    #[serde(rename = "branchName")]
    branch_name: String,
    #[serde(rename = "parentBranch")]
    parent_branch: String,
}

fn branch_check_deletable(
    state: &Arc<AppState>,
    req: CheckDeletableRequest,
) -> CoreResult<Response<Full<Bytes>>> {
    let _ = state;
    let repo_path = Path::new(&req.local_path);
    let result = branch_ops::check_deletable(repo_path, &req.branch_name, &req.parent_branch);
    Ok(json_ok(result))
}

fn branch_cleanup_orphaned(
    state: &Arc<AppState>,
    req: ScanRequest,
) -> CoreResult<Response<Full<Bytes>>> {
    let repo_path = scanner::expand_path(&req.local_path)?;
    let repo_id = vcs::resolve_repo_id(&repo_path);
    let store = state.store_for_path(&repo_path)?;
    let removed = branch_ops::cleanup_orphaned(&store, &repo_path, &repo_id)?;
    Ok(json_ok(serde_json::json!({ "removed": removed })))
}

// ---- /api/term/sessions ------------------------------------------------------

#[derive(Deserialize)]
struct TermSessionCreateRequest {
    #[serde(rename = "repoId")]
    repo_id: String,
    #[serde(rename = "worktreePath")]
    worktree_path: String,
}

fn term_sessions_create(
    state: &Arc<AppState>,
    req: TermSessionCreateRequest,
) -> CoreResult<Response<Full<Bytes>>> {
    let store = state.store_for_repo_id(&req.repo_id)?;
    let row = store.get_or_create_terminal_session(&req.repo_id, &req.worktree_path)?;
    Ok(json_ok(row))
}

fn term_session_row(
    state: &Arc<AppState>,
    id: &str,
) -> CoreResult<(Arc<crate::store::Store>, crate::store::types::TerminalSessionRow)> {
    let id = parse_uuid(id)?;
    // The session could belong to any repo; search every open store. In
    // practice the caller just created or listed it through one repo's scan,
    // so this is a small linear scan over already-open stores, not a full
    // filesystem walk.
    for entry in state_stores(state) {
        if let Some(row) = entry.get_terminal_session(id) {
            return Ok((entry, row));
        }
    }
    Err(CoreError::not_found(format!("terminal session {id}")))
}

fn state_stores(state: &Arc<AppState>) -> Vec<Arc<crate::store::Store>> {
    state.open_stores()
}

fn term_sessions_start(state: &Arc<AppState>, id: &str) -> CoreResult<Response<Full<Bytes>>> {
    let (store, row) = term_session_row(state, id)?;
    let session_id = row.id;
    state.pty.create(&session_id.to_string(), &row.worktree_path, 80, 24)?;
    let pid = state.pty.get_pid(&session_id.to_string());
    let updated = store.update_terminal_session(session_id, |r| {
        r.status = crate::store::types::TerminalSessionStatus::Running;
        r.pid = pid;
    })?;
    Ok(json_ok(updated))
}

fn term_sessions_stop(state: &Arc<AppState>, id: &str) -> CoreResult<Response<Full<Bytes>>> {
    let (store, row) = term_session_row(state, id)?;
    let session_id = row.id;
    let last_output = state
        .pty
        .get_output_buffer(&session_id.to_string())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned());
    state.pty.kill(&session_id.to_string());
    let updated = store.update_terminal_session(session_id, |r| {
        r.status = crate::store::types::TerminalSessionStatus::Stopped;
        r.pid = None;
        r.last_output = last_output.clone();
    })?;
    Ok(json_ok(updated))
}

#[derive(Deserialize)]
struct TermWriteRequest {
    data: String,
}

fn term_sessions_write(
    state: &Arc<AppState>,
    id: &str,
    req: TermWriteRequest,
) -> CoreResult<Response<Full<Bytes>>> {
    let (_, row) = term_session_row(state, id)?;
    let ok = state.pty.write(&row.id.to_string(), req.data.as_bytes());
    Ok(json_ok(serde_json::json!({ "ok": ok })))
}

#[derive(Deserialize)]
struct TermResizeRequest {
    cols: u16,
    rows: u16,
}

fn term_sessions_resize(
    state: &Arc<AppState>,
    id: &str,
    req: TermResizeRequest,
) -> CoreResult<Response<Full<Bytes>>> {
    let (_, row) = term_session_row(state, id)?;
    let ok = state.pty.resize(&row.id.to_string(), req.cols, req.rows);
    Ok(json_ok(serde_json::json!({ "ok": ok })))
}

fn term_sessions_get(state: &Arc<AppState>, id: &str) -> CoreResult<Response<Full<Bytes>>> {
    let (_, mut row) = term_session_row(state, id)?;
    if row.status == crate::store::types::TerminalSessionStatus::Running {
        row.last_output = state
            .pty
            .get_output_buffer(&row.id.to_string())
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned());
    }
    Ok(json_ok(row))
}

// ---- /api/external-links -----------------------------------------------------

fn external_links_list(state: &Arc<AppState>, uri: &hyper::Uri) -> CoreResult<Response<Full<Bytes>>> {
    let params = query_params(uri);
    let repo_id = query_required(&params, "repoId")?;
    let planning_session_id = parse_uuid(query_required(&params, "planningSessionId")?)?;
    let store = state.store_for_repo_id(repo_id)?;
    Ok(json_ok(store.list_external_links(planning_session_id)))
}

#[derive(Deserialize)]
struct ExternalLinkCreateRequest {
    #[serde(rename = "repoId")]
    repo_id: String,
    #[serde(rename = "planningSessionId")]
    planning_session_id: Uuid,
    url: String,
    #[serde(rename = "linkType")]
    link_type: ExternalLinkType,
    title: Option<String>,
}

fn external_links_create(
    state: &Arc<AppState>,
    req: ExternalLinkCreateRequest,
) -> CoreResult<Response<Full<Bytes>>> {
    let store = state.store_for_repo_id(&req.repo_id)?;
    let link = ExternalLink {
        id: Uuid::new_v4(),
        planning_session_id: req.planning_session_id,
        url: req.url,
        link_type: req.link_type,
        title: req.title,
        content_cache: None,
        last_fetched_at: None,
    };
    let created = store.create_external_link(link)?;
    state.broadcaster.broadcast(crate::broadcast::Event::ExternalLinkCreated {
        planning_session_id: created.planning_session_id,
        link: serde_json::to_value(&created).unwrap_or(serde_json::Value::Null),
    });
    Ok(json_ok(created))
}

#[derive(Deserialize)]
struct ExternalLinkUpdateRequest {
    #[serde(rename = "repoId")]
    repo_id: String,
    title: Option<String>,
}

fn external_links_update(
    state: &Arc<AppState>,
    id: &str,
    req: ExternalLinkUpdateRequest,
) -> CoreResult<Response<Full<Bytes>>> {
    let id = parse_uuid(id)?;
    let store = state.store_for_repo_id(&req.repo_id)?;
    let updated = store.update_external_link(id, |link| {
        if req.title.is_some() {
            link.title = req.title.clone();
        }
    })?;
    state.broadcaster.broadcast(crate::broadcast::Event::ExternalLinkUpdated {
        planning_session_id: updated.planning_session_id,
        link: serde_json::to_value(&updated).unwrap_or(serde_json::Value::Null),
    });
    Ok(json_ok(updated))
}

fn external_links_delete(state: &Arc<AppState>, id: &str) -> CoreResult<Response<Full<Bytes>>> {
    let id = parse_uuid(id)?;
    // Deletion is keyed only by link id; broadcast needs the planning
    // session id, so look the row up across open stores before removing it.
    for store in state_stores(state) {
        if let Some(link) = store.get_external_link(id) {
            store.delete_external_link(id)?;
            state.broadcaster.broadcast(crate::broadcast::Event::ExternalLinkDeleted {
                planning_session_id: link.planning_session_id,
                link_id: id,
            });
            return Ok(json_ok(serde_json::json!({"ok": true})));
        }
    }
    Err(CoreError::not_found(format!("external link {id}")))
}

async fn external_links_refresh(
    state: &Arc<AppState>,
    id: &str,
) -> CoreResult<Response<Full<Bytes>>> {
    let id = parse_uuid(id)?;
    for store in state_stores(state) {
        if let Some(link) = store.get_external_link(id) {
            let content = fetch_external_link_content(&link.url).await;
            let updated = store.update_external_link(id, |l| {
                l.content_cache = content.clone();
                l.last_fetched_at = Some(Utc::now());
            })?;
            state.broadcaster.broadcast(crate::broadcast::Event::ExternalLinkUpdated {
                planning_session_id: updated.planning_session_id,
                link: serde_json::to_value(&updated).unwrap_or(serde_json::Value::Null),
            });
            return Ok(json_ok(updated));
        }
    }
    Err(CoreError::not_found(format!("external link {id}")))
}

/// Fetches a link's content for the concatenated-markdown context bundle.
/// Best-effort: a failed fetch leaves the cache untouched rather than
/// failing the refresh outright, matching §6's "optional hosting token" note
/// (these fetches have no auth beyond the forwarded token).
async fn fetch_external_link_content(url: &str) -> Option<String> {
    let client = hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
        .build_http();
    let uri: hyper::Uri = url.parse().ok()?;
    let token_header = std::env::var("VIBETREE_HOSTING_TOKEN").ok();
    let mut builder = Request::builder().method(Method::GET).uri(uri);
    if let Some(token) = token_header {
        builder = builder.header("Authorization", format!("Bearer {token}"));
    }
    let request = builder.body(http_body_util::Empty::<Bytes>::new()).ok()?;
    let response = client.request(request).await.ok()?;
    let bytes = response.into_body().collect().await.ok()?.to_bytes();
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

fn external_links_context(
    state: &Arc<AppState>,
    uri: &hyper::Uri,
) -> CoreResult<Response<Full<Bytes>>> {
    let params = query_params(uri);
    let repo_id = query_required(&params, "repoId")?;
    let planning_session_id = parse_uuid(query_required(&params, "planningSessionId")?)?;
    let store = state.store_for_repo_id(repo_id)?;
    let links = store.list_external_links(planning_session_id);

    let mut bundle = String::new();
    for link in &links {
        bundle.push_str(&format!("## {}\n\n", link.title.as_deref().unwrap_or(&link.url)));
        if let Some(content) = &link.content_cache {
            bundle.push_str(content);
        } else {
            bundle.push_str("_not yet fetched_");
        }
        bundle.push_str("\n\n");
    }
    Ok(json_ok(serde_json::json!({ "markdown": bundle })))
}

// ---- /api/planning-sessions ---------------------------------------------------

fn planning_sessions_list(
    state: &Arc<AppState>,
    uri: &hyper::Uri,
) -> CoreResult<Response<Full<Bytes>>> {
    let params = query_params(uri);
    let repo_id = query_required(&params, "repoId")?;
    let store = state.store_for_repo_id(repo_id)?;
    Ok(json_ok(store.list_planning_sessions(repo_id)))
}

fn planning_sessions_upsert(
    state: &Arc<AppState>,
    session: PlanningSession,
) -> CoreResult<Response<Full<Bytes>>> {
    let store = state.store_for_repo_id(&session.repo_id)?;
    let saved = store.upsert_planning_session(session)?;
    state.broadcaster.broadcast(crate::broadcast::Event::PlanUpdated {
        repo_id: saved.repo_id.clone(),
        planning_session_id: saved.id,
        plan: serde_json::to_value(&saved).unwrap_or(serde_json::Value::Null),
    });
    Ok(json_ok(saved))
}

fn planning_sessions_delete(state: &Arc<AppState>, id: &str) -> CoreResult<Response<Full<Bytes>>> {
    let id = parse_uuid(id)?;
    for store in state_stores(state) {
        if store.get_planning_session(id).is_some() {
            store.delete_planning_session(id)?;
            return Ok(json_ok(serde_json::json!({"ok": true})));
        }
    }
    Err(CoreError::not_found(format!("planning session {id}")))
}

// ---- /api/chat -----------------------------------------------------------------

#[derive(Deserialize)]
struct ChatCreateRequest {
    #[serde(rename = "repoId")]
    repo_id: String,
    #[serde(rename = "worktreePath")]
    worktree_path: String,
    #[serde(rename = "branchName")]
    branch_name: String,
}

fn chat_create_session(
    state: &Arc<AppState>,
    req: ChatCreateRequest,
) -> CoreResult<Response<Full<Bytes>>> {
    let store = state.store_for_repo_id(&req.repo_id)?;
    let session = store.create_chat_session(&req.worktree_path, &req.branch_name)?;
    Ok(json_ok(session))
}

fn chat_list_messages(state: &Arc<AppState>, uri: &hyper::Uri) -> CoreResult<Response<Full<Bytes>>> {
    let params = query_params(uri);
    let repo_id = query_required(&params, "repoId")?;
    let chat_session_id = parse_uuid(query_required(&params, "chatSessionId")?)?;
    let store = state.store_for_repo_id(repo_id)?;
    Ok(json_ok(store.list_chat_messages(chat_session_id)))
}

#[derive(Deserialize)]
struct ChatAppendRequest {
    #[serde(rename = "repoId")]
    repo_id: String,
    #[serde(rename = "chatSessionId")]
    chat_session_id: Uuid,
    role: ChatRole,
    content: String,
}

fn chat_append_message(
    state: &Arc<AppState>,
    req: ChatAppendRequest,
) -> CoreResult<Response<Full<Bytes>>> {
    let store = state.store_for_repo_id(&req.repo_id)?;
    let message = store.append_chat_message(req.chat_session_id, req.role, &req.content)?;
    Ok(json_ok(message))
}

// ---- /api/branch-links --------------------------------------------------------

fn branch_links_list(state: &Arc<AppState>, uri: &hyper::Uri) -> CoreResult<Response<Full<Bytes>>> {
    let params = query_params(uri);
    let repo_id = query_required(&params, "repoId")?;
    let branch_name = query_required(&params, "branchName")?;
    let store = state.store_for_repo_id(repo_id)?;
    Ok(json_ok(store.list_branch_links(repo_id, branch_name)))
}

fn branch_links_upsert(state: &Arc<AppState>, link: BranchLink) -> CoreResult<Response<Full<Bytes>>> {
    let store = state.store_for_repo_id(&link.repo_id)?;
    store.upsert_branch_link(link)?;
    Ok(json_ok(serde_json::json!({"ok": true})))
}

// ---- /api/repo-pins ------------------------------------------------------------

fn repo_pins_get(state: &Arc<AppState>, uri: &hyper::Uri) -> CoreResult<Response<Full<Bytes>>> {
    let params = query_params(uri);
    let repo_id = query_required(&params, "repoId")?;
    let store = state.store_for_repo_id(repo_id)?;
    Ok(json_ok(store.get_repo_pins(repo_id)))
}

fn repo_pins_set(state: &Arc<AppState>, pins: RepoPins) -> CoreResult<Response<Full<Bytes>>> {
    let store = state.store_for_repo_id(&pins.repo_id)?;
    store.set_repo_pins(pins)?;
    Ok(json_ok(serde_json::json!({"ok": true})))
}

// ---- generic document CRUD (instructions/requirements/ai/system) ---------------

fn document_get(
    state: &Arc<AppState>,
    table: &str,
    uri: &hyper::Uri,
) -> CoreResult<Response<Full<Bytes>>> {
    let params = query_params(uri);
    let repo_id = query_required(&params, "repoId")?;
    let store = state.store_for_repo_id(repo_id)?;
    Ok(json_ok(store.get_document(table, repo_id)))
}

#[derive(Deserialize)]
struct DocumentPutRequest {
    #[serde(rename = "repoId")]
    repo_id: Option<String>,
    #[serde(flatten)]
    value: serde_json::Value,
}

fn document_put(
    state: &Arc<AppState>,
    table: &str,
    uri: &hyper::Uri,
    req: DocumentPutRequest,
) -> CoreResult<Response<Full<Bytes>>> {
    let params = query_params(uri);
    let repo_id = req
        .repo_id
        .or_else(|| params.get("repoId").cloned())
        .ok_or_else(|| CoreError::bad_request("missing 'repoId'"))?;
    let store = state.store_for_repo_id(&repo_id)?;
    store.put_document(table, &repo_id, req.value)?;
    Ok(json_ok(serde_json::json!({"ok": true})))
}

// ---- /ws -----------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsClientMessage {
    Subscribe { #[serde(rename = "repoId")] repo_id: Option<String> },
}

async fn handle_ws(state: &Arc<AppState>, request: &mut Request<Incoming>) -> Response<Full<Bytes>> {
    if !is_upgrade_request(request) {
        return error_response(CoreError::bad_request("/ws must be a websocket upgrade request"));
    }
    let (response, websocket) = match upgrade(request, None) {
        Ok(v) => v,
        Err(e) => return error_response(CoreError::internal(format!("websocket upgrade failed: {e}"))),
    };
    let state = Arc::clone(state);
    tokio::spawn(async move {
        if let Err(e) = run_ws(state, websocket).await {
            tracing::warn!(error = %e, "/ws connection ended with error");
        }
    });
    response
}

async fn run_ws(state: Arc<AppState>, websocket: HyperWebsocket) -> anyhow::Result<()> {
    let mut websocket = websocket.await?;
    let (subscription, mut receiver) = state.broadcaster.connect();

    loop {
        tokio::select! {
            outgoing = receiver.recv() => {
                match outgoing {
                    Some(payload) => {
                        if websocket.send(Message::Text(payload.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = websocket.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(WsClientMessage::Subscribe { repo_id }) = serde_json::from_str(&text) {
                            state.broadcaster.set_subscription(&subscription, repo_id);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    state.broadcaster.disconnect(&subscription);
    Ok(())
}

// ---- /ws/term ----------------------------------------------------------------

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsTermClientMessage {
    Input { data: String },
    Resize { cols: u16, rows: u16 },
}

async fn handle_ws_term(
    state: &Arc<AppState>,
    request: &mut Request<Incoming>,
) -> Response<Full<Bytes>> {
    let params = query_params(request.uri());
    let Some(session_id) = params.get("sessionId").cloned() else {
        return error_response(CoreError::bad_request("missing 'sessionId' query parameter"));
    };
    if !is_upgrade_request(request) {
        return error_response(CoreError::bad_request("/ws/term must be a websocket upgrade request"));
    }
    let (response, websocket) = match upgrade(request, None) {
        Ok(v) => v,
        Err(e) => return error_response(CoreError::internal(format!("websocket upgrade failed: {e}"))),
    };
    let state = Arc::clone(state);
    tokio::spawn(async move {
        if let Err(e) = run_ws_term(state, websocket, session_id).await {
            tracing::warn!(error = %e, "/ws/term connection ended with error");
        }
    });
    response
}

async fn run_ws_term(
    state: Arc<AppState>,
    websocket: HyperWebsocket,
    session_id: String,
) -> anyhow::Result<()> {
    let mut websocket = websocket.await?;

    if let Some(buffer) = state.pty.get_output_buffer(&session_id) {
        let frame = serde_json::json!({ "type": "data", "data": String::from_utf8_lossy(&buffer) });
        websocket.send(Message::Text(frame.to_string().into())).await?;
    }

    let mut data_rx = state.pty.on_data(&session_id);
    let mut exit_rx = state.pty.on_exit(&session_id);

    loop {
        tokio::select! {
            data = async {
                match data_rx.as_mut() {
                    Some(rx) => rx.recv().await.ok(),
                    None => std::future::pending().await,
                }
            } => {
                let Some(crate::pty::DataEvent::Data(bytes)) = data else { continue };
                let frame = serde_json::json!({ "type": "data", "data": String::from_utf8_lossy(&bytes) });
                if websocket.send(Message::Text(frame.to_string().into())).await.is_err() {
                    break;
                }
            }
            exit = async {
                match exit_rx.as_mut() {
                    Some(rx) => rx.recv().await.ok(),
                    None => std::future::pending().await,
                }
            } => {
                if let Some(crate::pty::ExitEvent { code }) = exit {
                    let frame = serde_json::json!({ "type": "exit", "code": code });
                    let _ = websocket.send(Message::Text(frame.to_string().into())).await;
                }
                break;
            }
            incoming = websocket.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<WsTermClientMessage>(&text) {
                            Ok(WsTermClientMessage::Input { data }) => {
                                state.pty.write(&session_id, data.as_bytes());
                            }
                            Ok(WsTermClientMessage::Resize { cols, rows }) => {
                                state.pty.resize(&session_id, cols, rows);
                            }
                            Err(_) => {}
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    Ok(())
}
