//! Process-wide application state shared across every request handler.
//!
//! Grounded on `src/serve_session.rs`'s role as the single struct every web
//! handler is constructed from (there, an `Arc<Mutex<RojoTree>>` plus a
//! message queue; here, the store-per-repo map plus the broadcast bus and
//! PTY pool). One `AppState` is built at server startup and cloned (as an
//! `Arc`) into every connection task.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;

use crate::broadcast::Broadcaster;
use crate::cache::{self, Cache};
use crate::error::{CoreError, CoreResult};
use crate::pty::PtyManager;
use crate::store::Store;
use crate::vcs::gh::RepoSummary;
use crate::vcs::AheadBehind;

pub struct AppState {
    pub broadcaster: Arc<Broadcaster>,
    pub pty: Arc<PtyManager>,
    /// One [`Store`] per repo local path — the store file lives at
    /// `<repoLocalPath>/.vibetree/store.json`, so the map is keyed by the
    /// canonicalized path rather than by repo id.
    stores: DashMap<PathBuf, Arc<Store>>,
    /// Repo id -> local path, learned from every request that supplies
    /// both (scan, branch ops). CRUD endpoints that are keyed on repo id
    /// alone (§6's "orthogonal to the core" surfaces) resolve through this
    /// map; a repo id that has never been scanned returns `NotFound`. This
    /// is an explicit decision recorded in DESIGN.md — the spec doesn't
    /// say how those endpoints locate a repo's local checkout.
    repo_paths: DashMap<String, PathBuf>,
    pub repos_cache: Cache<Vec<RepoSummary>>,
    /// Invalidated by branch operations; populated lazily by the scanner's
    /// own ahead/behind computation path (§4.2's "two concurrent misses may
    /// both fetch" — no stampede guard needed since git itself is the
    /// source of truth).
    pub ahead_behind_cache: Cache<AheadBehind>,
    /// Tracks whether a PR already exists per branch, consulted by the
    /// materializer before creating a duplicate.
    pub pr_cache: Cache<bool>,
}

impl AppState {
    pub fn new() -> Arc<Self> {
        Arc::new(AppState {
            broadcaster: Arc::new(Broadcaster::new()),
            pty: Arc::new(PtyManager::new()),
            stores: DashMap::new(),
            repo_paths: DashMap::new(),
            repos_cache: Cache::new(),
            ahead_behind_cache: Cache::new(),
            pr_cache: Cache::new(),
        })
    }
}

/// Spawns the background sweeper for every cache on the state. Separate
/// from [`AppState::new`] so constructing the struct never implicitly
/// spawns tasks outside of a Tokio runtime (unit tests build `AppState`
/// synchronously).
pub fn spawn_background_tasks(state: &Arc<AppState>) {
    let repos = Arc::clone(state);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(cache::SWEEP_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            let removed = repos.repos_cache.sweep_expired()
                + repos.ahead_behind_cache.sweep_expired()
                + repos.pr_cache.sweep_expired();
            if removed > 0 {
                tracing::debug!(removed, "cache sweep removed expired entries");
            }
        }
    });
}

impl AppState {
    /// Opens (or returns the cached handle to) the store rooted at
    /// `local_path`.
    pub fn store_for_path(&self, local_path: &Path) -> CoreResult<Arc<Store>> {
        let key = canonicalize_best_effort(local_path);
        if let Some(store) = self.stores.get(&key) {
            return Ok(Arc::clone(&store));
        }
        let store = Arc::new(Store::open(&key)?);
        self.stores.insert(key, Arc::clone(&store));
        Ok(store)
    }

    /// Records that `repo_id` lives at `local_path`, learned from a scan or
    /// a branch operation's request body.
    pub fn register_repo_path(&self, repo_id: &str, local_path: &Path) {
        self.repo_paths
            .insert(repo_id.to_string(), canonicalize_best_effort(local_path));
    }

    pub fn repo_path(&self, repo_id: &str) -> CoreResult<PathBuf> {
        self.repo_paths
            .get(repo_id)
            .map(|p| p.clone())
            .ok_or_else(|| {
                CoreError::not_found(format!(
                    "repo '{repo_id}' has not been scanned yet; POST /api/scan first"
                ))
            })
    }

    pub fn store_for_repo_id(&self, repo_id: &str) -> CoreResult<Arc<Store>> {
        let path = self.repo_path(repo_id)?;
        self.store_for_path(&path)
    }

    /// Every store opened so far, for the handlers that only have a row id
    /// to go on (e.g. deleting an external link by id) and must search
    /// across repos rather than resolve a single one up front.
    pub fn open_stores(&self) -> Vec<Arc<Store>> {
        self.stores.iter().map(|entry| Arc::clone(entry.value())).collect()
    }
}

fn canonicalize_best_effort(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
