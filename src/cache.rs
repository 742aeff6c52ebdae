//! TTL + LRU + background-GC cache (C2, §4.2). Keyed by string; values are
//! `Arc<dyn Any>`-free — callers get a typed [`Cache<T>`] per value shape,
//! mirroring how the scanner caches one kind of thing (repo snapshots) at a
//! time rather than stuffing everything into one heterogeneous map.
//!
//! Grounded on the background-sweep idiom in `src/change_processor.rs` (a
//! dedicated loop that periodically reconciles state), adapted here to
//! `tokio::time::interval` since the cache lives inside the async server
//! rather than owning its own OS thread.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Entries beyond this bound trigger an LRU eviction on insert, §4.2.
pub const MAX_ENTRIES: usize = 1000;
/// Background sweep cadence, §4.2.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

struct Entry<T> {
    value: T,
    inserted_at: Instant,
    last_access: Instant,
    ttl: Duration,
}

impl<T> Entry<T> {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) > self.ttl
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub evictions: u64,
}

/// A TTL+LRU cache holding one value shape, keyed by string.
///
/// Two concurrent misses for the same key may both invoke the fetcher —
/// fetchers are required to be idempotent, per §4.2, so no stampede guard is
/// implemented.
pub struct Cache<T> {
    entries: DashMap<String, Entry<T>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<T: Clone> Default for Cache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Cache<T> {
    pub fn new() -> Self {
        Cache {
            entries: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Returns a live value for `key`, calling `fetch` on a miss or expiry.
    pub fn get_or_fetch(&self, key: &str, ttl: Duration, fetch: impl FnOnce() -> T) -> T {
        let now = Instant::now();
        if let Some(mut entry) = self.entries.get_mut(key) {
            if !entry.is_expired(now) {
                entry.last_access = now;
                self.hits.fetch_add(1, Ordering::Relaxed);
                return entry.value.clone();
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let value = fetch();
        self.insert(key.to_string(), value.clone(), ttl);
        value
    }

    /// Async counterpart of [`Cache::get_or_fetch`], for fetchers that hit
    /// the network (the hosting CLI, ahead/behind fan-out) rather than just
    /// the local filesystem.
    pub async fn get_or_fetch_async<F, Fut>(&self, key: &str, ttl: Duration, fetch: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let now = Instant::now();
        if let Some(mut entry) = self.entries.get_mut(key) {
            if !entry.is_expired(now) {
                entry.last_access = now;
                self.hits.fetch_add(1, Ordering::Relaxed);
                return entry.value.clone();
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let value = fetch().await;
        self.insert(key.to_string(), value.clone(), ttl);
        value
    }

    fn insert(&self, key: String, value: T, ttl: Duration) {
        let now = Instant::now();
        self.entries.insert(
            key,
            Entry {
                value,
                inserted_at: now,
                last_access: now,
                ttl,
            },
        );
        self.evict_if_over_capacity();
    }

    fn evict_if_over_capacity(&self) {
        if self.entries.len() <= MAX_ENTRIES {
            return;
        }
        let lru_key = self
            .entries
            .iter()
            .min_by_key(|e| e.last_access)
            .map(|e| e.key().clone());
        if let Some(key) = lru_key {
            self.entries.remove(&key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn invalidate(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn invalidate_by_prefix(&self, prefix: &str) {
        self.entries.retain(|k, _| !k.starts_with(prefix));
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.len(),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Drops expired entries, returning the count removed. Called by the
    /// background sweep task; exposed directly for tests.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before - self.entries.len()
    }
}

/// Spawns the background sweep task for `cache`, running until the returned
/// handle is dropped or aborted.
pub fn spawn_sweeper<T>(cache: Arc<Cache<T>>, label: &'static str) -> tokio::task::JoinHandle<()>
where
    T: Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.tick().await; // first tick fires immediately; skip it
        loop {
            interval.tick().await;
            let removed = cache.sweep_expired();
            if removed > 0 {
                tracing::debug!(cache = label, removed, "cache sweep removed expired entries");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use rstest::rstest;

    #[rstest]
    #[case(Duration::from_millis(1), true)]
    #[case(Duration::from_secs(60), false)]
    fn ttl_boundary_determines_refetch(#[case] ttl: Duration, #[case] expect_refetch: bool) {
        let cache: Cache<u32> = Cache::new();
        cache.get_or_fetch("k", ttl, || 1);
        std::thread::sleep(Duration::from_millis(10));
        let v = cache.get_or_fetch("k", Duration::from_secs(60), || 2);
        assert_eq!(v, if expect_refetch { 2 } else { 1 });
    }

    #[test]
    fn hits_and_misses_are_tracked() {
        let cache: Cache<u32> = Cache::new();
        let calls = AtomicUsize::new(0);

        let v1 = cache.get_or_fetch("k", Duration::from_secs(60), || {
            calls.fetch_add(1, Ordering::Relaxed);
            42
        });
        assert_eq!(v1, 42);

        let v2 = cache.get_or_fetch("k", Duration::from_secs(60), || {
            calls.fetch_add(1, Ordering::Relaxed);
            99
        });
        assert_eq!(v2, 42);
        assert_eq!(calls.load(Ordering::Relaxed), 1);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn expired_entries_are_refetched() {
        let cache: Cache<u32> = Cache::new();
        cache.get_or_fetch("k", Duration::from_millis(1), || 1);
        std::thread::sleep(Duration::from_millis(10));
        let v = cache.get_or_fetch("k", Duration::from_secs(60), || 2);
        assert_eq!(v, 2);
    }

    #[test]
    fn invalidate_by_prefix_removes_matching_keys_only() {
        let cache: Cache<u32> = Cache::new();
        cache.get_or_fetch("repo:a:branches", Duration::from_secs(60), || 1);
        cache.get_or_fetch("repo:a:prs", Duration::from_secs(60), || 2);
        cache.get_or_fetch("repo:b:branches", Duration::from_secs(60), || 3);

        cache.invalidate_by_prefix("repo:a:");

        assert_eq!(cache.stats().entries, 1);
    }

    #[test]
    fn lru_eviction_respects_bound() {
        let cache: Cache<u32> = Cache::new();
        for i in 0..MAX_ENTRIES + 10 {
            cache.get_or_fetch(&format!("k{i}"), Duration::from_secs(60), || i as u32);
        }
        assert!(cache.stats().entries <= MAX_ENTRIES);
        assert!(cache.stats().evictions >= 10);
    }

    #[test]
    fn sweep_expired_counts_removed_entries() {
        let cache: Cache<u32> = Cache::new();
        cache.get_or_fetch("a", Duration::from_millis(1), || 1);
        cache.get_or_fetch("b", Duration::from_secs(60), || 2);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(cache.sweep_expired(), 1);
        assert_eq!(cache.stats().entries, 1);
    }
}
