//! Directory listing cache (C7, §4.7).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::config::CoreConfig;
use crate::error::Result;
use crate::model::{DirectoryCacheEntry, DirectoryEntry};

type RefreshFuture = Pin<Box<dyn Future<Output = Result<Vec<DirectoryEntry>>> + Send>>;

/// Fetches a fresh listing for `(tabId, path)`, e.g. by routing to the
/// owning session's `SftpChannelManager::read_dir` (§4.5). Supplied by
/// the caller that wires this crate's components together, so this module
/// stays independent of how a tab maps to a session.
pub type RefreshFn = Arc<dyn Fn(String, String) -> RefreshFuture + Send + Sync>;

fn normalize_path(path: &str) -> String {
    if path.len() > 1 { path.trim_end_matches('/').to_string() } else { path.to_string() }
}

/// `(tabId, normalizedPath) → {entries, timestamp}`, TTL 10s, with
/// debounced silent background refresh after a mutation (§4.7).
pub struct DirectoryCache {
    entries: DashMap<(String, String), DirectoryCacheEntry>,
    ttl: Duration,
    debounce: Duration,
    refresh_timeout: Duration,
    refresher: RefreshFn,
    /// Guards against piling up multiple debounced refreshes for the same
    /// key while one is already scheduled.
    refresh_pending: DashMap<(String, String), ()>,
}

impl DirectoryCache {
    pub fn new(config: &CoreConfig, refresher: RefreshFn) -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
            ttl: config.directory_cache_ttl,
            debounce: config.directory_cache_debounce,
            refresh_timeout: config.directory_cache_refresh_timeout,
            refresher,
            refresh_pending: DashMap::new(),
        })
    }

    /// A fresh-enough entry if present, without going to the network.
    pub fn get(&self, tab_id: &str, path: &str) -> Option<Vec<DirectoryEntry>> {
        let key = (tab_id.to_string(), normalize_path(path));
        let entry = self.entries.get(&key)?;
        if entry.timestamp.elapsed() <= self.ttl {
            Some(entry.entries.clone())
        } else {
            None
        }
    }

    /// Cache hit skips the round trip; on miss, fetches and populates the
    /// cache (§4.7 "On cache hit within TTL").
    pub async fn get_or_fetch(&self, tab_id: &str, path: &str) -> Result<Vec<DirectoryEntry>> {
        if let Some(cached) = self.get(tab_id, path) {
            return Ok(cached);
        }
        let key = (tab_id.to_string(), normalize_path(path));
        let entries = (self.refresher)(key.0.clone(), key.1.clone()).await?;
        self.entries.insert(key, DirectoryCacheEntry { entries: entries.clone(), timestamp: Instant::now() });
        Ok(entries)
    }

    /// Evict a single entry, forcing the next `get_or_fetch` to hit the
    /// network (§4.7 "Eviction on explicit refresh").
    pub fn evict(&self, tab_id: &str, path: &str) {
        self.entries.remove(&(tab_id.to_string(), normalize_path(path)));
    }

    /// Drop every entry belonging to a tab (§4.7 "full clear on tab
    /// disposal").
    pub fn clear_tab(&self, tab_id: &str) {
        self.entries.retain(|(entry_tab, _), _| entry_tab != tab_id);
        self.refresh_pending.retain(|(entry_tab, _), _| entry_tab != tab_id);
    }

    /// Low-priority silent refresh after a user-initiated mutation,
    /// debounced 300ms and racing a 3-second timeout; failure is swallowed
    /// (§4.7). A second call for the same key while one is already pending
    /// is a no-op — the in-flight debounce will pick up the latest state
    /// when it fires.
    pub fn schedule_refresh(self: &Arc<Self>, tab_id: &str, path: &str) {
        let key = (tab_id.to_string(), normalize_path(path));
        if self.refresh_pending.insert(key.clone(), ()).is_some() {
            return;
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(this.debounce).await;
            this.refresh_pending.remove(&key);

            let fetch = (this.refresher)(key.0.clone(), key.1.clone());
            match tokio::time::timeout(this.refresh_timeout, fetch).await {
                Ok(Ok(entries)) => {
                    this.entries.insert(key, DirectoryCacheEntry { entries, timestamp: Instant::now() });
                }
                // Timed out or the fetch itself failed: leave the stale
                // entry (if any) in place rather than evicting it.
                Ok(Err(_)) | Err(_) => {}
            }
        });
    }
}
