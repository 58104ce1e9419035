//! Connection pool (C2, §4.2).

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::config::CoreConfig;
use crate::error::{Error, Result};
use crate::model::{ConnectionDescriptor, ConnectionUsageStats, PooledSession};

const MRU_CAPACITY: usize = 10;

/// Reference-counted map of live SSH sessions keyed by `ConnectionKey` (§3).
pub struct ConnectionPool {
    config: CoreConfig,
    sessions: DashMap<String, PooledSession>,
    /// `tabId → key`; a tab may reference at most one key at a time, values
    /// may repeat across tabs (§3 TabReference).
    tab_refs: Mutex<HashMap<String, String>>,
    mru: Mutex<VecDeque<String>>,
    /// Per-descriptor acquire counters, alongside the MRU list (§4.2
    /// "acquire" — "records per-descriptor usage stats").
    usage_stats: DashMap<String, ConnectionUsageStats>,
}

impl ConnectionPool {
    pub fn new(config: CoreConfig) -> Self {
        Self {
            config,
            sessions: DashMap::new(),
            tab_refs: Mutex::new(HashMap::new()),
            mru: Mutex::new(VecDeque::new()),
            usage_stats: DashMap::new(),
        }
    }

    /// Insert a freshly-built session, enforcing `MaxConnections` with
    /// idle eviction before giving up (§4.2 `acquire` steps 2-4).
    pub fn insert(&self, key: String, session: PooledSession) -> Result<()> {
        if self.sessions.len() >= self.config.max_connections && !self.sessions.contains_key(&key) {
            if !self.evict_one_idle() {
                return Err(Error::PoolExhausted);
            }
        }
        self.touch_mru(&key);
        self.sessions.insert(key, session);
        Ok(())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.sessions.contains_key(key)
    }

    /// `true` if a cached session for `key` is healthy and ready; increments
    /// `refCount` and bumps `lastUsed` as a side effect of a successful
    /// acquire (§4.2).
    pub fn try_acquire(&self, key: &str) -> Option<AcquireOutcome> {
        let mut entry = self.sessions.get_mut(key)?;
        if !entry.is_healthy() {
            return Some(AcquireOutcome::Unhealthy);
        }
        let now = Instant::now();
        entry.ref_count += 1;
        entry.last_used = now;
        self.touch_mru(key);
        self.record_usage(key, now);
        Some(AcquireOutcome::Ready)
    }

    fn record_usage(&self, key: &str, now: Instant) {
        self.usage_stats
            .entry(key.to_string())
            .and_modify(|stats| stats.record(now))
            .or_insert_with(|| ConnectionUsageStats::new(now));
    }

    /// Per-descriptor acquire count and first/last-use timestamps, if this
    /// key has ever been successfully acquired (§4.2 "usage stats").
    pub fn usage_stats(&self, key: &str) -> Option<ConnectionUsageStats> {
        self.usage_stats.get(key).map(|entry| entry.clone())
    }

    /// Decrement `refCount` (floored at 0), update `lastUsed`, optionally
    /// drop a tab reference, and close immediately if nothing references the
    /// session anymore (§4.2 `release`).
    pub fn release(&self, key: &str, tab_id: Option<&str>) {
        if let Some(tab_id) = tab_id {
            self.tab_refs.lock().remove(tab_id);
        }

        let should_close = {
            let Some(mut entry) = self.sessions.get_mut(key) else { return };
            entry.ref_count = entry.ref_count.saturating_sub(1);
            entry.last_used = Instant::now();
            entry.ref_count == 0 && !self.has_tab_ref(key)
        };

        if should_close {
            self.close(key);
        }
    }

    pub fn add_tab_ref(&self, tab_id: impl Into<String>, key: impl Into<String>) {
        self.tab_refs.lock().insert(tab_id.into(), key.into());
    }

    pub fn get_by_tab_id(&self, tab_id: &str) -> Option<String> {
        if let Some(key) = self.tab_refs.lock().get(tab_id).cloned() {
            return Some(key);
        }
        let prefix = format!("tab:{tab_id}:");
        self.sessions.iter().find(|entry| entry.key().starts_with(&prefix)).map(|e| e.key().clone())
    }

    fn has_tab_ref(&self, key: &str) -> bool {
        self.tab_refs.lock().values().any(|v| v == key)
    }

    /// Mark `intentionalClose` before tearing down so C4 ignores the
    /// resulting close event (§3 PooledSession invariant, §5 cancellation).
    /// Idempotent (§8 round-trip law).
    pub fn close(&self, key: &str) {
        if let Some((_, mut session)) = self.sessions.remove(key) {
            session.intentional_close = true;
        }
    }

    pub fn ref_count(&self, key: &str) -> Option<u32> {
        self.sessions.get(key).map(|s| s.ref_count)
    }

    pub fn generation(&self, key: &str) -> Option<u64> {
        self.sessions.get(key).map(|s| s.generation)
    }

    /// Run `f` against the live transport for `key`, e.g. to open an SFTP
    /// or shell channel (C5/C8). `None` if the session isn't in the pool.
    pub fn with_session<R>(&self, key: &str, f: impl FnOnce(&ssh2::Session) -> R) -> Option<R> {
        self.sessions.get(key).map(|entry| f(&entry.client))
    }

    /// Atomically swap in a freshly-validated transport for an existing
    /// entry, bumping `generation` so stale event handlers bound to the old
    /// transport can detect they've been superseded (§4.4 "Execute
    /// reconnect"). `refCount`/tab references are left untouched. Returns
    /// the new generation, or `None` if `key` isn't present.
    pub fn swap_transport(&self, key: &str, client: ssh2::Session, using_proxy: bool) -> Option<u64> {
        let mut entry = self.sessions.get_mut(key)?;
        entry.client = client;
        entry.using_proxy = using_proxy;
        entry.ready = true;
        entry.intentional_close = false;
        entry.last_used = Instant::now();
        entry.generation += 1;
        Some(entry.generation)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Every `HealthCheckInterval`: close unhealthy sessions and sessions
    /// idle past `IdleTimeout` with no remaining tab references (§4.2
    /// "Health").
    pub fn sweep(&self) {
        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| {
                let session = entry.value();
                !session.is_healthy()
                    || (session.ref_count == 0
                        && !self.has_tab_ref(entry.key())
                        && session.last_used.elapsed() > self.config.idle_timeout)
            })
            .map(|entry| entry.key().clone())
            .collect();

        if !stale.is_empty() {
            log::debug!("sweep closing {} stale session(s)", stale.len());
        }
        for key in stale {
            self.close(&key);
        }
    }

    fn evict_one_idle(&self) -> bool {
        let idle_key = self
            .sessions
            .iter()
            .filter(|entry| entry.value().ref_count == 0 && !self.has_tab_ref(entry.key()))
            .min_by_key(|entry| entry.value().last_used)
            .map(|entry| entry.key().clone());

        match idle_key {
            Some(key) => {
                log::debug!("evicting idle session {key} to honor max_connections");
                self.close(&key);
                true
            }
            None => false,
        }
    }

    fn touch_mru(&self, key: &str) {
        let mut mru = self.mru.lock();
        mru.retain(|existing| existing != key);
        mru.push_front(key.to_string());
        mru.truncate(MRU_CAPACITY);
    }

    pub fn mru(&self) -> Vec<String> {
        self.mru.lock().iter().cloned().collect()
    }

    /// Every key currently in the pool, regardless of MRU tracking —
    /// used by full teardown (`SshCore::shutdown`).
    pub fn keys(&self) -> Vec<String> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }
}

pub enum AcquireOutcome {
    Ready,
    Unhealthy,
}

pub fn descriptor_key(descriptor: &ConnectionDescriptor) -> String {
    descriptor.connection_key()
}
