//! Data model shared by every component (§3).

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    #[default]
    Password,
    PrivateKey,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProxyKind {
    Http,
    Https,
    Socks4,
    Socks5,
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProxyKind::Http => "http",
            ProxyKind::Https => "https",
            ProxyKind::Socks4 => "socks4",
            ProxyKind::Socks5 => "socks5",
        };
        f.write_str(s)
    }
}

/// Explicit proxy material. `ProxyDescriptor::UseDefault` defers to the
/// process-wide default proxy (§4.1 resolution step 2).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ProxyDescriptor {
    UseDefault,
    Explicit(ExplicitProxy),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExplicitProxy {
    #[serde(rename = "type")]
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl ExplicitProxy {
    pub fn default_port(kind: &ProxyKind) -> u16 {
        match kind {
            ProxyKind::Http => 80,
            ProxyKind::Https => 443,
            ProxyKind::Socks4 | ProxyKind::Socks5 => 1080,
        }
    }
}

/// Identity and auth material for a connect target (§3 ConnectionDescriptor).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    #[serde(default, rename = "authType")]
    pub auth_type: AuthMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_path: Option<String>,
    #[serde(default)]
    pub enable_compression: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyDescriptor>,
    pub tab_id: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}

impl ConnectionDescriptor {
    /// §3 ConnectionKey format.
    pub fn connection_key(&self) -> String {
        let base = if let Some(tab_id) = &self.tab_id {
            format!("tab:{tab_id}:{}:{}:{}", self.host, self.port, self.username)
        } else {
            format!("{}:{}:{}", self.host, self.port, self.username)
        };
        match &self.proxy {
            Some(ProxyDescriptor::Explicit(p)) => {
                format!("{base}:proxy:{}:{}:{}", p.kind, p.host, p.port)
            }
            _ => base,
        }
    }

    /// Boolean-only view used in error context — never carries secrets (§4.3).
    pub fn redacted(&self) -> RedactedDescriptor {
        RedactedDescriptor {
            host: self.host.clone(),
            port: self.port,
            has_password: self.password.is_some(),
            has_private_key: self.private_key.is_some(),
            has_private_key_path: self.private_key_path.is_some(),
            has_proxy: matches!(self.proxy, Some(ProxyDescriptor::Explicit(_))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RedactedDescriptor {
    pub host: String,
    pub port: u16,
    pub has_password: bool,
    pub has_private_key: bool,
    pub has_private_key_path: bool,
    pub has_proxy: bool,
}

/// Per-descriptor usage stats the pool keeps alongside its MRU list (§4.2
/// "acquire... records per-descriptor usage stats and maintains an MRU list").
#[derive(Debug, Clone)]
pub struct ConnectionUsageStats {
    pub acquire_count: u64,
    pub first_acquired: Instant,
    pub last_acquired: Instant,
}

impl ConnectionUsageStats {
    pub fn new(now: Instant) -> Self {
        Self { acquire_count: 1, first_acquired: now, last_acquired: now }
    }

    pub fn record(&mut self, now: Instant) {
        self.acquire_count += 1;
        self.last_acquired = now;
    }
}

/// One live SSH session record owned by the pool (§3 PooledSession).
pub struct PooledSession {
    pub key: String,
    pub descriptor: ConnectionDescriptor,
    pub client: ssh2::Session,
    pub created_at: Instant,
    pub last_used: Instant,
    pub ref_count: u32,
    pub ready: bool,
    pub using_proxy: bool,
    pub intentional_close: bool,
    /// Bumped every time the underlying transport is swapped by C4, so stale
    /// event handlers bound to a superseded transport can detect staleness.
    pub generation: u64,
}

impl PooledSession {
    pub fn is_healthy(&self) -> bool {
        self.ready && !self.intentional_close
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectState {
    Idle,
    Pending,
    Reconnecting,
    Connected,
    Failed,
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Network,
    Authentication,
    Timeout,
    Resource,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct ReconnectAttempt {
    pub timestamp: Instant,
    pub success: bool,
    pub attempts: u32,
    pub duration: Option<std::time::Duration>,
    pub error: Option<String>,
}

/// C4's record per session (§3 ReconnectSession).
pub struct ReconnectSession {
    pub session_key: String,
    pub state: ReconnectState,
    pub retry_count: u32,
    pub last_attempt: Option<Instant>,
    pub last_error: Option<String>,
    pub history: std::collections::VecDeque<ReconnectAttempt>,
    /// Success rate over the last `transfer_speed_ema_window`-equivalent
    /// attempts, used by the adaptive delay multiplier.
    pub recent_success_rate: f64,
    /// Identifies the transport generation this state machine is currently
    /// bound to; events from a superseded generation are ignored (§4.4).
    pub generation: u64,
}

impl ReconnectSession {
    pub fn new(session_key: impl Into<String>) -> Self {
        Self {
            session_key: session_key.into(),
            state: ReconnectState::Idle,
            retry_count: 0,
            last_attempt: None,
            last_error: None,
            history: std::collections::VecDeque::with_capacity(32),
            recent_success_rate: 1.0,
            generation: 0,
        }
    }

    pub const HISTORY_CAP: usize = 32;

    pub fn push_history(&mut self, attempt: ReconnectAttempt) {
        if self.history.len() >= Self::HISTORY_CAP {
            self.history.pop_front();
        }
        self.history.push_back(attempt);
        self.recompute_success_rate();
    }

    fn recompute_success_rate(&mut self) {
        let window: Vec<&ReconnectAttempt> = self.history.iter().rev().take(10).collect();
        if window.is_empty() {
            self.recent_success_rate = 1.0;
            return;
        }
        let successes = window.iter().filter(|a| a.success).count();
        self.recent_success_rate = successes as f64 / window.len() as f64;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Upload,
    UploadFolder,
    Download,
    DownloadFolder,
}

/// Strongly-typed progress payload (§9 Design Notes: replaces the source's
/// positional callback).
#[derive(Debug, Clone)]
pub struct TransferProgress {
    pub transfer_key: String,
    pub progress: f64,
    pub file_name: String,
    pub current_file: Option<String>,
    pub transferred_bytes: u64,
    pub total_bytes: u64,
    pub transfer_speed_bps: f64,
    pub remaining_time_sec: f64,
    pub current_file_index: u64,
    pub total_files: u64,
}

impl TransferProgress {
    /// Clamp values into their documented ranges (§4.6).
    pub fn clamp(mut self) -> Self {
        self.progress = self.progress.clamp(0.0, 100.0);
        self.transferred_bytes = self.transferred_bytes.min(self.total_bytes);
        self
    }
}

pub struct Transfer {
    pub transfer_key: String,
    pub tab_id: String,
    pub kind: TransferKind,
    pub target_path: String,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub current_file_index: u64,
    pub total_files: u64,
    pub transfer_speed_bps: f64,
    pub remaining_time_sec: f64,
    pub start_time: Instant,
    pub is_cancelled: bool,
    pub cancel_in_progress: bool,
    pub partial_success: bool,
    pub error: Option<String>,
    pub warning: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    pub name: String,
    pub is_directory: bool,
    pub size: u64,
    pub modified: Option<chrono::DateTime<chrono::Utc>>,
}

/// `(tabId, normalizedPath) → {entries, timestamp}` cache record (§3).
#[derive(Debug, Clone)]
pub struct DirectoryCacheEntry {
    pub entries: Vec<DirectoryEntry>,
    pub timestamp: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SftpPriority {
    Low,
    Normal,
    High,
}

#[derive(Debug, Clone)]
pub struct TabReference {
    pub tab_id: String,
    pub key: String,
}

/// Opaque handle a caller uses to identify a session across one connect
/// attempt (not persisted by this crate — see GLOSSARY "Transfer key").
pub fn new_transfer_key() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(tab_id: Option<&str>) -> ConnectionDescriptor {
        ConnectionDescriptor {
            host: "10.0.0.5".into(),
            port: 22,
            username: "alice".into(),
            auth_type: AuthMethod::Password,
            password: Some("pw".into()),
            private_key: None,
            passphrase: None,
            private_key_path: None,
            enable_compression: false,
            proxy: None,
            tab_id: tab_id.map(str::to_string),
        }
    }

    #[test]
    fn connection_key_with_tab_id() {
        let d = descriptor(Some("t1"));
        assert_eq!(d.connection_key(), "tab:t1:10.0.0.5:22:alice");
    }

    #[test]
    fn connection_key_without_tab_id() {
        let d = descriptor(None);
        assert_eq!(d.connection_key(), "10.0.0.5:22:alice");
    }

    #[test]
    fn distinct_tab_ids_produce_distinct_keys() {
        let a = descriptor(Some("t1"));
        let b = descriptor(Some("t2"));
        assert_ne!(a.connection_key(), b.connection_key());
    }

    #[test]
    fn connection_key_includes_proxy() {
        let mut d = descriptor(Some("t1"));
        d.proxy = Some(ProxyDescriptor::Explicit(ExplicitProxy {
            kind: ProxyKind::Socks5,
            host: "127.0.0.1".into(),
            port: 1080,
            username: None,
            password: None,
        }));
        assert_eq!(d.connection_key(), "tab:t1:10.0.0.5:22:alice:proxy:socks5:127.0.0.1:1080");
    }

    #[test]
    fn redacted_descriptor_has_no_secrets() {
        let d = descriptor(Some("t1"));
        let r = d.redacted();
        assert!(r.has_password);
        assert!(!r.has_private_key);
    }
}
