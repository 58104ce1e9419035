//! Top-level facade (§9 Design Notes: one owned runtime, no global state).

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::task::JoinHandle;

use crate::cache::{DirectoryCache, RefreshFn};
use crate::config::CoreConfig;
use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::model::{ConnectionDescriptor, DirectoryEntry, PooledSession, SftpPriority};
use crate::pool::{AcquireOutcome, ConnectionPool};
use crate::reconnect::{ReconnectManager, RegisterOptions};
use crate::session::{self, HostKeyVerifier};
use crate::sftp::SftpChannelManager;
use crate::shell::{PtyRequest, ShellChannel};
use crate::transfer::TransferEngine;

fn sftp_channel_for(
    channels: &DashMap<String, Arc<SftpChannelManager>>,
    pool: &Arc<ConnectionPool>,
    events: &Arc<EventBus>,
    session_key: &str,
) -> Arc<SftpChannelManager> {
    channels
        .entry(session_key.to_string())
        .or_insert_with(|| SftpChannelManager::new(Arc::clone(pool), Arc::clone(events), session_key.to_string()))
        .clone()
}

/// Owns every component, a private runtime, and the background tasks that
/// wire them together (pool health sweep, C4-on-unexpected-close). A host
/// embeds one `SshCore`; there is no process-wide singleton.
pub struct SshCore {
    runtime: tokio::runtime::Runtime,
    pool: Arc<ConnectionPool>,
    reconnect: Arc<ReconnectManager>,
    events: Arc<EventBus>,
    cache: Arc<DirectoryCache>,
    sftp_channels: Arc<DashMap<String, Arc<SftpChannelManager>>>,
    transfer_engines: DashMap<String, Arc<TransferEngine>>,
    shells: DashMap<String, Arc<ShellChannel>>,
    config: CoreConfig,
    verifier: Arc<dyn HostKeyVerifier>,
    background: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl SshCore {
    pub fn new(config: CoreConfig, verifier: Arc<dyn HostKeyVerifier>) -> Result<Arc<Self>> {
        let runtime = tokio::runtime::Runtime::new()?;
        let pool = Arc::new(ConnectionPool::new(config.clone()));
        let events = Arc::new(EventBus::default());
        let reconnect = ReconnectManager::new(Arc::clone(&pool), Arc::clone(&events), config.clone(), Arc::clone(&verifier));
        let sftp_channels: Arc<DashMap<String, Arc<SftpChannelManager>>> = Arc::new(DashMap::new());

        let cache = {
            let channels = Arc::clone(&sftp_channels);
            let pool = Arc::clone(&pool);
            let events = Arc::clone(&events);
            let refresher: RefreshFn = Arc::new(move |tab_id: String, path: String| {
                let channels = Arc::clone(&channels);
                let pool = Arc::clone(&pool);
                let events = Arc::clone(&events);
                Box::pin(async move {
                    let session_key = pool.get_by_tab_id(&tab_id).ok_or_else(|| Error::TransportUnavailable {
                        message: "no active session for this tab".to_string(),
                        context: Default::default(),
                    })?;
                    let channel = sftp_channel_for(&channels, &pool, &events, &session_key);
                    channel.read_dir(path, SftpPriority::Normal).await
                })
            });
            DirectoryCache::new(&config, refresher)
        };

        let core = Arc::new(Self {
            runtime,
            pool,
            reconnect,
            events,
            cache,
            sftp_channels,
            transfer_engines: DashMap::new(),
            shells: DashMap::new(),
            config,
            verifier,
            background: std::sync::Mutex::new(Vec::new()),
        });

        core.spawn_background_tasks();
        Ok(core)
    }

    fn spawn_background_tasks(self: &Arc<Self>) {
        let handle = self.runtime.handle().clone();
        let mut background = self.background.lock().unwrap();

        let sweep_pool = Arc::clone(&self.pool);
        let sweep_interval = self.config.health_check_interval;
        background.push(handle.spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                ticker.tick().await;
                sweep_pool.sweep();
            }
        }));

        let this = Arc::clone(self);
        let mut unexpected_closes = self.events.subscribe();
        background.push(handle.spawn(async move {
            loop {
                match unexpected_closes.recv().await {
                    Ok(Event::ConnectionClosed { session_key, intentional: false }) => this.reconnect.resume(&session_key),
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
    }

    pub fn runtime_handle(&self) -> tokio::runtime::Handle {
        self.runtime.handle().clone()
    }

    pub fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.events)
    }

    /// Per-descriptor acquire count and first/last-use timestamps for the
    /// session behind `tab_id`, if any (§4.2 "usage stats").
    pub fn usage_stats(&self, tab_id: &str) -> Option<crate::model::ConnectionUsageStats> {
        let key = self.pool.get_by_tab_id(tab_id)?;
        self.pool.usage_stats(&key)
    }

    /// Acquire a session for `tab_id`, connecting if no healthy cached
    /// session exists yet (§4.2 `acquire`).
    pub async fn connect(self: &Arc<Self>, tab_id: impl Into<String>, mut descriptor: ConnectionDescriptor) -> Result<String> {
        let tab_id = tab_id.into();
        descriptor.tab_id = Some(tab_id.clone());
        let key = descriptor.connection_key();

        match self.pool.try_acquire(&key) {
            Some(AcquireOutcome::Ready) => {
                self.pool.add_tab_ref(tab_id, key.clone());
                return Ok(key);
            }
            Some(AcquireOutcome::Unhealthy) => {
                log::warn!("cached session {key} is unhealthy, running manual reconnect before rebuilding");
                if self.reconnect.manual_reconnect_and_wait(&key).await {
                    self.pool.try_acquire(&key);
                    self.pool.add_tab_ref(tab_id, key.clone());
                    return Ok(key);
                }
                log::warn!("manual reconnect for {key} failed, closing and creating a fresh session");
                self.pool.close(&key);
            }
            None => {}
        }

        let config = self.config.clone();
        let verifier = Arc::clone(&self.verifier);
        let establish_descriptor = descriptor.clone();
        let established = tokio::task::spawn_blocking(move || session::establish(&establish_descriptor, &config, verifier.as_ref()))
            .await
            .map_err(|e| Error::OperationError { message: e.to_string(), context: Default::default() })??;

        let pooled = PooledSession {
            key: key.clone(),
            descriptor: descriptor.clone(),
            client: established.session,
            created_at: Instant::now(),
            last_used: Instant::now(),
            ref_count: 0,
            ready: true,
            using_proxy: established.using_proxy,
            intentional_close: false,
            generation: 0,
        };
        self.pool.insert(key.clone(), pooled)?;
        self.pool.try_acquire(&key);
        self.pool.add_tab_ref(tab_id, key.clone());

        log::info!("connected session {key} (proxy: {})", established.using_proxy);
        self.events.emit(Event::ConnectionCreated { session_key: key.clone(), using_proxy: established.using_proxy });
        self.reconnect.register_session(key.clone(), descriptor, RegisterOptions::default());
        Ok(key)
    }

    /// Release a tab's reference, close its shell and drop its cached
    /// listings. Does not abandon C4 bookkeeping — a reconnect already in
    /// flight for this session still runs to completion.
    pub fn disconnect(&self, tab_id: &str) {
        if let Some(key) = self.pool.get_by_tab_id(tab_id) {
            log::debug!("disconnecting tab {tab_id} from session {key}");
            self.pool.release(&key, Some(tab_id));
        }
        if let Some((_, shell)) = self.shells.remove(tab_id) {
            shell.close();
        }
        self.cache.clear_tab(tab_id);
    }

    fn session_key_for(&self, tab_id: &str) -> Result<String> {
        self.pool.get_by_tab_id(tab_id).ok_or_else(|| Error::TransportUnavailable {
            message: "no active session for this tab".to_string(),
            context: Default::default(),
        })
    }

    fn transfer_engine_for(&self, session_key: &str) -> Arc<TransferEngine> {
        self.transfer_engines
            .entry(session_key.to_string())
            .or_insert_with(|| {
                let channel = sftp_channel_for(&self.sftp_channels, &self.pool, &self.events, session_key);
                TransferEngine::new(channel, Arc::clone(&self.events), self.config.sftp_chunk_size, self.config.transfer_speed_ema_window)
            })
            .clone()
    }

    pub async fn upload_file(&self, tab_id: &str, local_path: std::path::PathBuf, remote_path: String) -> Result<crate::events::TransferResult> {
        let session_key = self.session_key_for(tab_id)?;
        Ok(self.transfer_engine_for(&session_key).upload_file(tab_id, local_path, remote_path).await)
    }

    pub async fn upload_folder(&self, tab_id: &str, local_root: std::path::PathBuf, remote_root: String) -> Result<crate::events::TransferResult> {
        let session_key = self.session_key_for(tab_id)?;
        Ok(self.transfer_engine_for(&session_key).upload_folder(tab_id, local_root, remote_root).await)
    }

    pub async fn download_file(&self, tab_id: &str, remote_path: String, local_path: std::path::PathBuf) -> Result<crate::events::TransferResult> {
        let session_key = self.session_key_for(tab_id)?;
        Ok(self.transfer_engine_for(&session_key).download_file(tab_id, remote_path, local_path).await)
    }

    pub async fn download_folder(&self, tab_id: &str, remote_root: String, local_root: std::path::PathBuf) -> Result<crate::events::TransferResult> {
        let session_key = self.session_key_for(tab_id)?;
        Ok(self.transfer_engine_for(&session_key).download_folder(tab_id, remote_root, local_root).await)
    }

    pub fn cancel_transfer(&self, tab_id: &str, transfer_key: &str) -> Result<bool> {
        let session_key = self.session_key_for(tab_id)?;
        Ok(self.transfer_engine_for(&session_key).cancel_transfer(transfer_key))
    }

    /// §4.7 directory listing, served from cache when fresh.
    pub async fn list_dir(&self, tab_id: &str, path: &str) -> Result<Vec<DirectoryEntry>> {
        self.cache.get_or_fetch(tab_id, path).await
    }

    /// Schedule a silent background refresh, e.g. after a mutation in this
    /// directory (§4.7).
    pub fn refresh_dir(&self, tab_id: &str, path: &str) {
        self.cache.schedule_refresh(tab_id, path);
    }

    pub async fn create_dir(&self, tab_id: &str, path: String) -> Result<()> {
        let session_key = self.session_key_for(tab_id)?;
        let channel = sftp_channel_for(&self.sftp_channels, &self.pool, &self.events, &session_key);
        crate::transfer::with_retry(|| {
            let channel = Arc::clone(&channel);
            let path = path.clone();
            async move { channel.create_dir(path, SftpPriority::Normal).await }
        })
        .await
    }

    pub async fn delete_file(&self, tab_id: &str, path: String) -> Result<()> {
        let session_key = self.session_key_for(tab_id)?;
        let channel = sftp_channel_for(&self.sftp_channels, &self.pool, &self.events, &session_key);
        crate::transfer::with_retry(|| {
            let channel = Arc::clone(&channel);
            let path = path.clone();
            async move { channel.remove_file(path, SftpPriority::Normal).await }
        })
        .await
    }

    pub async fn rename_file(&self, tab_id: &str, from: String, to: String) -> Result<()> {
        let session_key = self.session_key_for(tab_id)?;
        let channel = sftp_channel_for(&self.sftp_channels, &self.pool, &self.events, &session_key);
        crate::transfer::with_retry(|| {
            let channel = Arc::clone(&channel);
            let from = from.clone();
            let to = to.clone();
            async move { channel.rename(from, to, SftpPriority::Normal).await }
        })
        .await
    }

    pub async fn create_file(&self, tab_id: &str, path: String) -> Result<()> {
        let session_key = self.session_key_for(tab_id)?;
        let channel = sftp_channel_for(&self.sftp_channels, &self.pool, &self.events, &session_key);
        crate::transfer::with_retry(|| {
            let channel = Arc::clone(&channel);
            let path = path.clone();
            async move { channel.create_file(path, SftpPriority::Normal).await }
        })
        .await
    }

    /// Open an interactive PTY for `tab_id` on its existing session (§4.8).
    pub async fn open_shell(self: &Arc<Self>, tab_id: &str, request: PtyRequest) -> Result<Arc<ShellChannel>> {
        let session_key = self.session_key_for(tab_id)?;
        let generation = self.pool.generation(&session_key).unwrap_or(0);
        let shell = ShellChannel::open(Arc::clone(&self.pool), session_key, Arc::clone(&self.events), request, generation).await?;
        self.shells.insert(tab_id.to_string(), Arc::clone(&shell));
        Ok(shell)
    }

    pub fn shell_write(&self, tab_id: &str, data: Vec<u8>) -> Result<()> {
        self.shells
            .get(tab_id)
            .ok_or_else(|| Error::OperationError { message: "no shell open for this tab".to_string(), context: Default::default() })?
            .write(data)
    }

    pub fn shell_resize(&self, tab_id: &str, cols: u32, rows: u32) -> Result<()> {
        self.shells
            .get(tab_id)
            .ok_or_else(|| Error::OperationError { message: "no shell open for this tab".to_string(), context: Default::default() })?
            .resize(cols, rows)
    }

    pub fn close_shell(&self, tab_id: &str) {
        if let Some((_, shell)) = self.shells.remove(tab_id) {
            shell.close();
        }
    }

    /// Stop background tasks. In-flight transfers/reconnects are not
    /// forcibly aborted; dropping the returned `Arc` afterwards tears down
    /// the runtime.
    pub fn shutdown(&self) {
        log::info!("shutting down core, closing {} pooled session(s)", self.pool.len());
        for handle in self.background.lock().unwrap().drain(..) {
            handle.abort();
        }
        for key in self.pool.keys() {
            self.pool.close(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::AcceptAllHostKeys;

    #[test]
    fn new_core_has_an_empty_pool() {
        let core = SshCore::new(CoreConfig::default(), Arc::new(AcceptAllHostKeys)).unwrap();
        assert_eq!(core.pool.len(), 0);
        core.shutdown();
    }
}
