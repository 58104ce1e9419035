//! Transfer engine (C6, §4.6).

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;

use crate::error::{Error, Result};
use crate::events::{Event, EventBus, TransferResult};
use crate::model::{new_transfer_key, SftpPriority, TransferKind, TransferProgress};
use crate::sftp::SftpChannelManager;

/// `format_bytes` from the reference app's formatting helper, generalized to
/// a free function with no locale/number-grouping dependency on the UI
/// layer (SPEC_FULL.md §F.4).
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes == 0 {
        return "0 B".to_string();
    }
    let mut size = bytes as f64;
    let mut unit = 0usize;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    let formatted = if unit == 0 { bytes.to_string() } else if size < 10.0 { format!("{size:.1}") } else { format!("{size:.0}") };
    format!("{formatted} {}", UNITS[unit])
}

/// Exponentially-weighted moving average over a window of `n` samples
/// (§4.6 "Chunking and backpressure").
struct SpeedEma {
    alpha: f64,
    value: Option<f64>,
}

impl SpeedEma {
    fn new(window: usize) -> Self {
        let window = window.max(1) as f64;
        Self { alpha: 2.0 / (window + 1.0), value: None }
    }

    fn sample(&mut self, instantaneous_bps: f64) -> f64 {
        let next = match self.value {
            Some(prev) => self.alpha * instantaneous_bps + (1.0 - self.alpha) * prev,
            None => instantaneous_bps,
        };
        self.value = Some(next);
        next
    }
}

fn remaining_time_sec(total: u64, transferred: u64, speed_bps: f64) -> f64 {
    let remaining_bytes = total.saturating_sub(transferred) as f64;
    remaining_bytes / speed_bps.max(1e-6)
}

struct ActiveTransfer {
    cancel: Arc<AtomicBool>,
}

/// Drives uploads/downloads over the SFTP channel with bounded in-flight
/// bytes and EWMA speed/ETA reporting (§4.6).
pub struct TransferEngine {
    sftp: Arc<SftpChannelManager>,
    events: Arc<EventBus>,
    chunk_size: usize,
    ema_window: usize,
    active: DashMap<String, ActiveTransfer>,
}

impl TransferEngine {
    pub fn new(sftp: Arc<SftpChannelManager>, events: Arc<EventBus>, chunk_size: usize, ema_window: usize) -> Arc<Self> {
        Arc::new(Self { sftp, events, chunk_size, ema_window, active: DashMap::new() })
    }

    /// §4.6 `cancelTransfer`. A no-op on an already-finished transfer still
    /// reports success (cleans up any lingering state on the caller's side).
    pub fn cancel_transfer(&self, transfer_key: &str) -> bool {
        if let Some(active) = self.active.get(transfer_key) {
            active.cancel.store(true, Ordering::SeqCst);
        }
        true
    }

    fn register(&self, transfer_key: &str) -> Arc<AtomicBool> {
        let cancel = Arc::new(AtomicBool::new(false));
        self.active.insert(transfer_key.to_string(), ActiveTransfer { cancel: Arc::clone(&cancel) });
        cancel
    }

    fn unregister(&self, transfer_key: &str) {
        self.active.remove(transfer_key);
    }

    pub async fn upload_file(self: &Arc<Self>, _tab_id: &str, local_path: PathBuf, remote_path: String) -> TransferResult {
        let transfer_key = new_transfer_key();
        self.events.emit(Event::TransferScheduled { transfer_key: transfer_key.clone(), kind: TransferKind::Upload });
        let cancel = self.register(&transfer_key);

        let total_bytes = fs::metadata(&local_path).map(|m| m.len()).unwrap_or(0);
        let result = self
            .run_single_file(&transfer_key, TransferDirection::Upload, local_path, remote_path, total_bytes, 0, 1, cancel)
            .await;

        self.unregister(&transfer_key);
        self.finish(&transfer_key, result)
    }

    pub async fn download_file(self: &Arc<Self>, _tab_id: &str, remote_path: String, local_path: PathBuf) -> TransferResult {
        let transfer_key = new_transfer_key();
        self.events.emit(Event::TransferScheduled { transfer_key: transfer_key.clone(), kind: TransferKind::Download });
        let cancel = self.register(&transfer_key);

        let total_bytes = self
            .sftp
            .with_channel(SftpPriority::Normal, {
                let remote_path = remote_path.clone();
                move |sftp| Ok(sftp.stat(Path::new(&remote_path)).ok().and_then(|s| s.size).unwrap_or(0))
            })
            .await
            .unwrap_or(0);

        let result = self
            .run_single_file(&transfer_key, TransferDirection::Download, local_path, remote_path, total_bytes, 0, 1, cancel)
            .await;

        self.unregister(&transfer_key);
        self.finish(&transfer_key, result)
    }

    pub async fn upload_folder(self: &Arc<Self>, _tab_id: &str, local_root: PathBuf, remote_root: String) -> TransferResult {
        let transfer_key = new_transfer_key();
        self.events.emit(Event::TransferScheduled { transfer_key: transfer_key.clone(), kind: TransferKind::UploadFolder });
        let cancel = self.register(&transfer_key);

        let files = collect_local_files(&local_root);
        let total_files = files.len() as u64;
        let mut failures: Vec<String> = Vec::new();

        for (index, file) in files.iter().enumerate() {
            if cancel.load(Ordering::SeqCst) {
                break;
            }
            let relative = file.strip_prefix(&local_root).unwrap_or(file);
            let remote_target = join_remote(&remote_root, relative);
            if let Some(parent) = relative.parent().filter(|p| !p.as_os_str().is_empty()) {
                let remote_parent = join_remote(&remote_root, parent);
                let _ = self.sftp.create_dir(remote_parent, SftpPriority::Normal).await;
            }

            let total_bytes = fs::metadata(file).map(|m| m.len()).unwrap_or(0);
            let outcome = self
                .run_single_file(
                    &transfer_key,
                    TransferDirection::Upload,
                    file.clone(),
                    remote_target,
                    total_bytes,
                    index as u64,
                    total_files,
                    Arc::clone(&cancel),
                )
                .await;
            if let Err(err) = outcome {
                if err.is_cancellation() {
                    break;
                }
                failures.push(format!("{}: {err}", file.display()));
            }
        }

        self.unregister(&transfer_key);
        let result = if cancel.load(Ordering::SeqCst) {
            Err(Error::Cancelled)
        } else if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::OperationError {
                message: format!("{} of {} files failed: {}", failures.len(), total_files, failures.join("; ")),
                context: Default::default(),
            })
        };
        self.finish_with_partial(&transfer_key, result, !failures.is_empty(), None)
    }

    pub async fn download_folder(self: &Arc<Self>, _tab_id: &str, remote_root: String, local_root: PathBuf) -> TransferResult {
        let transfer_key = new_transfer_key();
        self.events.emit(Event::TransferScheduled { transfer_key: transfer_key.clone(), kind: TransferKind::DownloadFolder });
        let cancel = self.register(&transfer_key);

        let files = match self.collect_remote_files(&remote_root).await {
            Ok(files) => files,
            Err(err) => {
                self.unregister(&transfer_key);
                return self.finish(&transfer_key, Err(err));
            }
        };
        let total_files = files.len() as u64;
        let mut failures: Vec<String> = Vec::new();

        for (index, (remote_file, size)) in files.iter().enumerate() {
            if cancel.load(Ordering::SeqCst) {
                break;
            }
            let relative = remote_file.strip_prefix(&remote_root).unwrap_or(remote_file).trim_start_matches('/');
            let local_target = local_root.join(relative);
            if let Some(parent) = local_target.parent() {
                let _ = fs::create_dir_all(parent);
            }

            let outcome = self
                .run_single_file(
                    &transfer_key,
                    TransferDirection::Download,
                    local_target,
                    remote_file.clone(),
                    *size,
                    index as u64,
                    total_files,
                    Arc::clone(&cancel),
                )
                .await;
            if let Err(err) = outcome {
                if err.is_cancellation() {
                    break;
                }
                failures.push(format!("{remote_file}: {err}"));
            }
        }

        self.unregister(&transfer_key);
        let result = if cancel.load(Ordering::SeqCst) {
            Err(Error::Cancelled)
        } else if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::OperationError {
                message: format!("{} of {} files failed: {}", failures.len(), total_files, failures.join("; ")),
                context: Default::default(),
            })
        };
        self.finish_with_partial(&transfer_key, result, !failures.is_empty(), Some(local_root.display().to_string()))
    }

    async fn collect_remote_files(&self, root: &str) -> Result<Vec<(String, u64)>> {
        let mut stack = vec![root.to_string()];
        let mut files = Vec::new();

        while let Some(dir) = stack.pop() {
            let entries = self.sftp.read_dir(dir.clone(), SftpPriority::Normal).await?;
            for entry in entries {
                if entry.name == "." || entry.name == ".." {
                    continue;
                }
                let child = format!("{}/{}", dir.trim_end_matches('/'), entry.name);
                if entry.is_directory {
                    stack.push(child);
                } else {
                    files.push((child, entry.size));
                }
            }
        }
        Ok(files)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_single_file(
        &self,
        transfer_key: &str,
        direction: TransferDirection,
        local_path: PathBuf,
        remote_path: String,
        total_bytes: u64,
        file_index: u64,
        total_files: u64,
        cancel: Arc<AtomicBool>,
    ) -> Result<()> {
        let chunk_size = self.chunk_size;
        let ema_window = self.ema_window;
        let transfer_key_owned = transfer_key.to_string();
        let file_name = local_path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();

        let (progress_tx, mut progress_rx) = tokio::sync::mpsc::unbounded_channel::<TransferProgress>();
        let events = Arc::clone(&self.events);
        let forwarder = tokio::spawn(async move {
            while let Some(progress) = progress_rx.recv().await {
                events.emit(Event::TransferProgress { progress });
            }
        });

        let outcome = self
            .sftp
            .with_channel(SftpPriority::Normal, move |sftp| {
                let mut ema = SpeedEma::new(ema_window);
                match direction {
                    TransferDirection::Upload => stream_upload(
                        sftp,
                        &local_path,
                        &remote_path,
                        chunk_size,
                        total_bytes,
                        file_index,
                        total_files,
                        &transfer_key_owned,
                        &file_name,
                        &cancel,
                        &mut ema,
                        &progress_tx,
                    ),
                    TransferDirection::Download => stream_download(
                        sftp,
                        &remote_path,
                        &local_path,
                        chunk_size,
                        total_bytes,
                        file_index,
                        total_files,
                        &transfer_key_owned,
                        &file_name,
                        &cancel,
                        &mut ema,
                        &progress_tx,
                    ),
                }
            })
            .await;

        let _ = forwarder.await;
        outcome
    }

    fn finish(&self, transfer_key: &str, outcome: Result<()>) -> TransferResult {
        self.finish_with_partial(transfer_key, outcome, false, None)
    }

    fn finish_with_partial(
        &self,
        transfer_key: &str,
        outcome: Result<()>,
        partial: bool,
        download_path: Option<String>,
    ) -> TransferResult {
        match outcome {
            Ok(()) => {
                let result = TransferResult {
                    transfer_key: transfer_key.to_string(),
                    success: true,
                    partial_success: partial,
                    warning: if partial { Some("some files failed to transfer".to_string()) } else { None },
                    error: None,
                    download_path,
                    message: None,
                };
                self.events.emit(Event::TransferCompleted { result: result.clone() });
                result
            }
            Err(err) if err.is_cancellation() => {
                self.events.emit(Event::TransferCancelled { transfer_key: transfer_key.to_string() });
                TransferResult {
                    transfer_key: transfer_key.to_string(),
                    success: false,
                    partial_success: false,
                    warning: None,
                    error: None,
                    download_path,
                    message: Some("cancelled".to_string()),
                }
            }
            Err(err) => {
                let message = err.to_string();
                self.events.emit(Event::TransferFailed { transfer_key: transfer_key.to_string(), error: message.clone() });
                TransferResult {
                    transfer_key: transfer_key.to_string(),
                    success: false,
                    partial_success: false,
                    warning: None,
                    error: Some(message),
                    download_path,
                    message: None,
                }
            }
        }
    }
}

#[derive(Clone, Copy)]
enum TransferDirection {
    Upload,
    Download,
}

fn join_remote(root: &str, relative: &Path) -> String {
    let relative = relative.to_string_lossy().replace('\\', "/");
    if relative.is_empty() {
        root.to_string()
    } else {
        format!("{}/{}", root.trim_end_matches('/'), relative)
    }
}

fn collect_local_files(root: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = fs::read_dir(&dir) else { continue };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                out.push(path);
            }
        }
    }
    out
}

#[allow(clippy::too_many_arguments)]
fn stream_upload(
    sftp: &ssh2::Sftp,
    local_path: &Path,
    remote_path: &str,
    chunk_size: usize,
    total_bytes: u64,
    file_index: u64,
    total_files: u64,
    transfer_key: &str,
    file_name: &str,
    cancel: &AtomicBool,
    ema: &mut SpeedEma,
    progress_tx: &tokio::sync::mpsc::UnboundedSender<TransferProgress>,
) -> Result<()> {
    use ssh2::{OpenFlags, OpenType};

    let mut local_file = fs::File::open(local_path)?;
    let mut remote_file = sftp
        .open_mode(Path::new(remote_path), OpenFlags::CREATE | OpenFlags::WRITE | OpenFlags::TRUNCATE, 0o644, OpenType::File)
        .map_err(Error::from)?;

    let mut buf = vec![0u8; chunk_size];
    let mut transferred: u64 = 0;
    loop {
        if cancel.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }
        let chunk_started = Instant::now();
        let n = local_file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        remote_file.write_all(&buf[..n]).map_err(Error::from)?;
        transferred += n as u64;

        report_progress(
            transfer_key, file_name, transferred, total_bytes, file_index, total_files, chunk_started, n, ema, progress_tx,
        );
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn stream_download(
    sftp: &ssh2::Sftp,
    remote_path: &str,
    local_path: &Path,
    chunk_size: usize,
    total_bytes: u64,
    file_index: u64,
    total_files: u64,
    transfer_key: &str,
    file_name: &str,
    cancel: &AtomicBool,
    ema: &mut SpeedEma,
    progress_tx: &tokio::sync::mpsc::UnboundedSender<TransferProgress>,
) -> Result<()> {
    let mut remote_file = sftp.open(Path::new(remote_path)).map_err(Error::from)?;
    if let Some(parent) = local_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut local_file = fs::File::create(local_path)?;

    let mut buf = vec![0u8; chunk_size];
    let mut transferred: u64 = 0;
    loop {
        if cancel.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }
        let chunk_started = Instant::now();
        let n = remote_file.read(&mut buf).map_err(Error::from)?;
        if n == 0 {
            break;
        }
        local_file.write_all(&buf[..n])?;
        transferred += n as u64;

        report_progress(
            transfer_key, file_name, transferred, total_bytes, file_index, total_files, chunk_started, n, ema, progress_tx,
        );
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn report_progress(
    transfer_key: &str,
    file_name: &str,
    transferred: u64,
    total_bytes: u64,
    file_index: u64,
    total_files: u64,
    chunk_started: Instant,
    chunk_len: usize,
    ema: &mut SpeedEma,
    progress_tx: &tokio::sync::mpsc::UnboundedSender<TransferProgress>,
) {
    let elapsed = chunk_started.elapsed().as_secs_f64().max(1e-6);
    let instantaneous_bps = chunk_len as f64 / elapsed;
    let speed = ema.sample(instantaneous_bps);
    let progress_pct = if total_bytes == 0 { 100.0 } else { (transferred as f64 / total_bytes as f64) * 100.0 };

    let progress = TransferProgress {
        transfer_key: transfer_key.to_string(),
        progress: progress_pct,
        file_name: file_name.to_string(),
        current_file: Some(file_name.to_string()),
        transferred_bytes: transferred,
        total_bytes,
        transfer_speed_bps: speed,
        remaining_time_sec: remaining_time_sec(total_bytes, transferred, speed),
        current_file_index: file_index,
        total_files,
    }
    .clamp();

    let _ = progress_tx.send(progress);
}

/// Retry `op` up to 3 times with linear `500ms * attempt` backoff, the way
/// `deleteFile`/`createFolder`/`createFile`/`renameFile` do on transient
/// SFTP errors (§4.6 "Retries inside operations").
pub async fn with_retry<F, Fut>(mut op: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(()) => return Ok(()),
            Err(err) if attempt < 3 => {
                tokio::time::sleep(std::time::Duration::from_millis(500 * attempt as u64)).await;
                attempt += 1;
                let _ = err;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_file_size_matches_reference_thresholds() {
        assert_eq!(format_file_size(0), "0 B");
        assert_eq!(format_file_size(512), "512 B");
        assert_eq!(format_file_size(1536), "1.5 KB");
        assert_eq!(format_file_size(15 * 1024), "15 KB");
    }

    #[test]
    fn ema_converges_toward_constant_input() {
        let mut ema = SpeedEma::new(10);
        let mut last = 0.0;
        for _ in 0..50 {
            last = ema.sample(1000.0);
        }
        assert!((last - 1000.0).abs() < 1.0);
    }

    #[test]
    fn remaining_time_uses_epsilon_floor_for_zero_speed() {
        let eta = remaining_time_sec(1000, 0, 0.0);
        assert!(eta.is_finite());
        assert!(eta > 0.0);
    }

    #[test]
    fn progress_clamp_prevents_over_100_percent() {
        let progress = TransferProgress {
            transfer_key: "t".into(),
            progress: 142.0,
            file_name: "f".into(),
            current_file: None,
            transferred_bytes: 200,
            total_bytes: 100,
            transfer_speed_bps: 10.0,
            remaining_time_sec: 0.0,
            current_file_index: 0,
            total_files: 1,
        }
        .clamp();
        assert_eq!(progress.progress, 100.0);
        assert_eq!(progress.transferred_bytes, 100);
    }
}
