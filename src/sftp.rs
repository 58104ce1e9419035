//! SFTP channel manager (C5, §4.5).
//!
//! Maintains at most one SFTP subchannel per session, fed by a single
//! dedicated worker thread (§5 "Scheduling model") that drains a 3-priority
//! queue. `ssh2`'s blocking API is the reason for the dedicated thread, the
//! same shape the teacher uses for its tunnel relay loop.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{Error, ErrorContext, Result};
use crate::events::{Event, EventBus};
use crate::model::{DirectoryEntry, SftpPriority};
use crate::pool::ConnectionPool;

type Thunk = Box<dyn FnOnce(std::result::Result<&ssh2::Sftp, Error>) + Send>;

struct Job {
    priority: SftpPriority,
    seq: u64,
    thunk: Thunk,
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for Job {}

impl PartialOrd for Job {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Job {
    /// Higher priority first; within a priority, earlier `seq` first. A
    /// `BinaryHeap` is a max-heap, so `seq` compares reversed.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority.cmp(&other.priority).then_with(|| other.seq.cmp(&self.seq))
    }
}

enum WorkerMessage {
    Run(Job),
    Shutdown,
}

/// Maintains the single SFTP subchannel for one session and serializes
/// access to it through a priority queue (§4.5).
pub struct SftpChannelManager {
    sender: std_mpsc::Sender<WorkerMessage>,
    seq: AtomicU64,
    pending_readdirs: Arc<Mutex<HashMap<String, Vec<oneshot::Sender<Result<Vec<DirectoryEntry>>>>>>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl SftpChannelManager {
    /// Spawns the worker thread. The SFTP channel itself is opened lazily on
    /// the first submitted operation, not here (§4.5 "lazily opened").
    pub fn new(pool: Arc<ConnectionPool>, events: Arc<EventBus>, session_key: String) -> Arc<Self> {
        let (tx, rx) = std_mpsc::channel::<WorkerMessage>();
        let heap: Arc<Mutex<BinaryHeap<Job>>> = Arc::new(Mutex::new(BinaryHeap::new()));

        let worker_heap = Arc::clone(&heap);
        let handle = thread::Builder::new()
            .name(format!("sftp-worker-{session_key}"))
            .spawn(move || run_worker(pool, session_key, events, rx, worker_heap))
            .expect("failed to spawn SFTP worker thread");

        Arc::new(Self {
            sender: tx,
            seq: AtomicU64::new(0),
            pending_readdirs: Arc::new(Mutex::new(HashMap::new())),
            worker: Mutex::new(Some(handle)),
        })
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn submit(&self, priority: SftpPriority, thunk: Thunk) {
        let job = Job { priority, seq: self.next_seq(), thunk };
        // Worker may have shut down (session closed); submitting after that
        // is a no-op rather than a panic (§4.8 "released with its owning
        // session").
        let _ = self.sender.send(WorkerMessage::Run(job));
    }

    /// List a directory. Two `readdir`s on the same path issued before the
    /// first one starts running collapse into a single channel round-trip
    /// and both callers get the same result (§4.5 `canMerge`).
    pub async fn read_dir(&self, path: String, priority: SftpPriority) -> Result<Vec<DirectoryEntry>> {
        let (tx, rx) = oneshot::channel();
        // Drop the lock before awaiting below — never hold it across an
        // await point.
        let is_first_waiter = {
            let mut pending = self.pending_readdirs.lock();
            if let Some(waiters) = pending.get_mut(&path) {
                waiters.push(tx);
                false
            } else {
                pending.insert(path.clone(), vec![tx]);
                true
            }
        };

        if is_first_waiter {
            let pending_readdirs = Arc::clone(&self.pending_readdirs);
            let target = path.clone();
            self.submit(
                priority,
                Box::new(move |sftp| {
                    let result = match sftp {
                        Ok(sftp) => run_read_dir(sftp, &target).map_err(Error::from),
                        Err(err) => Err(err),
                    };
                    let waiters = pending_readdirs.lock().remove(&target).unwrap_or_default();
                    for waiter in waiters {
                        let cloned = match &result {
                            Ok(entries) => Ok(entries.clone()),
                            Err(err) => Err(Error::OperationError { message: err.to_string(), context: ErrorContext::default() }),
                        };
                        let _ = waiter.send(cloned);
                    }
                }),
            );
        }

        rx.await.map_err(|_| Error::Cancelled)?
    }

    pub async fn create_dir(&self, path: String, priority: SftpPriority) -> Result<()> {
        self.run_unit(priority, move |sftp| sftp.mkdir(std::path::Path::new(&path), 0o755)).await
    }

    pub async fn remove_dir(&self, path: String, priority: SftpPriority) -> Result<()> {
        self.run_unit(priority, move |sftp| sftp.rmdir(std::path::Path::new(&path))).await
    }

    pub async fn remove_file(&self, path: String, priority: SftpPriority) -> Result<()> {
        self.run_unit(priority, move |sftp| sftp.unlink(std::path::Path::new(&path))).await
    }

    pub async fn rename(&self, from: String, to: String, priority: SftpPriority) -> Result<()> {
        self.run_unit(priority, move |sftp| {
            sftp.rename(std::path::Path::new(&from), std::path::Path::new(&to), None)
        })
        .await
    }

    pub async fn create_file(&self, path: String, priority: SftpPriority) -> Result<()> {
        self.run_unit(priority, move |sftp| {
            use ssh2::{OpenFlags, OpenType};
            sftp.open_mode(
                std::path::Path::new(&path),
                OpenFlags::CREATE | OpenFlags::WRITE | OpenFlags::TRUNCATE,
                0o644,
                OpenType::File,
            )
            .map(|_| ())
        })
        .await
    }

    async fn run_unit(
        &self,
        priority: SftpPriority,
        op: impl FnOnce(&ssh2::Sftp) -> std::result::Result<(), ssh2::Error> + Send + 'static,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.submit(
            priority,
            Box::new(move |sftp| {
                let result = match sftp {
                    Ok(sftp) => op(sftp).map_err(Error::from),
                    Err(err) => Err(err),
                };
                let _ = tx.send(result);
            }),
        );
        rx.await.map_err(|_| Error::Cancelled)?
    }

    /// Run an arbitrary SFTP-channel operation, for the transfer engine's
    /// chunked reads/writes which don't fit the fixed-operation shape above.
    pub async fn with_channel<R: Send + 'static>(
        &self,
        priority: SftpPriority,
        op: impl FnOnce(&ssh2::Sftp) -> Result<R> + Send + 'static,
    ) -> Result<R> {
        let (tx, rx) = oneshot::channel();
        self.submit(
            priority,
            Box::new(move |sftp| {
                let result = match sftp {
                    Ok(sftp) => op(sftp),
                    Err(err) => Err(err),
                };
                let _ = tx.send(result);
            }),
        );
        rx.await.map_err(|_| Error::Cancelled)?
    }

    /// Stop the worker thread; further submissions become no-ops. Called
    /// when the owning session is disposed (§4.5 "released with its owning
    /// session").
    pub fn shutdown(&self) {
        let _ = self.sender.send(WorkerMessage::Shutdown);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SftpChannelManager {
    fn drop(&mut self) {
        let _ = self.sender.send(WorkerMessage::Shutdown);
    }
}

fn run_read_dir(sftp: &ssh2::Sftp, path: &str) -> std::result::Result<Vec<DirectoryEntry>, ssh2::Error> {
    let listing = sftp.readdir(std::path::Path::new(path))?;
    Ok(listing
        .into_iter()
        .map(|(entry_path, stat)| DirectoryEntry {
            name: entry_path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
            is_directory: stat.is_dir(),
            size: stat.size.unwrap_or(0),
            modified: stat.mtime.and_then(|secs| chrono::DateTime::from_timestamp(secs as i64, 0)),
        })
        .collect())
}

fn run_worker(
    pool: Arc<ConnectionPool>,
    session_key: String,
    events: Arc<EventBus>,
    rx: std_mpsc::Receiver<WorkerMessage>,
    heap: Arc<Mutex<BinaryHeap<Job>>>,
) {
    let mut sftp: Option<ssh2::Sftp> = None;
    // Emit at most one `ConnectionClosed` per loss, not one per queued job.
    let mut transport_loss_reported = false;

    while let Ok(message) = rx.recv() {
        match message {
            WorkerMessage::Shutdown => break,
            WorkerMessage::Run(job) => {
                heap.lock().push(job);
            }
        }

        // Drain whatever else is already queued before touching the
        // channel, so a burst of submissions gets priority-ordered rather
        // than executed in arrival order.
        loop {
            let next = heap.lock().pop();
            let Some(job) = next else { break };

            if sftp.is_none() {
                sftp = pool.with_session(&session_key, |session| session.sftp().ok()).flatten();
            }

            match sftp.as_ref() {
                Some(channel) => {
                    transport_loss_reported = false;
                    (job.thunk)(Ok(channel));
                }
                None => {
                    // Session has no usable transport (closed/reconnecting).
                    // Reply with a typed error instead of dropping the job's
                    // reply sender, and surface the loss on the event bus so
                    // C4 can drive a reconnect even for SFTP-only sessions.
                    if !transport_loss_reported {
                        events.emit(Event::ConnectionClosed { session_key: session_key.clone(), intentional: false });
                        transport_loss_reported = true;
                    }
                    (job.thunk)(Err(Error::TransportUnavailable {
                        message: "SFTP channel unavailable".to_string(),
                        context: ErrorContext::new(session_key.clone()),
                    }));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(priority: SftpPriority, seq: u64) -> Job {
        Job { priority, seq, thunk: Box::new(|_| {}) }
    }

    #[test]
    fn high_priority_pops_before_normal_and_low() {
        let mut heap = BinaryHeap::new();
        heap.push(job(SftpPriority::Low, 0));
        heap.push(job(SftpPriority::Normal, 1));
        heap.push(job(SftpPriority::High, 2));

        assert_eq!(heap.pop().unwrap().priority, SftpPriority::High);
        assert_eq!(heap.pop().unwrap().priority, SftpPriority::Normal);
        assert_eq!(heap.pop().unwrap().priority, SftpPriority::Low);
    }

    #[test]
    fn same_priority_is_fifo_by_seq() {
        let mut heap = BinaryHeap::new();
        heap.push(job(SftpPriority::Normal, 5));
        heap.push(job(SftpPriority::Normal, 1));
        heap.push(job(SftpPriority::Normal, 3));

        assert_eq!(heap.pop().unwrap().seq, 1);
        assert_eq!(heap.pop().unwrap().seq, 3);
        assert_eq!(heap.pop().unwrap().seq, 5);
    }

    #[test]
    fn high_priority_submitted_later_still_preempts_pending_normal() {
        let mut heap = BinaryHeap::new();
        heap.push(job(SftpPriority::Normal, 0));
        heap.push(job(SftpPriority::Normal, 1));
        heap.push(job(SftpPriority::High, 2));

        assert_eq!(heap.pop().unwrap().priority, SftpPriority::High);
    }
}
