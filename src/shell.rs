//! Interactive shell channel (C8, §4.8).
//!
//! Like C5, `ssh2::Channel` is blocking, so the PTY pump runs on its own
//! dedicated OS thread rather than being juggled onto the async runtime per
//! read/write. Unlike C5 it isn't a shared subchannel serving many callers —
//! one `ShellChannel` is one PTY for the lifetime of a tab's terminal view.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex as AsyncMutex};

use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::pool::ConnectionPool;

/// Caller-supplied PTY parameters (§4.8 "caller-supplied `{term, cols, rows}`").
#[derive(Debug, Clone)]
pub struct PtyRequest {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
}

enum ShellCommand {
    Write(Vec<u8>),
    Resize(u32, u32),
    Shutdown,
}

/// How long the pump thread waits for a queued command before polling the
/// channel for output again. Keeps input latency low without busy-spinning.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// One interactive PTY bound to a session's transport (§4.8).
pub struct ShellChannel {
    session_key: String,
    commands: std_mpsc::Sender<ShellCommand>,
    output_rx: AsyncMutex<tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>>,
    /// Set before tearing down on purpose, so the worker's close event
    /// reports `intentional: true` instead of tripping C4 (§4.8).
    intentional_close: Arc<AtomicBool>,
    generation: u64,
    worker: std::sync::Mutex<Option<thread::JoinHandle<()>>>,
}

impl ShellChannel {
    /// Open a PTY on `session_key`'s transport. `generation` identifies the
    /// transport this channel is bound to, mirroring C4's generation guard
    /// so a caller can tell a stale channel apart from a fresh one opened
    /// after a reconnect.
    pub async fn open(
        pool: Arc<ConnectionPool>,
        session_key: String,
        events: Arc<EventBus>,
        request: PtyRequest,
        generation: u64,
    ) -> Result<Arc<Self>> {
        let (cmd_tx, cmd_rx) = std_mpsc::channel::<ShellCommand>();
        let (output_tx, output_rx) = tokio::sync::mpsc::unbounded_channel::<Vec<u8>>();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();
        let intentional_close = Arc::new(AtomicBool::new(false));

        let worker_key = session_key.clone();
        let worker_intentional = Arc::clone(&intentional_close);
        let worker_events = Arc::clone(&events);
        let handle = thread::Builder::new()
            .name(format!("shell-worker-{session_key}"))
            .spawn(move || run_worker(pool, worker_key, request, cmd_rx, output_tx, ready_tx, worker_intentional, worker_events))
            .map_err(|e| Error::OperationError { message: e.to_string(), context: Default::default() })?;

        ready_rx.await.map_err(|_| Error::Cancelled)??;

        Ok(Arc::new(Self {
            session_key,
            commands: cmd_tx,
            output_rx: AsyncMutex::new(output_rx),
            intentional_close,
            generation,
            worker: std::sync::Mutex::new(Some(handle)),
        }))
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    /// Queue bytes of terminal input. Never blocks the caller on I/O.
    pub fn write(&self, data: Vec<u8>) -> Result<()> {
        self.commands.send(ShellCommand::Write(data)).map_err(|_| Error::OperationError {
            message: "shell channel is closed".to_string(),
            context: Default::default(),
        })
    }

    /// Propagate a terminal resize as an SSH window-change request (§4.8).
    pub fn resize(&self, cols: u32, rows: u32) -> Result<()> {
        self.commands.send(ShellCommand::Resize(cols, rows)).map_err(|_| Error::OperationError {
            message: "shell channel is closed".to_string(),
            context: Default::default(),
        })
    }

    /// Await the next chunk of terminal output, or `None` once the channel
    /// has closed and drained.
    pub async fn recv(&self) -> Option<Vec<u8>> {
        self.output_rx.lock().await.recv().await
    }

    /// Dispose the tab's terminal: an intentional close, so the worker's
    /// close event does not trigger C4 (§4.8).
    pub fn close(&self) {
        self.intentional_close.store(true, Ordering::SeqCst);
        let _ = self.commands.send(ShellCommand::Shutdown);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ShellChannel {
    fn drop(&mut self) {
        let _ = self.commands.send(ShellCommand::Shutdown);
    }
}

fn run_worker(
    pool: Arc<ConnectionPool>,
    session_key: String,
    request: PtyRequest,
    commands: std_mpsc::Receiver<ShellCommand>,
    output_tx: tokio::sync::mpsc::UnboundedSender<Vec<u8>>,
    ready_tx: oneshot::Sender<Result<()>>,
    intentional_close: Arc<AtomicBool>,
    events: Arc<EventBus>,
) {
    use std::io::{Read, Write};

    let opened = pool.with_session(&session_key, |session| -> Result<ssh2::Channel> {
        let mut channel = session.channel_session()?;
        channel.request_pty(&request.term, None, Some((request.cols, request.rows, 0, 0)))?;
        channel.shell()?;
        session.set_blocking(false);
        Ok(channel)
    });

    let mut channel = match opened {
        Some(Ok(channel)) => {
            let _ = ready_tx.send(Ok(()));
            channel
        }
        Some(Err(err)) => {
            let _ = ready_tx.send(Err(err));
            return;
        }
        None => {
            let _ = ready_tx.send(Err(Error::TransportUnavailable {
                message: "session not found in pool".to_string(),
                context: Default::default(),
            }));
            return;
        }
    };

    let mut buf = [0u8; 8192];
    loop {
        match commands.recv_timeout(POLL_INTERVAL) {
            Ok(ShellCommand::Write(data)) => {
                let _ = channel.write_all(&data);
            }
            Ok(ShellCommand::Resize(cols, rows)) => {
                let _ = channel.request_pty_size(cols, rows, None, None);
            }
            Ok(ShellCommand::Shutdown) => break,
            Err(std_mpsc::RecvTimeoutError::Timeout) => {}
            Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
        }

        match channel.read(&mut buf) {
            Ok(0) => {
                if channel.eof() {
                    break;
                }
            }
            Ok(n) => {
                let _ = output_tx.send(buf[..n].to_vec());
            }
            Err(err) if would_block(&err) => {}
            Err(_) => break,
        }
    }

    let _ = channel.close();
    events.emit(Event::ConnectionClosed { session_key, intentional: intentional_close.load(Ordering::SeqCst) });
}

fn would_block(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::WouldBlock
}
