//! Event bus (C9, §4.9).

use std::time::Duration;

use tokio::sync::broadcast;

use crate::model::{TransferKind, TransferProgress};

/// Outcome payload for `transferCompleted` (§4.6 "Result").
#[derive(Debug, Clone)]
pub struct TransferResult {
    pub transfer_key: String,
    pub success: bool,
    pub partial_success: bool,
    pub warning: Option<String>,
    pub error: Option<String>,
    pub download_path: Option<String>,
    pub message: Option<String>,
}

/// Every event this crate emits (§4.9). Kept as one enum so a single
/// broadcast channel carries the whole stream in order.
#[derive(Debug, Clone)]
pub enum Event {
    SessionRegistered { session_key: String },
    ConnectionCreated { session_key: String, using_proxy: bool },
    ConnectionReplaced { session_key: String, generation: u64 },
    ConnectionClosed { session_key: String, intentional: bool },

    ReconnectScheduled { session_key: String, delay: Duration, retry_count: u32, max_retries: u32 },
    ReconnectStarted { session_key: String, retry_count: u32 },
    ReconnectSuccess { session_key: String, attempts: u32 },
    /// `error` is already sanitized for display — never an internal
    /// exception message (§4.4 "Execute reconnect").
    ReconnectFailed { session_key: String, error: String, attempts: u32, max_retries: u32 },
    ReconnectAbandoned { session_key: String },

    TransferScheduled { transfer_key: String, kind: TransferKind },
    TransferProgress { progress: TransferProgress },
    TransferCompleted { result: TransferResult },
    TransferCancelled { transfer_key: String },
    TransferFailed { transfer_key: String, error: String },
}

/// Multi-producer multi-consumer broadcast of every `Event` the crate
/// emits. One bus per `SshCore` instance — no global singleton (§9 Design
/// Notes).
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Dropped silently if there are no subscribers, mirroring
    /// `tokio::sync::broadcast`'s semantics — callers that care about an
    /// event must already be subscribed before it fires.
    pub fn emit(&self, event: Event) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_emitted_event() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.emit(Event::SessionRegistered { session_key: "k".into() });
        let received = rx.recv().await.unwrap();
        assert!(matches!(received, Event::SessionRegistered { session_key } if session_key == "k"));
    }

    #[tokio::test]
    async fn transfer_terminal_event_is_last_for_its_id() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.emit(Event::TransferProgress {
            progress: TransferProgress {
                transfer_key: "t1".into(),
                progress: 50.0,
                file_name: "a.txt".into(),
                current_file: None,
                transferred_bytes: 50,
                total_bytes: 100,
                transfer_speed_bps: 10.0,
                remaining_time_sec: 5.0,
                current_file_index: 0,
                total_files: 1,
            },
        });
        bus.emit(Event::TransferCompleted {
            result: TransferResult {
                transfer_key: "t1".into(),
                success: true,
                partial_success: false,
                warning: None,
                error: None,
                download_path: None,
                message: None,
            },
        });

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(matches!(first, Event::TransferProgress { .. }));
        assert!(matches!(second, Event::TransferCompleted { .. }));
    }
}
