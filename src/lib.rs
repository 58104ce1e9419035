//! SSH session pooling, reconnection, proxy tunneling, and an SFTP-backed
//! transfer engine for a desktop file manager's terminal/SFTP tabs.
//!
//! [`core::SshCore`] is the entry point: it owns a private Tokio runtime and
//! every other component (connection pool, reconnection manager, directory
//! cache, event bus) and exposes the operations a host UI drives a tab with.

pub mod cache;
pub mod config;
pub mod core;
pub mod error;
pub mod events;
pub mod model;
pub mod pool;
pub mod proxy;
pub mod reconnect;
pub mod session;
pub mod sftp;
pub mod shell;
pub mod transfer;

pub use core::SshCore;
pub use error::{Error, Result};
pub use events::{Event, EventBus};

/// Install `env_logger` as the global logger, reading `RUST_LOG` the way the
/// teacher's own binary does. A convenience for hosts that have no logger of
/// their own yet; this crate never calls it internally, since a library
/// should never decide the process-wide logging backend for its embedder.
pub fn init_logging() {
    let _ = env_logger::try_init();
}
