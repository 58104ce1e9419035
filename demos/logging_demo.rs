//! Minimal host-side wiring: install a logger, bring up `SshCore`, connect
//! once with password auth, list a directory, and shut down cleanly.
//!
//! Run with `RUST_LOG=ssh_session_core=debug cargo run --example logging_demo`.

use std::sync::Arc;

use ssh_session_core::config::CoreConfig;
use ssh_session_core::model::{AuthMethod, ConnectionDescriptor};
use ssh_session_core::session::AcceptAllHostKeys;
use ssh_session_core::SshCore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    ssh_session_core::init_logging();

    let core = SshCore::new(CoreConfig::default(), Arc::new(AcceptAllHostKeys))?;

    let descriptor = ConnectionDescriptor {
        host: "localhost".to_string(),
        port: 22,
        username: "demo".to_string(),
        auth_type: AuthMethod::Password,
        password: Some("demo".to_string()),
        private_key: None,
        passphrase: None,
        private_key_path: None,
        enable_compression: false,
        proxy: None,
        tab_id: Some("demo-tab".to_string()),
    };

    core.connect("demo-tab", descriptor).await?;
    let entries = core.list_dir("demo-tab", "/").await?;
    log::info!("listed {} entries at /", entries.len());

    core.disconnect("demo-tab");
    core.shutdown();
    Ok(())
}
