//! End-to-end tests against a real `testcontainers/sshd` container: connect,
//! list/create/rename/delete over SFTP, upload/download round trips, and an
//! interactive shell.

mod common;

use std::sync::Arc;
use std::time::Duration;

use ssh_session_core::config::CoreConfig;
use ssh_session_core::session::AcceptAllHostKeys;
use ssh_session_core::shell::PtyRequest;
use ssh_session_core::SshCore;
use tempfile::TempDir;

use common::transport::{generate_ed25519_keypair, SshStack};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn new_core() -> Arc<SshCore> {
    SshCore::new(CoreConfig::default(), Arc::new(AcceptAllHostKeys)).expect("core should construct")
}

#[tokio::test]
async fn password_connect_lists_and_mutates_remote_directory() {
    init_logger();
    let stack = SshStack::start().await.expect("failed to start sshd container");
    let core = new_core();

    let key = core
        .connect("tab-1", stack.password_descriptor("tab-1"))
        .await
        .expect("password connect should succeed");
    assert!(key.contains("tab-1"));

    core.create_dir("tab-1", "/tmp/ssh-core-test".to_string()).await.expect("mkdir should succeed");
    core.create_file("tab-1", "/tmp/ssh-core-test/hello.txt".to_string()).await.expect("touch should succeed");

    let entries = core.list_dir("tab-1", "/tmp/ssh-core-test").await.expect("listing should succeed");
    assert!(entries.iter().any(|e| e.name == "hello.txt"));

    core.rename_file("tab-1", "/tmp/ssh-core-test/hello.txt".to_string(), "/tmp/ssh-core-test/renamed.txt".to_string())
        .await
        .expect("rename should succeed");
    core.refresh_dir("tab-1", "/tmp/ssh-core-test");
    tokio::time::sleep(Duration::from_millis(500)).await;
    let entries = core.list_dir("tab-1", "/tmp/ssh-core-test").await.expect("listing after rename should succeed");
    assert!(entries.iter().any(|e| e.name == "renamed.txt"));
    assert!(!entries.iter().any(|e| e.name == "hello.txt"));

    core.delete_file("tab-1", "/tmp/ssh-core-test/renamed.txt".to_string()).await.expect("delete should succeed");

    core.disconnect("tab-1");
    core.shutdown();
}

#[tokio::test]
async fn identity_file_connect_succeeds() {
    init_logger();
    let stack = SshStack::start().await.expect("failed to start sshd container");
    let key_dir = TempDir::new().expect("failed to create temp dir for ssh keys");
    let (private_key, public_key) = generate_ed25519_keypair(&key_dir).expect("failed to generate identity key pair");
    stack.install_authorized_key(&public_key).await.expect("failed to install public key");

    let core = new_core();
    let key = core
        .connect("tab-identity", stack.identity_descriptor("tab-identity", private_key))
        .await
        .expect("identity-file connect should succeed");
    assert!(key.contains("tab-identity"));

    core.disconnect("tab-identity");
    core.shutdown();
}

#[tokio::test]
async fn upload_then_download_round_trips_file_contents() {
    init_logger();
    let stack = SshStack::start().await.expect("failed to start sshd container");
    let core = new_core();
    core.connect("tab-transfer", stack.password_descriptor("tab-transfer")).await.expect("connect should succeed");

    let workdir = TempDir::new().expect("failed to create temp workdir");
    let local_upload = workdir.path().join("payload.bin");
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(&local_upload, &payload).expect("failed to write local payload");

    let upload_result = core
        .upload_file("tab-transfer", local_upload.clone(), "/tmp/ssh-core-payload.bin".to_string())
        .await
        .expect("upload should succeed");
    assert!(upload_result.success);

    let local_download = workdir.path().join("downloaded.bin");
    let download_result = core
        .download_file("tab-transfer", "/tmp/ssh-core-payload.bin".to_string(), local_download.clone())
        .await
        .expect("download should succeed");
    assert!(download_result.success);

    let round_tripped = std::fs::read(&local_download).expect("downloaded file should exist");
    assert_eq!(round_tripped, payload);

    core.delete_file("tab-transfer", "/tmp/ssh-core-payload.bin".to_string()).await.expect("cleanup delete should succeed");
    core.disconnect("tab-transfer");
    core.shutdown();
}

#[tokio::test]
async fn interactive_shell_echoes_back_typed_command() {
    init_logger();
    let stack = SshStack::start().await.expect("failed to start sshd container");
    let core = new_core();
    core.connect("tab-shell", stack.password_descriptor("tab-shell")).await.expect("connect should succeed");

    let shell = core
        .open_shell("tab-shell", PtyRequest { term: "xterm-256color".to_string(), cols: 80, rows: 24 })
        .await
        .expect("opening a shell should succeed");

    shell.write(b"echo ssh-core-marker\n".to_vec()).expect("write should succeed");

    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(500), shell.recv()).await {
            Ok(Some(chunk)) => {
                seen.extend_from_slice(&chunk);
                if String::from_utf8_lossy(&seen).contains("ssh-core-marker") {
                    break;
                }
            }
            Ok(None) => break,
            Err(_) => continue,
        }
    }
    let output = String::from_utf8_lossy(&seen);
    assert!(output.contains("ssh-core-marker"), "expected shell output to contain marker, got: {output}");

    core.close_shell("tab-shell");
    core.disconnect("tab-shell");
    core.shutdown();
}

#[tokio::test]
async fn disconnect_releases_the_pooled_session() {
    init_logger();
    let stack = SshStack::start().await.expect("failed to start sshd container");
    let core = new_core();
    core.connect("tab-disconnect", stack.password_descriptor("tab-disconnect")).await.expect("connect should succeed");

    core.disconnect("tab-disconnect");

    let err = core
        .list_dir("tab-disconnect", "/tmp")
        .await
        .expect_err("operations after disconnect should fail with no active session");
    assert!(matches!(err, ssh_session_core::Error::TransportUnavailable { .. }));

    core.shutdown();
}
