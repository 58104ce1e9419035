//! SSH test-container helpers shared by the session and transfer integration
//! tests.

use std::fs;
use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, Result, bail};
use ssh_session_core::model::{AuthMethod, ConnectionDescriptor};
use tempfile::TempDir;
use testcontainers::core::{CmdWaitFor, ExecCommand, IntoContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};
use uuid::Uuid;

/// A running `testcontainers/sshd` container with a known root password.
pub struct SshStack {
    container: ContainerAsync<GenericImage>,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl SshStack {
    pub async fn start() -> Result<Self> {
        let password = format!("ssh-core-{}", Uuid::new_v4().simple());
        let image = GenericImage::new("testcontainers/sshd", "1.3.0")
            .with_exposed_port(22.tcp())
            .with_wait_for(WaitFor::seconds(2))
            .with_entrypoint("/bin/sh");
        let container = image
            .with_cmd([
                "-lc",
                "echo \"root:${PASSWORD}\" | chpasswd && exec /usr/sbin/sshd -D -e -o PermitRootLogin=yes -o PasswordAuthentication=yes",
            ])
            .with_env_var("PASSWORD", password.clone())
            .start()
            .await
            .context("failed to start sshd container")?;

        let host = container.get_host().await.context("failed to read ssh host")?.to_string();
        let port = container.get_host_port_ipv4(22.tcp()).await.context("failed to read ssh mapped port")?;

        Ok(Self { container, host, port, username: "root".to_string(), password })
    }

    pub fn password_descriptor(&self, tab_id: &str) -> ConnectionDescriptor {
        ConnectionDescriptor {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            auth_type: AuthMethod::Password,
            password: Some(self.password.clone()),
            private_key: None,
            passphrase: None,
            private_key_path: None,
            enable_compression: false,
            proxy: None,
            tab_id: Some(tab_id.to_string()),
        }
    }

    pub fn identity_descriptor(&self, tab_id: &str, private_key_path: PathBuf) -> ConnectionDescriptor {
        ConnectionDescriptor {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            auth_type: AuthMethod::PrivateKey,
            password: None,
            private_key: None,
            passphrase: None,
            private_key_path: Some(private_key_path.to_string_lossy().to_string()),
            enable_compression: false,
            proxy: None,
            tab_id: Some(tab_id.to_string()),
        }
    }

    pub async fn install_authorized_key(&self, public_key: &str) -> Result<()> {
        let command = format!(
            "mkdir -p /root/.ssh && chmod 700 /root/.ssh && printf '%s\\n' {} >> /root/.ssh/authorized_keys && chmod 600 /root/.ssh/authorized_keys",
            shell_single_quote(public_key.trim())
        );

        self.container
            .exec(ExecCommand::new(["/bin/sh", "-lc", command.as_str()]).with_cmd_ready_condition(CmdWaitFor::exit_code(0)))
            .await
            .context("failed to install SSH public key into test sshd container")?;

        Ok(())
    }
}

fn shell_single_quote(input: &str) -> String {
    format!("'{}'", input.replace('\'', "'\"'\"'"))
}

pub fn generate_ed25519_keypair(temp_dir: &TempDir) -> Result<(PathBuf, String)> {
    let private_key = temp_dir.path().join("id_ed25519");
    let private_key_str =
        private_key.to_str().ok_or_else(|| anyhow::anyhow!("private key path is not valid UTF-8"))?;

    let status = Command::new("ssh-keygen")
        .args(["-t", "ed25519", "-N", "", "-f", private_key_str, "-q"])
        .status()
        .context("failed to spawn ssh-keygen (required for identity-file integration test)")?;

    if !status.success() {
        bail!("ssh-keygen returned non-zero exit code: {status}");
    }

    let public_key = fs::read_to_string(private_key.with_extension("pub")).context("failed to read generated public key")?;

    Ok((private_key, public_key.trim().to_string()))
}
