//! SSH session establishment (C3, §4.3).

use std::io::Read as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::Engine as _;
use sha2::{Digest, Sha256};
use ssh2::Session;

use crate::config::CoreConfig;
use crate::error::{Error, ErrorContext, Result};
use crate::model::{AuthMethod, ConnectionDescriptor};
use crate::proxy;

/// Context handed to the host's trust-decision callback before accepting a
/// server host key (§4.3).
#[derive(Debug, Clone)]
pub struct HostKeyContext {
    pub host: String,
    pub port: u16,
    pub server_version: String,
    pub fingerprint: String,
    /// `Some(true)` when a previously-trusted fingerprint for this host
    /// differs from the one just presented; this crate does not itself
    /// persist a known-hosts store (Non-goal, §1) — the host supplies the
    /// comparison basis if it has one.
    pub fingerprint_changed: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct HostKeyDecision {
    pub accept: bool,
    pub username: Option<String>,
    pub remember_auto_login: bool,
}

impl HostKeyDecision {
    pub fn accept() -> Self {
        Self { accept: true, ..Default::default() }
    }

    pub fn reject() -> Self {
        Self { accept: false, ..Default::default() }
    }
}

/// Host-provided trust decision for a server host key (§4.3, §6).
pub trait HostKeyVerifier: Send + Sync {
    fn verify(&self, ctx: HostKeyContext) -> HostKeyDecision;
}

/// Accepts any host key unconditionally — convenient as a default for
/// tests/demos; production hosts should supply a real verifier.
pub struct AcceptAllHostKeys;

impl HostKeyVerifier for AcceptAllHostKeys {
    fn verify(&self, _ctx: HostKeyContext) -> HostKeyDecision {
        HostKeyDecision::accept()
    }
}

/// One established SSH transport plus the bookkeeping the pool/reconnector
/// need (§3 PooledSession fields live in `model::PooledSession`; this is the
/// transport-construction half of that story).
pub struct SshSession {
    pub session: Session,
    pub using_proxy: bool,
}

/// SHA-256 fingerprint of a server host key blob, base64-encoded — the
/// algorithm this crate hands to a `HostKeyVerifier` (SPEC_FULL.md §F.3).
pub fn host_key_fingerprint(host_key: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(host_key);
    let digest = hasher.finalize();
    format!("SHA256:{}", base64::engine::general_purpose::STANDARD_NO_PAD.encode(digest))
}

/// Establish an SSH session over a direct TCP connection or a C1 tunnel
/// socket, then authenticate (§4.3).
pub fn establish(
    descriptor: &ConnectionDescriptor,
    config: &CoreConfig,
    verifier: &dyn HostKeyVerifier,
) -> Result<SshSession> {
    let resolver = proxy::ProxyResolver::new();
    let resolved_proxy = resolver.resolve(descriptor.proxy.as_ref(), &descriptor.host);
    let using_proxy = resolved_proxy.is_some();
    let proxy_type = resolved_proxy.as_ref().map(|p| p.kind.to_string());

    let tcp =
        proxy::open_tunnel(&descriptor.host, descriptor.port, resolved_proxy.as_ref(), config)?;
    tcp.set_read_timeout(Some(config.ssh_ready_timeout))?;
    tcp.set_write_timeout(Some(config.ssh_ready_timeout))?;

    let mut handshake_context = ErrorContext::new(descriptor.connection_key());
    if let Some(proxy_type) = &proxy_type {
        handshake_context = handshake_context.with_proxy(proxy_type.clone());
    }

    let mut session = Session::new().map_err(|err| Error::ProtocolError {
        message: format!("failed to create SSH session: {err}"),
        context: handshake_context.clone(),
    })?;
    if descriptor.enable_compression {
        session.set_compress(true);
    }
    session.set_tcp_stream(tcp);
    session.set_timeout(config.ssh_ready_timeout.as_millis() as u32);
    session
        .handshake()
        .map_err(|err| Error::classify_ssh_error(&err, handshake_context.clone()))?;

    verify_host_key(&session, descriptor, verifier)?;
    authenticate(&mut session, descriptor)?;

    session.set_keepalive(true, config.ssh_keepalive_interval.as_secs() as u32);

    Ok(SshSession { session, using_proxy })
}

fn verify_host_key(
    session: &Session,
    descriptor: &ConnectionDescriptor,
    verifier: &dyn HostKeyVerifier,
) -> Result<()> {
    let (host_key, _kind) = session.host_key().ok_or_else(|| Error::ProtocolError {
        message: "unable to read SSH host key from server".to_string(),
        context: ErrorContext::default(),
    })?;
    let fingerprint = host_key_fingerprint(host_key);
    let server_version = session.banner().unwrap_or_default().to_string();

    let ctx = HostKeyContext {
        host: descriptor.host.clone(),
        port: descriptor.port,
        server_version,
        fingerprint,
        fingerprint_changed: None,
    };
    let host = ctx.host.clone();
    let decision = verifier.verify(ctx);
    if !decision.accept {
        return Err(Error::HostKeyRejected { host, context: ErrorContext::default() });
    }
    Ok(())
}

fn authenticate(session: &mut Session, descriptor: &ConnectionDescriptor) -> Result<()> {
    let context = ErrorContext::new(descriptor.connection_key())
        .with_descriptor(format!("{:?}", descriptor.redacted()));

    match descriptor.auth_type {
        AuthMethod::Password => {
            let password = descriptor.password.as_deref().ok_or_else(|| Error::AuthenticationFailed {
                message: "password is required for password authentication".to_string(),
                context: context.clone(),
            })?;
            session.userauth_password(&descriptor.username, password).map_err(|err| {
                Error::classify_ssh_error(&err, context.clone())
            })?;
        }
        AuthMethod::PrivateKey => {
            authenticate_with_key(session, descriptor, &context)?;
        }
    }

    if !session.authenticated() {
        return Err(Error::AuthenticationFailed {
            message: "all configured authentication methods failed".to_string(),
            context,
        });
    }
    Ok(())
}

fn authenticate_with_key(
    session: &mut Session,
    descriptor: &ConnectionDescriptor,
    context: &ErrorContext,
) -> Result<()> {
    let passphrase = descriptor.passphrase.as_deref();

    if let Some(key_bytes) = &descriptor.private_key {
        let key_text = std::str::from_utf8(key_bytes).map_err(|_| Error::AuthenticationFailed {
            message: "private key material is not valid UTF-8".to_string(),
            context: context.clone(),
        })?;
        session
            .userauth_pubkey_memory(&descriptor.username, None, key_text, passphrase)
            .map_err(|err| Error::classify_ssh_error(&err, context.clone()))?;
        return Ok(());
    }

    let path = descriptor.private_key_path.as_deref().ok_or_else(|| Error::AuthenticationFailed {
        message: "private key or private key path is required for key authentication".to_string(),
        context: context.clone(),
    })?;
    let resolved = resolve_identity_file_path(path);
    session.userauth_pubkey_file(&descriptor.username, None, resolved.as_path(), passphrase).map_err(
        |err| {
            let mut message = err.message().to_string();
            message.push_str(&format!(" (key path: {})", resolved.display()));
            Error::AuthenticationFailed { message, context: context.clone() }
        },
    )
}

/// Expand a leading `~` the way a shell would, since identity-file paths are
/// user-supplied and commonly written with it.
pub fn resolve_identity_file_path(raw_path: &str) -> PathBuf {
    let trimmed = raw_path.trim();
    if let Some(home_relative) = trimmed.strip_prefix("~/") {
        if let Some(home_dir) = dirs::home_dir() {
            return home_dir.join(home_relative);
        }
    }
    if trimmed == "~" {
        if let Some(home_dir) = dirs::home_dir() {
            return home_dir;
        }
    }
    Path::new(trimmed).to_path_buf()
}

/// Execute `echo test` on a fresh session and require at least one byte of
/// output within the validation timeout — used by C4 to confirm a swapped
/// transport is actually usable (§4.4).
pub fn validate_with_echo(session: &Session, timeout: Duration) -> Result<()> {
    let mut channel = session.channel_session().map_err(Error::from)?;
    session.set_timeout(timeout.as_millis() as u32);
    channel.exec("echo test").map_err(Error::from)?;
    let mut buf = [0u8; 1];
    let n = channel.read(&mut buf)?;
    if n == 0 {
        return Err(Error::Timeout("validation echo produced no output".to_string()));
    }
    let _ = channel.wait_close();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_deterministic_sha256() {
        let a = host_key_fingerprint(b"key-bytes");
        let b = host_key_fingerprint(b"key-bytes");
        assert_eq!(a, b);
        assert!(a.starts_with("SHA256:"));
    }

    #[test]
    fn different_keys_produce_different_fingerprints() {
        let a = host_key_fingerprint(b"key-a");
        let b = host_key_fingerprint(b"key-b");
        assert_ne!(a, b);
    }

    #[test]
    fn tilde_path_expands_against_home_dir() {
        if let Some(home) = dirs::home_dir() {
            let resolved = resolve_identity_file_path("~/.ssh/id_ed25519");
            assert_eq!(resolved, home.join(".ssh/id_ed25519"));
        }
    }

    #[test]
    fn plain_path_is_untouched() {
        let resolved = resolve_identity_file_path("/etc/ssh/id_rsa");
        assert_eq!(resolved, PathBuf::from("/etc/ssh/id_rsa"));
    }

    #[test]
    fn accept_all_verifier_always_accepts() {
        let verifier = AcceptAllHostKeys;
        let decision = verifier.verify(HostKeyContext {
            host: "h".into(),
            port: 22,
            server_version: "SSH-2.0-test".into(),
            fingerprint: "SHA256:abc".into(),
            fingerprint_changed: Some(true),
        });
        assert!(decision.accept);
    }
}
