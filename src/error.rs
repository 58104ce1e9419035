//! Crate-wide error taxonomy.
//!
//! Variants are *kinds*, not wrapped library types: callers downstream (the
//! reconnection manager, the transfer engine) match on the kind to decide
//! retry behavior, so raw `ssh2`/`io` errors are classified at the point
//! they're raised rather than propagated opaquely.

use thiserror::Error;

/// Structured context attached to an error so a host can log/diagnose
/// without the error itself leaking secrets.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub connection_key: Option<String>,
    pub descriptor_redacted: Option<String>,
    pub using_proxy: bool,
    pub proxy_type: Option<String>,
}

impl ErrorContext {
    pub fn new(connection_key: impl Into<String>) -> Self {
        Self { connection_key: Some(connection_key.into()), ..Default::default() }
    }

    pub fn with_proxy(mut self, proxy_type: impl Into<String>) -> Self {
        self.using_proxy = true;
        self.proxy_type = Some(proxy_type.into());
        self
    }

    pub fn with_descriptor(mut self, redacted: impl Into<String>) -> Self {
        self.descriptor_redacted = Some(redacted.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot reach target: {message}")]
    TransportUnavailable { message: String, context: ErrorContext },

    #[error("proxy handshake failed: {message}")]
    ProxyHandshakeFailed { message: String, context: ErrorContext },

    #[error("authentication failed: {message}")]
    AuthenticationFailed { message: String, context: ErrorContext },

    #[error("host key rejected for {host}")]
    HostKeyRejected { host: String, context: ErrorContext },

    #[error("protocol error: {message}")]
    ProtocolError { message: String, context: ErrorContext },

    #[error("operation failed: {message}")]
    OperationError { message: String, context: ErrorContext },

    #[error("cancelled")]
    Cancelled,

    #[error("connection pool exhausted (max connections reached)")]
    PoolExhausted,

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("resource limit reached: {0}")]
    ResourceLimit(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for kinds that must never surface as an error to a UI layer (§7).
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// True for kinds C4 must never retry — AUTHENTICATION/RESOURCE class (§4.4).
    pub fn is_non_retryable(&self) -> bool {
        matches!(
            self,
            Error::AuthenticationFailed { .. }
                | Error::HostKeyRejected { .. }
                | Error::ResourceLimit(_)
        )
    }

    /// Map a connect-phase `io::Error` into the taxonomy with a sanitized,
    /// user-facing message (§4.3). Never forwards raw library exception text.
    pub fn classify_connect_error(
        err: &std::io::Error,
        host: &str,
        port: u16,
        through_proxy: bool,
        context: ErrorContext,
    ) -> Error {
        let suffix = if through_proxy { " (through proxy)" } else { "" };
        match err.kind() {
            std::io::ErrorKind::ConnectionRefused => Error::TransportUnavailable {
                message: format!("Connection refused: cannot reach {host}:{port}{suffix}"),
                context,
            },
            std::io::ErrorKind::TimedOut => {
                Error::Timeout(format!("Connection to {host}:{port} timed out{suffix}"))
            }
            std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe => {
                Error::TransportUnavailable {
                    message: format!("Connection to {host}:{port} reset{suffix}"),
                    context,
                }
            }
            std::io::ErrorKind::NotFound => {
                Error::TransportUnavailable { message: "Host does not exist".to_string(), context }
            }
            _ => Error::TransportUnavailable { message: err.to_string(), context },
        }
    }

    /// Map an `ssh2::Error` raised during the handshake/auth phase.
    pub fn classify_ssh_error(err: &ssh2::Error, context: ErrorContext) -> Error {
        let message = err.message();
        if message.contains("authentication")
            || message.contains("Authentication")
            || message.contains("permission")
            || message.contains("password")
            || message.contains("key")
        {
            return Error::AuthenticationFailed { message: message.to_string(), context };
        }
        Error::ProtocolError { message: message.to_string(), context }
    }
}

impl From<ssh2::Error> for Error {
    fn from(err: ssh2::Error) -> Self {
        Error::classify_ssh_error(&err, ErrorContext::default())
    }
}
