//! Proxy resolution and tunneling (C1, §4.1).
//!
//! Produces a `TcpStream` that, once the tunnel handshake completes, is a
//! transparent byte-pipe to `(target_host, target_port)` — suitable for
//! handing straight to `ssh2::Session::set_tcp_stream`.

pub mod http_connect;
pub mod resolver;
pub mod socks4;
pub mod socks5;

use std::net::TcpStream;
use std::time::Duration;

use crate::config::CoreConfig;
use crate::error::{Error, ErrorContext, Result};
use crate::model::{ExplicitProxy, ProxyKind};

pub use resolver::{PacResolver, PacRule, ProxyResolver};

/// Open a TCP tunnel to `(target_host, target_port)`, optionally through
/// `proxy`. On any handshake failure the socket is torn down before the
/// error is returned (§4.1 "Contracts").
pub fn open_tunnel(
    target_host: &str,
    target_port: u16,
    proxy: Option<&ExplicitProxy>,
    config: &CoreConfig,
) -> Result<TcpStream> {
    match proxy {
        None => open_direct(target_host, target_port, config.connect_timeout),
        Some(proxy) => open_through_proxy(target_host, target_port, proxy, config),
    }
}

fn open_direct(target_host: &str, target_port: u16, timeout: Duration) -> Result<TcpStream> {
    let addr = format!("{target_host}:{target_port}");
    let socket_addr = resolve_one(&addr)?;
    let stream = TcpStream::connect_timeout(&socket_addr, timeout).map_err(|err| {
        Error::classify_connect_error(&err, target_host, target_port, false, ErrorContext::default())
    })?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

fn open_through_proxy(
    target_host: &str,
    target_port: u16,
    proxy: &ExplicitProxy,
    config: &CoreConfig,
) -> Result<TcpStream> {
    if matches!(proxy.kind, ProxyKind::Socks5) {
        socks5::validate_domain(target_host)?;
    }

    let timeout = match proxy.kind {
        ProxyKind::Http | ProxyKind::Https => config.http_connect_timeout,
        ProxyKind::Socks4 | ProxyKind::Socks5 => config.socks_connect_timeout,
    };

    let proxy_addr = format!("{}:{}", proxy.host, proxy.port);
    let socket_addr = resolve_one(&proxy_addr)?;
    let mut stream = TcpStream::connect_timeout(&socket_addr, timeout).map_err(|err| {
        Error::classify_connect_error(&err, &proxy.host, proxy.port, false, ErrorContext::default())
    })?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;

    let handshake_result = match proxy.kind {
        // "HTTPS" PAC entries are treated as plaintext CONNECT over an HTTP
        // proxy (§9 Open Question 2, DESIGN.md) — no TLS wrap of the proxy
        // socket.
        ProxyKind::Http | ProxyKind::Https => http_connect::connect(
            &mut stream,
            target_host,
            target_port,
            proxy.username.as_deref(),
            proxy.password.as_deref(),
        ),
        ProxyKind::Socks5 => socks5::connect(
            &mut stream,
            target_host,
            target_port,
            proxy.username.as_deref(),
            proxy.password.as_deref(),
        ),
        ProxyKind::Socks4 => {
            socks4::connect(&mut stream, target_host, target_port, proxy.username.as_deref().unwrap_or(""))
        }
    };

    match handshake_result {
        Ok(()) => {
            stream.set_nodelay(true)?;
            stream.set_read_timeout(None)?;
            stream.set_write_timeout(None)?;
            Ok(stream)
        }
        Err(err) => {
            drop(stream);
            Err(err)
        }
    }
}

fn resolve_one(addr: &str) -> Result<std::net::SocketAddr> {
    use std::net::ToSocketAddrs;
    addr.to_socket_addrs()?
        .next()
        .ok_or_else(|| Error::TransportUnavailable {
            message: "Host does not exist".to_string(),
            context: ErrorContext::default(),
        })
}
