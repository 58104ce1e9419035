//! End-to-end proxy tunnel tests: a real HTTP CONNECT proxy, a real SOCKS4
//! proxy, and a real SOCKS5 server (`fast_socks5`) each relaying a byte
//! stream to a local echo target, driven through `proxy::open_tunnel`.

use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use fast_socks5::server::{self, Socks5Socket};
use ssh_session_core::config::CoreConfig;
use ssh_session_core::model::{ExplicitProxy, ProxyKind};
use ssh_session_core::proxy::open_tunnel;
use tokio::net::TcpListener as TokioTcpListener;
use tokio::sync::oneshot;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Accepts exactly one connection and echoes everything it reads back to
/// the same socket.
fn start_echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind echo server");
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        if let Ok((mut stream, _)) = listener.accept() {
            let mut buf = [0u8; 4096];
            loop {
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stream.write_all(&buf[..n]).is_err() {
                            break;
                        }
                    }
                }
            }
        }
    });
    port
}

fn relay(mut a: TcpStream, mut b: TcpStream) {
    let mut a_reader = a.try_clone().expect("failed to clone relay stream");
    let mut b_writer = b.try_clone().expect("failed to clone relay stream");
    let to_b = thread::spawn(move || {
        let _ = std::io::copy(&mut a_reader, &mut b_writer);
    });
    let _ = std::io::copy(&mut b, &mut a);
    let _ = to_b.join();
}

/// Minimal HTTP CONNECT proxy: accepts one connection, parses the request
/// line, dials the target, and relays bytes once the handshake completes.
fn start_http_connect_proxy() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind HTTP CONNECT proxy");
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        let Ok((mut client, _)) = listener.accept() else { return };
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        while !buf.ends_with(b"\r\n\r\n") {
            if client.read(&mut byte).unwrap_or(0) == 0 {
                return;
            }
            buf.push(byte[0]);
        }
        let request = String::from_utf8_lossy(&buf);
        let target = request.lines().next().unwrap_or_default().split_whitespace().nth(1).unwrap_or_default();
        let Ok(upstream) = TcpStream::connect(target) else {
            let _ = client.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n");
            return;
        };
        client.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n").expect("failed to write CONNECT reply");
        relay(client, upstream);
    });
    port
}

/// Minimal SOCKS4/SOCKS4a proxy: accepts one connection, parses a CONNECT
/// request (IPv4 literal or SOCKS4a domain), dials the target, and relays.
fn start_socks4_proxy() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind SOCKS4 proxy");
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        let Ok((mut client, _)) = listener.accept() else { return };
        let mut header = [0u8; 8];
        if client.read_exact(&mut header).is_err() {
            return;
        }
        let port = u16::from_be_bytes([header[2], header[3]]);
        let addr = Ipv4Addr::new(header[4], header[5], header[6], header[7]);

        let mut byte = [0u8; 1];
        loop {
            if client.read(&mut byte).unwrap_or(0) == 0 || byte[0] == 0 {
                break;
            }
        }

        let is_socks4a_sentinel = header[4] == 0 && header[5] == 0 && header[6] == 0 && header[7] != 0;
        let target = if is_socks4a_sentinel {
            let mut domain = Vec::new();
            loop {
                if client.read(&mut byte).unwrap_or(0) == 0 || byte[0] == 0 {
                    break;
                }
                domain.push(byte[0]);
            }
            format!("{}:{port}", String::from_utf8_lossy(&domain))
        } else {
            format!("{addr}:{port}")
        };

        let Ok(upstream) = TcpStream::connect(&target) else {
            let _ = client.write_all(&[0x00, 0x5B, 0, 0, 0, 0, 0, 0]);
            return;
        };
        client.write_all(&[0x00, 0x5A, 0, 0, 0, 0, 0, 0]).expect("failed to write SOCKS4 reply");
        relay(client, upstream);
    });
    port
}

#[tokio::test]
async fn http_connect_proxy_tunnels_bytes_to_target() {
    init_logger();
    let echo_port = start_echo_server();
    let proxy_port = start_http_connect_proxy();
    let proxy = ExplicitProxy { kind: ProxyKind::Http, host: "127.0.0.1".to_string(), port: proxy_port, username: None, password: None };
    let config = CoreConfig::default();

    let mut stream = tokio::task::spawn_blocking(move || open_tunnel("127.0.0.1", echo_port, Some(&proxy), &config))
        .await
        .unwrap()
        .expect("HTTP CONNECT tunnel should establish");

    stream.write_all(b"hello-through-http-connect").unwrap();
    let mut buf = [0u8; 64];
    let n = stream.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"hello-through-http-connect");
}

#[tokio::test]
async fn socks4_proxy_tunnels_bytes_to_target() {
    init_logger();
    let echo_port = start_echo_server();
    let proxy_port = start_socks4_proxy();
    let proxy = ExplicitProxy { kind: ProxyKind::Socks4, host: "127.0.0.1".to_string(), port: proxy_port, username: None, password: None };
    let config = CoreConfig::default();

    let mut stream = tokio::task::spawn_blocking(move || open_tunnel("127.0.0.1", echo_port, Some(&proxy), &config))
        .await
        .unwrap()
        .expect("SOCKS4 tunnel should establish");

    stream.write_all(b"hello-through-socks4").unwrap();
    let mut buf = [0u8; 64];
    let n = stream.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"hello-through-socks4");
}

#[tokio::test]
async fn socks5_proxy_tunnels_bytes_to_target() {
    init_logger();
    let echo_port = start_echo_server();

    let listener = TokioTcpListener::bind(("127.0.0.1", 0)).await.expect("failed to bind local SOCKS5 listener");
    let proxy_port = listener.local_addr().unwrap().port();
    let socks_config = Arc::new(server::Config::<server::DenyAuthentication>::default());
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let server_handle = tokio::spawn(async move {
        tokio::select! {
            _ = &mut shutdown_rx => {}
            incoming = listener.accept() => {
                if let Ok((stream, _)) = incoming {
                    let mut socket = Socks5Socket::new(stream, socks_config);
                    socket.set_reply_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
                    let _ = socket.upgrade_to_socks5().await;
                }
            }
        }
    });

    let proxy = ExplicitProxy { kind: ProxyKind::Socks5, host: "127.0.0.1".to_string(), port: proxy_port, username: None, password: None };
    let config = CoreConfig::default();
    let mut stream = tokio::task::spawn_blocking(move || open_tunnel("127.0.0.1", echo_port, Some(&proxy), &config))
        .await
        .unwrap()
        .expect("SOCKS5 tunnel should establish");

    stream.write_all(b"hello-through-socks5").unwrap();
    let mut buf = [0u8; 64];
    let n = stream.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"hello-through-socks5");

    let _ = shutdown_tx.send(());
    let _ = server_handle.await;
}
