//! SOCKS5 client (RFC 1928 + RFC 1929 username/password auth) — §4.1.

use std::io::{Read, Write};
use std::net::IpAddr;

use crate::error::{Error, ErrorContext, Result};

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

fn proxy_error(message: impl Into<String>) -> Error {
    Error::ProxyHandshakeFailed { message: message.into(), context: ErrorContext::default().with_proxy("socks5") }
}

pub fn connect<S: Read + Write>(
    stream: &mut S,
    target_host: &str,
    target_port: u16,
    username: Option<&str>,
    password: Option<&str>,
) -> Result<()> {
    negotiate_method(stream, username, password)?;
    send_connect_request(stream, target_host, target_port)?;
    read_connect_reply(stream)?;
    Ok(())
}

fn negotiate_method<S: Read + Write>(
    stream: &mut S,
    username: Option<&str>,
    password: Option<&str>,
) -> Result<()> {
    let methods: &[u8] = if username.is_some() { &[METHOD_NO_AUTH, METHOD_USER_PASS] } else { &[METHOD_NO_AUTH] };
    let mut request = vec![VERSION, methods.len() as u8];
    request.extend_from_slice(methods);
    stream.write_all(&request)?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply)?;
    if reply[0] != VERSION {
        return Err(proxy_error(format!("unexpected SOCKS version {:#04x}", reply[0])));
    }
    match reply[1] {
        METHOD_NO_AUTH => Ok(()),
        METHOD_USER_PASS => {
            let username = username.ok_or_else(|| proxy_error("proxy requires credentials"))?;
            username_password_subnegotiation(stream, username, password.unwrap_or(""))
        }
        0xFF => Err(proxy_error("no acceptable authentication method")),
        other => Err(proxy_error(format!("unsupported auth method selected: {other:#04x}"))),
    }
}

fn username_password_subnegotiation<S: Read + Write>(
    stream: &mut S,
    username: &str,
    password: &str,
) -> Result<()> {
    let mut request = vec![0x01, username.len() as u8];
    request.extend_from_slice(username.as_bytes());
    request.push(password.len() as u8);
    request.extend_from_slice(password.as_bytes());
    stream.write_all(&request)?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply)?;
    if reply[1] != 0x00 {
        return Err(proxy_error("proxy rejected username/password credentials"));
    }
    Ok(())
}

fn send_connect_request<S: Write>(stream: &mut S, target_host: &str, target_port: u16) -> Result<()> {
    let mut request = vec![VERSION, CMD_CONNECT, 0x00];

    match target_host.parse::<IpAddr>() {
        Ok(IpAddr::V4(addr)) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&addr.octets());
        }
        Ok(IpAddr::V6(addr)) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&addr.octets());
        }
        Err(_) => {
            if target_host.len() > 255 {
                return Err(proxy_error("domain name longer than 255 bytes"));
            }
            request.push(ATYP_DOMAIN);
            request.push(target_host.len() as u8);
            request.extend_from_slice(target_host.as_bytes());
        }
    }

    request.extend_from_slice(&target_port.to_be_bytes());
    stream.write_all(&request)?;
    Ok(())
}

fn read_connect_reply<S: Read>(stream: &mut S) -> Result<()> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header)?;
    if header[0] != VERSION {
        return Err(proxy_error(format!("unexpected SOCKS version in reply {:#04x}", header[0])));
    }
    if header[1] != 0x00 {
        return Err(proxy_error(reply_code_message(header[1])));
    }

    match header[3] {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4 + 2];
            stream.read_exact(&mut addr)?;
        }
        ATYP_DOMAIN => {
            let mut len_buf = [0u8; 1];
            stream.read_exact(&mut len_buf)?;
            let mut rest = vec![0u8; len_buf[0] as usize + 2];
            stream.read_exact(&mut rest)?;
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16 + 2];
            stream.read_exact(&mut addr)?;
        }
        other => return Err(proxy_error(format!("unsupported BND.ADDR type {other:#04x}"))),
    }

    Ok(())
}

fn reply_code_message(code: u8) -> String {
    let reason = match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown SOCKS5 error",
    };
    format!("SOCKS5 CONNECT failed: {reason} ({code:#04x})")
}

/// Reject oversized domains before writing anything to the wire (§8 boundary
/// behavior).
pub fn validate_domain(target_host: &str) -> Result<()> {
    if target_host.parse::<IpAddr>().is_err() && target_host.len() > 255 {
        return Err(proxy_error("domain name longer than 255 bytes"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    struct ReadWriteCursor {
        read: Cursor<Vec<u8>>,
        written: Vec<u8>,
    }

    impl Read for ReadWriteCursor {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.read.read(buf)
        }
    }

    impl Write for ReadWriteCursor {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn reply(atyp_and_addr: &[u8]) -> Vec<u8> {
        let mut v = vec![0x05, 0x00, 0x00];
        v.extend_from_slice(atyp_and_addr);
        v
    }

    #[test]
    fn no_auth_method_selected_without_credentials() {
        let mut stream = ReadWriteCursor {
            read: Cursor::new({
                let mut r = vec![0x05, 0x00];
                r.extend_from_slice(&reply(&[0x01, 0, 0, 0, 0, 0, 0]));
                r
            }),
            written: Vec::new(),
        };
        connect(&mut stream, "10.0.0.5", 22, None, None).unwrap();
        assert_eq!(&stream.written[..2], &[0x05, 0x01]);
        assert_eq!(stream.written[2], 0x00);
    }

    #[test]
    fn offers_user_pass_method_when_credentials_present() {
        let mut stream = ReadWriteCursor {
            read: Cursor::new({
                let mut r = vec![0x05, 0x02, 0x01, 0x00];
                r.extend_from_slice(&reply(&[0x01, 0, 0, 0, 0, 0, 0]));
                r
            }),
            written: Vec::new(),
        };
        connect(&mut stream, "10.0.0.5", 22, Some("u"), Some("p")).unwrap();
        assert_eq!(&stream.written[..3], &[0x05, 0x02, 0x00]);
    }

    #[test]
    fn domain_connect_request_uses_atyp_domain() {
        let mut stream = ReadWriteCursor {
            read: Cursor::new({
                let mut r = vec![0x05, 0x00];
                r.extend_from_slice(&reply(&[0x03, 11, b'e', b'x', b'a', b'm', b'p', b'l', b'e', b'.', b'c', b'o', b'm', 0, 0]));
                r
            }),
            written: Vec::new(),
        };
        connect(&mut stream, "example.com", 22, None, None).unwrap();
        // skip the 3-byte method negotiation request to inspect the CONNECT request
        assert_eq!(stream.written[3], VERSION);
        assert_eq!(stream.written[4], CMD_CONNECT);
        assert_eq!(stream.written[6], ATYP_DOMAIN);
    }

    #[test]
    fn domain_longer_than_255_is_rejected_before_writing() {
        let long_host = "a".repeat(256);
        assert!(validate_domain(&long_host).is_err());
    }

    #[test]
    fn non_zero_reply_code_is_failure() {
        let mut stream = ReadWriteCursor {
            read: Cursor::new({
                let mut r = vec![0x05, 0x00];
                r.extend_from_slice(&[0x05, 0x04, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
                r
            }),
            written: Vec::new(),
        };
        let err = connect(&mut stream, "10.0.0.5", 22, None, None).unwrap_err();
        assert!(matches!(err, Error::ProxyHandshakeFailed { .. }));
    }
}
