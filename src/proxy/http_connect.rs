//! HTTP CONNECT tunnel (RFC 7231 CONNECT, RFC 7617 Basic proxy auth) — §4.1.

use std::io::{Read, Write};

use base64::Engine as _;

use crate::error::{Error, ErrorContext, Result};

/// Send the CONNECT request and read the status line + headers.
///
/// Reads one byte at a time until the terminating blank line so the socket
/// is never over-read past the header block — the subsequent SSH handshake
/// sees exactly the bytes that follow, with nothing to replay.
pub fn connect<S: Read + Write>(
    stream: &mut S,
    target_host: &str,
    target_port: u16,
    username: Option<&str>,
    password: Option<&str>,
) -> Result<()> {
    let mut request = format!(
        "CONNECT {target_host}:{target_port} HTTP/1.1\r\n\
         Host: {target_host}:{target_port}\r\n\
         Proxy-Connection: Keep-Alive\r\n\
         Connection: Keep-Alive\r\n"
    );
    if let Some(username) = username {
        let credentials = format!("{username}:{}", password.unwrap_or(""));
        let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
        request.push_str(&format!("Proxy-Authorization: Basic {encoded}\r\n"));
    }
    request.push_str("\r\n");

    stream.write_all(request.as_bytes())?;

    let header = read_header_block(stream)?;
    let status_line = header.lines().next().unwrap_or_default();
    let status_code = parse_status_code(status_line);

    match status_code {
        Some(200) => Ok(()),
        Some(407) => Err(Error::ProxyHandshakeFailed {
            message: "proxy authentication required".to_string(),
            context: ErrorContext::default().with_proxy("http"),
        }),
        _ => Err(Error::ProxyHandshakeFailed {
            message: status_line.to_string(),
            context: ErrorContext::default().with_proxy("http"),
        }),
    }
}

fn parse_status_code(status_line: &str) -> Option<u16> {
    status_line.split_whitespace().nth(1)?.parse().ok()
}

fn read_header_block<S: Read>(stream: &mut S) -> Result<String> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte)?;
        if n == 0 {
            return Err(Error::ProxyHandshakeFailed {
                message: "proxy closed connection before sending headers".to_string(),
                context: ErrorContext::default().with_proxy("http"),
            });
        }
        buf.push(byte[0]);
        if buf.ends_with(b"\r\n\r\n") {
            break;
        }
        if buf.len() > 64 * 1024 {
            return Err(Error::ProxyHandshakeFailed {
                message: "proxy response headers too large".to_string(),
                context: ErrorContext::default().with_proxy("http"),
            });
        }
    }
    String::from_utf8(buf).map_err(|_| Error::ProxyHandshakeFailed {
        message: "proxy response is not valid UTF-8".to_string(),
        context: ErrorContext::default().with_proxy("http"),
    })
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

    #[test]
    fn successful_connect() {
        let mut stream = ReadWriteCursor {
            read: Cursor::new(b"HTTP/1.1 200 Connection Established\r\n\r\n".to_vec()),
            written: Vec::new(),
        };
        connect(&mut stream, "10.0.0.5", 22, None, None).unwrap();
        let sent = String::from_utf8(stream.written).unwrap();
        assert!(sent.starts_with("CONNECT 10.0.0.5:22 HTTP/1.1\r\n"));
        assert!(!sent.contains("Proxy-Authorization"));
    }

    #[test]
    fn sends_basic_auth_header() {
        let mut stream = ReadWriteCursor {
            read: Cursor::new(b"HTTP/1.1 200 OK\r\n\r\n".to_vec()),
            written: Vec::new(),
        };
        connect(&mut stream, "10.0.0.5", 22, Some("user"), Some("pass")).unwrap();
        let sent = String::from_utf8(stream.written).unwrap();
        assert!(sent.contains("Proxy-Authorization: Basic"));
    }

    #[test]
    fn proxy_auth_required_is_classified() {
        let mut stream = ReadWriteCursor {
            read: Cursor::new(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n".to_vec()),
            written: Vec::new(),
        };
        let err = connect(&mut stream, "10.0.0.5", 22, None, None).unwrap_err();
        assert!(matches!(err, Error::ProxyHandshakeFailed { .. }));
    }

    #[test]
    fn bytes_after_header_are_left_for_subsequent_reader() {
        let mut stream = ReadWriteCursor {
            read: Cursor::new(b"HTTP/1.1 200 OK\r\n\r\nSSH-2.0-OpenSSH_9.0\r\n".to_vec()),
            written: Vec::new(),
        };
        connect(&mut stream, "10.0.0.5", 22, None, None).unwrap();
        let mut remainder = Vec::new();
        stream.read_to_end(&mut remainder).unwrap();
        assert_eq!(remainder, b"SSH-2.0-OpenSSH_9.0\r\n");
    }
}
