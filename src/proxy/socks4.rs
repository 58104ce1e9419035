//! SOCKS4 / SOCKS4a client (§4.1).

use std::io::{Read, Write};
use std::net::Ipv4Addr;

use crate::error::{Error, ErrorContext, Result};

const VERSION: u8 = 0x04;
const CMD_CONNECT: u8 = 0x01;
/// SOCKS4a sentinel: an invalid IPv4 address with a non-zero last octet
/// signals the server to expect a trailing domain name instead.
const SENTINEL: Ipv4Addr = Ipv4Addr::new(0, 0, 0, 1);

fn proxy_error(message: impl Into<String>) -> Error {
    Error::ProxyHandshakeFailed { message: message.into(), context: ErrorContext::default().with_proxy("socks4") }
}

pub fn connect<S: Read + Write>(
    stream: &mut S,
    target_host: &str,
    target_port: u16,
    user_id: &str,
) -> Result<()> {
    let mut request = vec![VERSION, CMD_CONNECT];
    request.extend_from_slice(&target_port.to_be_bytes());

    match target_host.parse::<Ipv4Addr>() {
        Ok(addr) => {
            request.extend_from_slice(&addr.octets());
            request.extend_from_slice(user_id.as_bytes());
            request.push(0);
        }
        Err(_) => {
            // SOCKS4a: sentinel address, userId\0, domain\0.
            request.extend_from_slice(&SENTINEL.octets());
            request.extend_from_slice(user_id.as_bytes());
            request.push(0);
            request.extend_from_slice(target_host.as_bytes());
            request.push(0);
        }
    }

    stream.write_all(&request)?;

    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply)?;
    if reply[1] != 0x5A {
        return Err(proxy_error(reply_code_message(reply[1])));
    }
    Ok(())
}

fn reply_code_message(code: u8) -> String {
    let reason = match code {
        0x5B => "request rejected or failed",
        0x5C => "cannot connect to identd on client",
        0x5D => "client and identd report different user-ids",
        _ => "unknown SOCKS4 error",
    };
    format!("SOCKS4 CONNECT failed: {reason} ({code:#04x})")
}
