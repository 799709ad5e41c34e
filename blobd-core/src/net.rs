//! Port specifications, listener binding and the type-erased stream both
//! ends of the protocol talk through.

use crate::error::{BlobError, Result};
use std::net::{IpAddr, SocketAddr};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpSocket};

/// Any bidirectional byte stream: plain TCP or TLS over TCP.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Expands a port specification such as `"50100-50200,50300-50400,51234"`
/// into the ports to try, in order.
pub fn parse_port_range(spec: &str) -> Result<Vec<u16>> {
    let invalid = |detail: String| {
        BlobError::Config(format!("invalid port specification '{}': {}", spec, detail))
    };
    let parse_port = |raw: &str| {
        raw.trim()
            .parse::<u16>()
            .map_err(|_| invalid(format!("'{}' is not a port", raw.trim())))
    };

    let mut ports = Vec::new();
    for token in spec.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }

        match token.split_once('-') {
            Some((start, end)) => {
                let start = parse_port(start)?;
                let end = parse_port(end)?;
                if start > end {
                    return Err(invalid(format!("range {} is reversed", token)));
                }
                ports.extend(start..=end);
            }
            None => ports.push(parse_port(token)?),
        }
    }

    if ports.is_empty() {
        return Err(invalid("no ports given".to_string()));
    }

    Ok(ports)
}

/// Binds the first free port of the specification `port_spec` on `host`
/// with the given accept backlog.
pub async fn bind_first_free(host: &str, port_spec: &str, backlog: u32) -> Result<TcpListener> {
    let ports = parse_port_range(port_spec)?;
    let ip = resolve_host(host).await?;

    for port in ports {
        let addr = SocketAddr::new(ip, port);
        match listen_on(addr, backlog) {
            Ok(listener) => return Ok(listener),
            Err(error) => {
                tracing::debug!("could not bind BLOB server to {}: {}", addr, error);
            }
        }
    }

    Err(BlobError::Io(std::io::Error::new(
        std::io::ErrorKind::AddrInUse,
        format!(
            "unable to open BLOB server on {} in specified port range '{}'",
            host, port_spec
        ),
    )))
}

fn listen_on(addr: SocketAddr, backlog: u32) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

async fn resolve_host(host: &str) -> Result<IpAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }

    tokio::net::lookup_host((host, 0))
        .await?
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(|| BlobError::Config(format!("could not resolve bind host '{}'", host)))
}
