//! TCP connect probe implementation.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use tokio::net::TcpSocket;

use super::ProbeError;

/// Resolve `host:port` to a socket address.
pub async fn resolve_socket_addr(address: &str) -> Result<SocketAddr, ProbeError> {
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok(addr);
    }

    tokio::net::lookup_host(address)
        .await
        .map_err(|e| ProbeError::Dns(format!("{}: {}", address, e)))?
        .next()
        .ok_or_else(|| ProbeError::Dns(format!("no addresses found for {}", address)))
}

/// Run a TCP connect probe against `host:port`.
///
/// The connection is closed as soon as it is established; no data is sent.
/// Returns the connect latency.
pub async fn run_tcp_probe(
    address: &str,
    timeout: Duration,
    bind: Option<IpAddr>,
) -> Result<Duration, ProbeError> {
    let addr = resolve_socket_addr(address).await?;
    connect_addr(addr, timeout, bind).await
}

/// Connect to an already resolved address.
pub async fn connect_addr(
    addr: SocketAddr,
    timeout: Duration,
    bind: Option<IpAddr>,
) -> Result<Duration, ProbeError> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .map_err(|e| ProbeError::from_io(e, timeout))?;

    if let Some(ip) = bind {
        socket
            .bind(SocketAddr::new(ip, 0))
            .map_err(|e| ProbeError::Network(format!("failed to bind {}: {}", ip, e)))?;
    }

    let start = Instant::now();
    let stream = tokio::time::timeout(timeout, socket.connect(addr))
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
        .map_err(|e| ProbeError::from_io(e, timeout))?;
    let latency = start.elapsed();

    drop(stream);
    Ok(latency)
}
