//! TCP connect probe.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;

use super::ProbeError;
use crate::validation::split_host_port;

/// Open a TCP connection to `host:port` and return the connect time.
pub async fn run_tcp_probe(address: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    let deadline = Instant::now() + timeout;
    let addr = resolve_socket_addr(address, timeout).await?;

    let remaining = deadline.saturating_duration_since(Instant::now());
    let start = Instant::now();
    let stream = tokio::time::timeout(remaining, TcpStream::connect(addr))
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
        .map_err(|e| ProbeError::Network(format!("connect to {} failed: {}", addr, e)))?;
    let elapsed = start.elapsed();

    drop(stream);
    Ok(elapsed)
}

/// Resolve `host:port` to the first socket address, bounded by `timeout`.
pub(crate) async fn resolve_socket_addr(address: &str, timeout: Duration) -> Result<SocketAddr, ProbeError> {
    let (host, port) =
        split_host_port(address).ok_or_else(|| ProbeError::Config(format!("expected host:port, got {}", address)))?;

    let lookup = tokio::net::lookup_host((host, port));
    tokio::time::timeout(timeout, lookup)
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
        .map_err(|e| ProbeError::Network(format!("DNS resolution failed: {}", e)))?
        .next()
        .ok_or_else(|| ProbeError::Network(format!("no addresses found for {}", host)))
}
