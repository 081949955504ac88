//! UDP echo probe.
//!
//! Sends a datagram and waits for any reply. An ICMP port-unreachable shows up
//! as a refused receive and counts as DOWN, as does silence until the timeout.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;

use super::tcp::resolve_socket_addr;
use super::{Observation, ProbeError};

/// Datagram sent when the target has no payload configured.
const DEFAULT_PAYLOAD: &[u8] = b"\n";

/// Probe a UDP service at `host:port`.
///
/// When `expected` is set, the reply must contain it.
pub async fn run_udp_probe(
    address: &str,
    expected: Option<&str>,
    timeout: Duration,
) -> Result<Observation, ProbeError> {
    let deadline = Instant::now() + timeout;
    let addr = resolve_socket_addr(address, timeout).await?;

    let bind_addr: SocketAddr = if addr.is_ipv4() {
        ([0u8; 4], 0).into()
    } else {
        ([0u16; 8], 0).into()
    };
    let socket = UdpSocket::bind(bind_addr)
        .await
        .map_err(|e| ProbeError::Network(format!("failed to bind socket: {}", e)))?;
    socket
        .connect(addr)
        .await
        .map_err(|e| ProbeError::Network(format!("failed to connect: {}", e)))?;

    let start = Instant::now();
    socket
        .send(DEFAULT_PAYLOAD)
        .await
        .map_err(|e| ProbeError::Network(format!("failed to send: {}", e)))?;

    let mut response = [0u8; 2048];
    let remaining = deadline.saturating_duration_since(Instant::now());
    let n = tokio::time::timeout(remaining, socket.recv(&mut response))
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::ConnectionRefused => ProbeError::Network(format!("port unreachable: {}", addr)),
            _ => ProbeError::Network(format!("failed to recv: {}", e)),
        })?;
    let latency = start.elapsed();

    let body = String::from_utf8_lossy(&response[..n]).into_owned();
    if let Some(expected) = expected {
        if !body.contains(expected) {
            return Err(ProbeError::ExpectationMismatch(format!(
                "reply does not contain {:?}",
                expected
            )));
        }
    }

    Ok(Observation {
        latency,
        body: Some(body),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn echo_server(reply: &'static [u8]) -> SocketAddr {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            if let Ok((_, peer)) = server.recv_from(&mut buf).await {
                let _ = server.send_to(reply, peer).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_udp_probe_reply() {
        let addr = echo_server(b"pong").await;
        let obs = run_udp_probe(&addr.to_string(), Some("pong"), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(obs.body.as_deref(), Some("pong"));
    }

    #[tokio::test]
    async fn test_udp_probe_unexpected_reply() {
        let addr = echo_server(b"nope").await;
        let err = run_udp_probe(&addr.to_string(), Some("pong"), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::ExpectationMismatch(_)));
    }

    #[tokio::test]
    async fn test_udp_probe_silence_times_out() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = silent.local_addr().unwrap();
        let err = run_udp_probe(&addr.to_string(), None, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Timeout(_)));
        drop(silent);
    }
}
