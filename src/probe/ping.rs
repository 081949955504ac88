//! Ping probe: native ICMP echo with a `ping` command fallback.
//!
//! Native echoes run on a blocking socket inside `spawn_blocking` so the
//! round-trip measurement is not skewed by the async scheduler.

use std::io::Read;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use chrono::Utc;
use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::ProbeError;

#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    Native,
    CommandOnly,
}

/// How the echo socket was opened.
#[derive(Debug, Clone, Copy, PartialEq)]
enum EchoSocket {
    /// Sees every ICMP message, with the IPv4 header in front.
    Raw,
    /// The kernel rewrites the identifier and routes only our replies here.
    Dgram,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

/// ICMP parameters that differ between IPv4 and IPv6.
struct EchoFamily {
    domain: Domain,
    protocol: Protocol,
    request_type: u8,
    reply_type: u8,
    /// The kernel fills in the ICMPv6 checksum; ICMPv4 needs ours.
    needs_checksum: bool,
}

const ECHO_V4: EchoFamily = EchoFamily {
    domain: Domain::IPV4,
    protocol: Protocol::ICMPV4,
    request_type: 8,
    reply_type: 0,
    needs_checksum: true,
};

const ECHO_V6: EchoFamily = EchoFamily {
    domain: Domain::IPV6,
    protocol: Protocol::ICMPV6,
    request_type: 128,
    reply_type: 129,
    needs_checksum: false,
};

fn detect_icmp_capability() -> IcmpCapability {
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (RAW socket)");
        return IcmpCapability::Native;
    }
    if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (DGRAM socket)");
        return IcmpCapability::Native;
    }
    tracing::info!("Ping probe: native ICMP unavailable, using command fallback");
    IcmpCapability::CommandOnly
}

/// Ping the host once and return the round-trip time.
pub async fn run_ping_probe(address: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    let capability = *ICMP_CAPABILITY.get_or_init(detect_icmp_capability);
    if capability == IcmpCapability::CommandOnly {
        return run_ping_command(address, timeout).await;
    }

    let ip = resolve_address(address, timeout).await?;
    let result = tokio::task::spawn_blocking(move || echo_blocking(ip, timeout))
        .await
        .map_err(|e| ProbeError::Network(format!("ping task failed: {}", e)))?;

    match result {
        Err(ProbeError::Network(msg)) if is_permission_error(&msg) => {
            tracing::warn!("Native ping to {} not permitted, falling back to command: {}", address, msg);
            run_ping_command(address, timeout).await
        }
        other => other,
    }
}

fn is_permission_error(msg: &str) -> bool {
    msg.contains("Permission") || msg.contains("not permitted") || msg.contains("denied")
}

async fn resolve_address(address: &str, timeout: Duration) -> Result<IpAddr, ProbeError> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }

    let lookup = tokio::net::lookup_host(format!("{}:0", address));
    tokio::time::timeout(timeout, lookup)
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
        .map_err(|e| ProbeError::Network(format!("DNS resolution failed: {}", e)))?
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| ProbeError::Network(format!("no addresses found for {}", address)))
}

fn echo_blocking(ip: IpAddr, timeout: Duration) -> Result<Duration, ProbeError> {
    let family = match ip {
        IpAddr::V4(_) => &ECHO_V4,
        IpAddr::V6(_) => &ECHO_V6,
    };
    let net_err = |what: &str, e: std::io::Error| ProbeError::Network(format!("{}: {}", what, e));

    // RAW needs privileges; DGRAM works unprivileged where ping_group_range allows it
    let (socket, kind) = match Socket::new(family.domain, Type::RAW, Some(family.protocol)) {
        Ok(socket) => (socket, EchoSocket::Raw),
        Err(_) => {
            let socket = Socket::new(family.domain, Type::DGRAM, Some(family.protocol))
                .map_err(|e| net_err("failed to create ICMP socket", e))?;
            (socket, EchoSocket::Dgram)
        }
    };
    socket
        .set_read_timeout(Some(timeout))
        .map_err(|e| net_err("failed to set timeout", e))?;
    socket
        .set_write_timeout(Some(timeout))
        .map_err(|e| net_err("failed to set timeout", e))?;
    socket
        .connect(&SocketAddr::new(ip, 0).into())
        .map_err(|e| net_err("failed to connect", e))?;

    let identifier: u16 = rand::random();
    let sequence = PING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let packet = build_echo_request(family, identifier, sequence);

    let start = Instant::now();
    socket.send(&packet).map_err(|e| net_err("failed to send", e))?;

    let mut buf = [0u8; 1500];
    loop {
        let len = (&socket).read(&mut buf).map_err(|e| match e.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => ProbeError::Timeout(timeout),
            _ => net_err("failed to receive", e),
        })?;
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(ProbeError::Timeout(timeout));
        }
        if is_matching_reply(family, kind, &buf[..len], identifier, sequence) {
            return Ok(elapsed);
        }
    }
}

/// Match our echo reply, skipping an IPv4 header when a RAW socket delivers one.
///
/// DGRAM replies carry the kernel's identifier, so only type and sequence count.
fn is_matching_reply(
    family: &EchoFamily,
    kind: EchoSocket,
    packet: &[u8],
    identifier: u16,
    sequence: u16,
) -> bool {
    let raw = kind == EchoSocket::Raw;
    let offset = if raw && family.needs_checksum && packet.first().is_some_and(|b| b >> 4 == 4) {
        usize::from(packet[0] & 0x0F) * 4
    } else {
        0
    };
    let Some(icmp) = packet.get(offset..offset + 8) else {
        return false;
    };
    icmp[0] == family.reply_type
        && (!raw || u16::from_be_bytes([icmp[4], icmp[5]]) == identifier)
        && u16::from_be_bytes([icmp[6], icmp[7]]) == sequence
}

fn build_echo_request(family: &EchoFamily, identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64];
    packet[0] = family.request_type;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    let stamp = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    packet[8..16].copy_from_slice(&stamp.to_be_bytes());

    if family.needs_checksum {
        let checksum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }
    packet
}

/// RFC 1071 internet checksum.
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|pair| match pair {
            [hi, lo] => u32::from(u16::from_be_bytes([*hi, *lo])),
            [hi] => u32::from(*hi) << 8,
            _ => 0,
        })
        .sum();
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

async fn run_ping_command(address: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    let timeout_secs = timeout.as_secs().max(1);

    let output = Command::new("ping")
        .args(["-c", "1", "-W", &timeout_secs.to_string(), address])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ProbeError::Command(format!("failed to execute ping: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("timeout") || stdout.contains("100% packet loss") || stdout.contains("100.0% packet loss")
        {
            return Err(ProbeError::Timeout(timeout));
        }
        return Err(ProbeError::Command(format!("ping failed: {}{}", stdout.trim(), stderr.trim())));
    }

    parse_ping_output(&stdout)
}

/// Extract the round trip from `ping` output (per-packet time, or the summary average).
fn parse_ping_output(output: &str) -> Result<Duration, ProbeError> {
    static PER_PACKET: OnceLock<Regex> = OnceLock::new();
    static SUMMARY: OnceLock<Regex> = OnceLock::new();

    let per_packet = PER_PACKET.get_or_init(|| Regex::new(r"time[=<](?P<ms>[0-9.]+)\s*ms").unwrap());
    let summary = SUMMARY.get_or_init(|| {
        Regex::new(r"(?:round-trip|rtt)\s+min/avg/max/(?:stddev|mdev)\s*=\s*[0-9.]+/(?P<ms>[0-9.]+)/").unwrap()
    });

    per_packet
        .captures(output)
        .or_else(|| summary.captures(output))
        .and_then(|caps| caps.name("ms"))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .map(|ms| Duration::from_secs_f64(ms / 1000.0))
        .ok_or_else(|| ProbeError::Command(format!("failed to parse ping output: {}", output)))
}
