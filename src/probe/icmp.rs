//! ICMP echo probe using native sockets.
//!
//! Uses blocking sockets in spawn_blocking for sub-millisecond timing precision.

use std::io::Read;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;

use super::ProbeError;

const ICMPV4_ECHO_REQUEST: u8 = 8;
const ICMPV4_ECHO_REPLY: u8 = 0;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;

/// Fixed payload carried by every echo request.
const ECHO_PAYLOAD: &[u8] = b"netprobe icmp echo payload";

/// Sequence counter shared by all echo requests of this process.
static ECHO_SEQUENCE: AtomicU16 = AtomicU16::new(1);

/// Raised at startup when ICMP targets are configured but no ICMP socket can
/// be opened.
#[derive(Error, Debug)]
#[error("ICMP probes require CAP_NET_RAW, root, or an unprivileged ping group: {0}")]
pub struct PrivilegeError(pub String);

/// Which kind of ICMP socket the process may open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpSocketKind {
    /// Requires CAP_NET_RAW or root. Replies include the IPv4 header.
    Raw,
    /// Unprivileged ping socket. The kernel owns the echo identifier.
    Dgram,
}

impl IcmpSocketKind {
    fn socket_type(self) -> Type {
        match self {
            IcmpSocketKind::Raw => Type::RAW,
            IcmpSocketKind::Dgram => Type::DGRAM,
        }
    }
}

/// Detect whether ICMPv4 sockets can be opened, trying RAW first.
pub fn check_icmp_privilege() -> Result<IcmpSocketKind, PrivilegeError> {
    detect_socket_kind(Domain::IPV4, Protocol::ICMPV4, "ICMPv4")
}

/// Same as [`check_icmp_privilege`] for ICMPv6.
pub fn check_icmpv6_privilege() -> Result<IcmpSocketKind, PrivilegeError> {
    detect_socket_kind(Domain::IPV6, Protocol::ICMPV6, "ICMPv6")
}

fn detect_socket_kind(
    domain: Domain,
    protocol: Protocol,
    family: &str,
) -> Result<IcmpSocketKind, PrivilegeError> {
    if Socket::new(domain, Type::RAW, Some(protocol)).is_ok() {
        tracing::info!("{} probe: using RAW socket (privileged)", family);
        return Ok(IcmpSocketKind::Raw);
    }

    match Socket::new(domain, Type::DGRAM, Some(protocol)) {
        Ok(_) => {
            tracing::info!("{} probe: using DGRAM socket (unprivileged)", family);
            Ok(IcmpSocketKind::Dgram)
        }
        Err(e) => Err(PrivilegeError(format!("{}: {}", family, e))),
    }
}

/// Sends one echo request per probe and waits for the matching reply.
#[derive(Debug, Clone)]
pub struct IcmpProber {
    kind: IcmpSocketKind,
    /// Set once ICMPv6 capability has been checked.
    kind_v6: Option<IcmpSocketKind>,
    identifier: u16,
}

impl IcmpProber {
    /// Check the ICMPv4 capability and build a prober. Call before scheduling
    /// starts.
    pub fn new() -> Result<Self, PrivilegeError> {
        let kind = check_icmp_privilege()?;
        Ok(Self {
            kind,
            kind_v6: None,
            identifier: rand::random(),
        })
    }

    /// Also require ICMPv6 capability.
    pub fn with_ipv6(mut self) -> Result<Self, PrivilegeError> {
        self.kind_v6 = Some(check_icmpv6_privilege()?);
        Ok(self)
    }

    pub fn socket_kind(&self) -> IcmpSocketKind {
        self.kind
    }

    /// Ping `address` once. Returns the send-to-reply round trip time.
    pub async fn ping(&self, address: &str, timeout: Duration) -> Result<Duration, ProbeError> {
        // Resolve before spawn_blocking (DNS is async)
        let ip = resolve_address(address).await?;
        let kind = match ip {
            IpAddr::V4(_) => self.kind,
            IpAddr::V6(_) => self.kind_v6.unwrap_or(self.kind),
        };
        let identifier = self.identifier;
        let sequence = ECHO_SEQUENCE.fetch_add(1, Ordering::Relaxed);

        tokio::task::spawn_blocking(move || {
            run_blocking_ping(ip, kind, identifier, sequence, timeout)
        })
        .await
        .map_err(|e| ProbeError::Network(format!("spawn_blocking failed: {}", e)))?
    }
}

/// Whether `address` is an IPv6 literal, optionally bracketed.
pub fn is_ipv6_literal(address: &str) -> bool {
    address
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<std::net::Ipv6Addr>()
        .is_ok()
}

/// Resolve hostname to IP address.
async fn resolve_address(address: &str) -> Result<IpAddr, ProbeError> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }

    tokio::net::lookup_host(format!("{}:0", address))
        .await
        .map_err(|e| ProbeError::Dns(format!("{}: {}", address, e)))?
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| ProbeError::Dns(format!("no addresses found for {}", address)))
}

fn run_blocking_ping(
    ip: IpAddr,
    kind: IcmpSocketKind,
    identifier: u16,
    sequence: u16,
    timeout: Duration,
) -> Result<Duration, ProbeError> {
    let (domain, protocol) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6),
    };
    let socket = Socket::new(domain, kind.socket_type(), Some(protocol))
        .map_err(|e| ProbeError::from_io(e, timeout))?;

    socket
        .set_write_timeout(Some(timeout))
        .map_err(|e| ProbeError::Network(format!("failed to set timeout: {}", e)))?;
    socket
        .connect(&SocketAddr::new(ip, 0).into())
        .map_err(|e| ProbeError::from_io(e, timeout))?;

    let packet = match ip {
        IpAddr::V4(_) => build_echo_request(ICMPV4_ECHO_REQUEST, identifier, sequence, true),
        // The kernel computes the ICMPv6 checksum.
        IpAddr::V6(_) => build_echo_request(ICMPV6_ECHO_REQUEST, identifier, sequence, false),
    };

    let deadline = Instant::now() + timeout;
    let start = Instant::now();
    socket
        .send(&packet)
        .map_err(|e| ProbeError::from_io(e, timeout))?;

    let mut buf = [0u8; 1500];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ProbeError::Timeout(timeout));
        }
        socket
            .set_read_timeout(Some(remaining))
            .map_err(|e| ProbeError::Network(format!("failed to set timeout: {}", e)))?;

        let len = (&socket)
            .read(&mut buf)
            .map_err(|e| ProbeError::from_io(e, timeout))?;
        let elapsed = start.elapsed();

        let reply = match ip {
            IpAddr::V4(_) => parse_echo_reply_v4(&buf[..len]),
            IpAddr::V6(_) => parse_echo_reply(&buf[..len], ICMPV6_ECHO_REPLY),
        };

        if let Some((reply_id, reply_seq)) = reply {
            // Ping sockets rewrite the identifier, and only deliver our own replies.
            let id_matches = kind == IcmpSocketKind::Dgram || reply_id == identifier;
            if id_matches && reply_seq == sequence {
                return Ok(elapsed);
            }
        }
        // Someone else's packet; keep waiting
    }
}

/// Build an echo request with the fixed payload.
fn build_echo_request(icmp_type: u8, identifier: u16, sequence: u16, checksum: bool) -> Vec<u8> {
    let mut packet = vec![0u8; 8 + ECHO_PAYLOAD.len()];

    packet[0] = icmp_type;
    packet[1] = 0;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());
    packet[8..].copy_from_slice(ECHO_PAYLOAD);

    if checksum {
        let sum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&sum.to_be_bytes());
    }

    packet
}

/// IPv4 replies carry the IP header on RAW sockets but not on DGRAM ones.
fn parse_echo_reply_v4(buf: &[u8]) -> Option<(u16, u16)> {
    let offset = match buf.first() {
        Some(b) if b >> 4 == 4 => ((b & 0x0F) as usize) * 4,
        _ => 0,
    };
    parse_echo_reply(buf.get(offset..)?, ICMPV4_ECHO_REPLY)
}

/// Extract (identifier, sequence) from an ICMP echo reply header.
fn parse_echo_reply(icmp: &[u8], reply_type: u8) -> Option<(u16, u16)> {
    if icmp.len() < 8 || icmp[0] != reply_type {
        return None;
    }
    let id = u16::from_be_bytes([icmp[4], icmp[5]]);
    let seq = u16::from_be_bytes([icmp[6], icmp[7]]);
    Some((id, seq))
}

/// Compute ICMP checksum (RFC 1071).
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u16::from_be_bytes([pair[0], pair[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}

/// Statistics over a sequence of echo attempts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PingSummary {
    pub sent: u32,
    pub received: u32,
    pub min: Option<Duration>,
    pub max: Option<Duration>,
    total: Duration,
}

impl PingSummary {
    /// Record one attempt; `rtt` is `None` for a lost reply.
    pub fn record(&mut self, rtt: Option<Duration>) {
        self.sent += 1;
        if let Some(rtt) = rtt {
            self.received += 1;
            self.total += rtt;
            self.min = Some(self.min.map_or(rtt, |m| m.min(rtt)));
            self.max = Some(self.max.map_or(rtt, |m| m.max(rtt)));
        }
    }

    pub fn avg(&self) -> Option<Duration> {
        (self.received > 0).then(|| self.total / self.received)
    }

    pub fn loss_percent(&self) -> f64 {
        if self.sent == 0 {
            return 0.0;
        }
        (self.sent - self.received) as f64 / self.sent as f64 * 100.0
    }
}
