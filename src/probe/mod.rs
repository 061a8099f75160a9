//! Probe module for network monitoring.
//!
//! Supports TCP connect, HTTP GET and ICMP echo probes.

mod http;
mod icmp;
mod tcp;

pub use http::*;
pub use icmp::*;
pub use tcp::*;

use crate::store::{Expectation, Outcome, ProbeKind, Target};

use async_trait::async_trait;
use std::io;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Probe error types. Every variant ends up as a failed [`Outcome`].
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection refused")]
    Refused,
    #[error("host unreachable: {0}")]
    Unreachable(String),
    #[error("DNS resolution failed: {0}")]
    Dns(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("unexpected status: {observed} != {expected}")]
    UnexpectedStatus { observed: u16, expected: u16 },
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("{0} probes are not enabled")]
    Unsupported(ProbeKind),
}

impl ProbeError {
    /// Classify an I/O error from a socket operation.
    pub fn from_io(e: io::Error, timeout: Duration) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionRefused => ProbeError::Refused,
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ProbeError::Timeout(timeout),
            io::ErrorKind::HostUnreachable | io::ErrorKind::NetworkUnreachable => {
                ProbeError::Unreachable(e.to_string())
            }
            io::ErrorKind::OutOfMemory => ProbeError::ResourceExhausted(e.to_string()),
            // EMFILE / ENFILE
            _ if matches!(e.raw_os_error(), Some(23) | Some(24)) => {
                ProbeError::ResourceExhausted(e.to_string())
            }
            _ => ProbeError::Network(e.to_string()),
        }
    }
}

/// A strategy that performs one bounded check against one target.
///
/// Returns the measured latency on success.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, target: &Target) -> Result<Duration, ProbeError>;
}

/// Options shared by the built-in probe strategies.
#[derive(Debug, Clone, Default)]
pub struct ProbeOptions {
    /// Local source address for TCP and HTTP probes.
    pub bind_address: Option<IpAddr>,
}

/// The built-in prober, dispatching on [`ProbeKind`].
pub struct NetworkProber {
    options: ProbeOptions,
    http: reqwest::Client,
    icmp: Option<IcmpProber>,
}

impl NetworkProber {
    /// Build a prober without ICMP support.
    pub fn new(options: ProbeOptions) -> Result<Self, ProbeError> {
        let http = build_http_client(&options)?;
        Ok(Self {
            options,
            http,
            icmp: None,
        })
    }

    /// Enable ICMP echo probes. The capability must already be checked.
    pub fn with_icmp(mut self, icmp: IcmpProber) -> Self {
        self.icmp = Some(icmp);
        self
    }
}

#[async_trait]
impl Prober for NetworkProber {
    async fn probe(&self, target: &Target) -> Result<Duration, ProbeError> {
        match target.kind {
            ProbeKind::Tcp => {
                run_tcp_probe(&target.address, target.timeout, self.options.bind_address).await
            }
            ProbeKind::Http => {
                let expected = match target.expectation {
                    Expectation::Status(code) => code,
                    Expectation::Reachable => DEFAULT_EXPECTED_STATUS,
                };
                run_http_probe(&self.http, &target.address, expected, target.timeout).await
            }
            ProbeKind::Icmp => match &self.icmp {
                Some(icmp) => icmp.ping(&target.address, target.timeout).await,
                None => Err(ProbeError::Unsupported(ProbeKind::Icmp)),
            },
        }
    }
}

/// Run one probe for `target`, bounded by its timeout, and build the outcome.
///
/// Never fails: errors become a failed outcome whose latency is the elapsed
/// wall-clock time of the attempt.
pub async fn run_probe(prober: &dyn Prober, target: &Target) -> Outcome {
    let start = Instant::now();
    let result = match tokio::time::timeout(target.timeout, prober.probe(target)).await {
        Ok(result) => result,
        Err(_) => Err(ProbeError::Timeout(target.timeout)),
    };

    match result {
        Ok(latency) => Outcome::success(latency),
        Err(e) => Outcome::failure(start.elapsed(), e.to_string()),
    }
}
