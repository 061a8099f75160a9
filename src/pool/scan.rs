//! Batch TCP port scan on top of the worker pool.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::{run_pool, service_name};
use crate::probe::connect_addr;

/// Errors that prevent a scan from starting.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("failed to resolve {host}: {reason}")]
    Resolve { host: String, reason: String },
    #[error("invalid port range {start}-{end}")]
    InvalidRange { start: u16, end: u16 },
    #[error("worker count must be at least 1")]
    NoWorkers,
}

/// One scanned port.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortResult {
    pub port: u16,
    pub open: bool,
    pub latency: Duration,
    pub service: Option<&'static str>,
    /// Why the port counted as closed.
    pub detail: Option<String>,
}

/// Scan tuning.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub timeout: Duration,
    pub workers: usize,
    /// Keep closed/filtered ports in the result list.
    pub retain_closed: bool,
    pub bind_address: Option<IpAddr>,
    pub cancel: CancellationToken,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(500),
            workers: 100,
            retain_closed: false,
            bind_address: None,
            cancel: CancellationToken::new(),
        }
    }
}

/// Expand an inclusive port range, rejecting port 0 and reversed bounds.
pub fn port_range(start: u16, end: u16) -> Result<Vec<u16>, ScanError> {
    if start == 0 || start > end {
        return Err(ScanError::InvalidRange { start, end });
    }
    Ok((start..=end).collect())
}

async fn resolve_host(host: &str) -> Result<IpAddr, ScanError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }

    let resolve_err = |reason: String| ScanError::Resolve {
        host: host.to_string(),
        reason,
    };
    tokio::net::lookup_host((host, 0))
        .await
        .map_err(|e| resolve_err(e.to_string()))?
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| resolve_err("no addresses found".to_string()))
}

/// Scan `ports` on `host` and return the open ones, sorted by port.
///
/// Blocks until every port has been attempted.
pub async fn scan(
    host: &str,
    ports: Vec<u16>,
    timeout: Duration,
    workers: usize,
) -> Result<Vec<PortResult>, ScanError> {
    scan_with(
        host,
        ports,
        ScanOptions {
            timeout,
            workers,
            ..Default::default()
        },
    )
    .await
}

/// Scan with explicit options. Results are sorted by port.
pub async fn scan_with(
    host: &str,
    ports: Vec<u16>,
    options: ScanOptions,
) -> Result<Vec<PortResult>, ScanError> {
    if options.workers == 0 {
        return Err(ScanError::NoWorkers);
    }
    let ip = resolve_host(host).await?;
    let total = ports.len();
    let ScanOptions {
        timeout,
        workers,
        retain_closed,
        bind_address,
        cancel,
    } = options;

    tracing::info!(
        "Scanning {} ({}) ports={} workers={} timeout={:?}",
        host,
        ip,
        total,
        workers,
        timeout
    );

    let mut results = run_pool(ports, workers, cancel, move |port| async move {
        let addr = SocketAddr::new(ip, port);
        let started = Instant::now();
        match connect_addr(addr, timeout, bind_address).await {
            Ok(latency) => Some(PortResult {
                port,
                open: true,
                latency,
                service: service_name(port),
                detail: None,
            }),
            Err(e) if retain_closed => Some(PortResult {
                port,
                open: false,
                latency: started.elapsed(),
                service: service_name(port),
                detail: Some(e.to_string()),
            }),
            Err(_) => None,
        }
    })
    .await;

    results.sort_by_key(|r| r.port);
    tracing::info!(
        "Scan of {} complete: {} open of {}",
        host,
        results.iter().filter(|r| r.open).count(),
        total
    );
    Ok(results)
}
