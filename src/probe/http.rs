//! HTTP probe implementation.

use std::time::{Duration, Instant};

use super::{ProbeError, ProbeOptions};

/// Status expected when a target does not name one.
pub const DEFAULT_EXPECTED_STATUS: u16 = 200;

/// Build the shared client used by HTTP probes.
///
/// No client-wide timeout is set; each request carries its target's timeout.
/// Proxies are never used, so a probe measures the target itself.
pub fn build_http_client(options: &ProbeOptions) -> Result<reqwest::Client, ProbeError> {
    let mut builder = reqwest::Client::builder().no_proxy();
    if let Some(ip) = options.bind_address {
        builder = builder.local_address(ip);
    }
    builder
        .build()
        .map_err(|e| ProbeError::Network(e.to_string()))
}

fn normalize_url(address: &str) -> String {
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    }
}

/// Find the I/O error underneath a transport failure, if any.
fn io_cause(e: &reqwest::Error) -> Option<&std::io::Error> {
    let mut source = std::error::Error::source(e);
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            return Some(io);
        }
        source = err.source();
    }
    None
}

/// Run an HTTP GET probe against the given address.
///
/// Succeeds only when the response status equals `expected`. Returns latency
/// from request start to response headers.
pub async fn run_http_probe(
    client: &reqwest::Client,
    address: &str,
    expected: u16,
    timeout: Duration,
) -> Result<Duration, ProbeError> {
    let url = normalize_url(address);

    let start = Instant::now();

    let response = client
        .get(&url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                ProbeError::Timeout(timeout)
            } else if io_cause(&e).map(|io| io.kind())
                == Some(std::io::ErrorKind::ConnectionRefused)
            {
                ProbeError::Refused
            } else {
                ProbeError::Network(e.to_string())
            }
        })?;

    let latency = start.elapsed();
    let observed = response.status().as_u16();
    if observed != expected {
        return Err(ProbeError::UnexpectedStatus { observed, expected });
    }

    Ok(latency)
}
