//! Target and outcome model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// The strategy used to probe a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    /// Transport-layer connect to `host:port`.
    Tcp,
    /// HTTP GET with a status code check.
    Http,
    /// ICMP echo request/reply.
    Icmp,
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProbeKind::Tcp => "tcp",
            ProbeKind::Http => "http",
            ProbeKind::Icmp => "icmp",
        };
        f.pad(name)
    }
}

/// Probe-kind-specific success criterion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Expectation {
    /// A connection or echo reply is enough.
    Reachable,
    /// The HTTP response must carry exactly this status code.
    Status(u16),
}

/// An immutable description of one thing to monitor.
///
/// Built by [`crate::config::validate_targets`], then shared as `Arc<Target>`
/// between its scheduler loop and the result store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Target {
    /// Unique key in the result store.
    pub identity: String,
    pub address: String,
    pub kind: ProbeKind,
    pub interval: Duration,
    pub timeout: Duration,
    pub expectation: Expectation,
}

impl Target {
    /// A TCP connect target with the identity set to its address.
    pub fn tcp(address: &str, interval: Duration, timeout: Duration) -> Self {
        Self {
            identity: address.to_string(),
            address: address.to_string(),
            kind: ProbeKind::Tcp,
            interval,
            timeout,
            expectation: Expectation::Reachable,
        }
    }

    /// An HTTP GET target expecting `status`.
    pub fn http(url: &str, status: u16, interval: Duration, timeout: Duration) -> Self {
        Self {
            identity: url.to_string(),
            address: url.to_string(),
            kind: ProbeKind::Http,
            interval,
            timeout,
            expectation: Expectation::Status(status),
        }
    }

    /// An ICMP echo target.
    pub fn icmp(host: &str, interval: Duration, timeout: Duration) -> Self {
        Self {
            identity: host.to_string(),
            address: host.to_string(),
            kind: ProbeKind::Icmp,
            interval,
            timeout,
            expectation: Expectation::Reachable,
        }
    }

    pub fn with_identity(mut self, identity: &str) -> Self {
        self.identity = identity.to_string();
        self
    }
}

/// The immutable result of one probe attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outcome {
    pub succeeded: bool,
    /// Wall-clock duration of the attempt, measured on failure too.
    pub latency: Duration,
    /// Present iff `succeeded` is false.
    pub failure_detail: Option<String>,
    pub observed_at: DateTime<Utc>,
}

impl Outcome {
    pub fn success(latency: Duration) -> Self {
        Self {
            succeeded: true,
            latency,
            failure_detail: None,
            observed_at: Utc::now(),
        }
    }

    pub fn failure(latency: Duration, detail: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            latency,
            failure_detail: Some(detail.into()),
            observed_at: Utc::now(),
        }
    }
}

/// Observable status of a configured target.
#[derive(Debug, Clone, PartialEq)]
pub enum Status {
    /// No probe has completed yet.
    Pending,
    /// The latest probe succeeded.
    Healthy(Arc<Outcome>),
    /// The latest probe failed.
    Failed(Arc<Outcome>),
}

impl Status {
    pub fn from_outcome(outcome: Arc<Outcome>) -> Self {
        if outcome.succeeded {
            Status::Healthy(outcome)
        } else {
            Status::Failed(outcome)
        }
    }

    pub fn outcome(&self) -> Option<&Outcome> {
        match self {
            Status::Pending => None,
            Status::Healthy(o) | Status::Failed(o) => Some(o),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Status::Pending)
    }
}

/// One row of a result store snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotEntry {
    pub target: Arc<Target>,
    pub status: Status,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_carries_detail() {
        let outcome = Outcome::failure(Duration::from_millis(3), "connection refused");
        assert!(!outcome.succeeded);
        assert_eq!(outcome.failure_detail.as_deref(), Some("connection refused"));

        let ok = Outcome::success(Duration::from_millis(3));
        assert!(ok.failure_detail.is_none());
    }

    #[test]
    fn test_status_from_outcome() {
        let failed = Status::from_outcome(Arc::new(Outcome::failure(Duration::ZERO, "x")));
        assert!(matches!(failed, Status::Failed(_)));
        let healthy = Status::from_outcome(Arc::new(Outcome::success(Duration::ZERO)));
        assert!(matches!(healthy, Status::Healthy(_)));
        assert!(Status::Pending.outcome().is_none());
    }

    #[test]
    fn test_probe_kind_serde() {
        let kind: ProbeKind = serde_json::from_str("\"icmp\"").unwrap();
        assert_eq!(kind, ProbeKind::Icmp);
        assert!(serde_json::from_str::<ProbeKind>("\"udp\"").is_err());
    }
}
