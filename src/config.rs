//! Configuration module for netprobe.
//!
//! Engine settings come from environment variables with sensible defaults;
//! the monitored targets come from a JSON file.

use std::collections::HashSet;
use std::env;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::store::{Expectation, ProbeKind, Target};

/// Default time between probes for a target.
pub const DEFAULT_INTERVAL_MS: u64 = 5_000;
/// Default per-attempt timeout for a target.
pub const DEFAULT_TIMEOUT_MS: u64 = 3_000;

/// Configuration errors. All are fatal before any task starts.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse target list: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("target #{index} ({identity}): {reason}")]
    InvalidTarget {
        index: usize,
        identity: String,
        reason: String,
    },
    #[error("duplicate target identity: {0}")]
    DuplicateIdentity(String),
}

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How often the reporter renders a snapshot (default: 2s)
    pub report_interval: Duration,
    /// Local source address for TCP and HTTP probes (default: unset)
    pub bind_address: Option<IpAddr>,
    /// Worker count for batch scans (default: 100)
    pub scan_workers: usize,
    /// Per-port timeout for batch scans (default: 500ms)
    pub scan_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            report_interval: Duration::from_millis(2_000),
            bind_address: None,
            scan_workers: 100,
            scan_timeout: Duration::from_millis(500),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `NETPROBE_REPORT_INTERVAL_MS`: reporter period (default: 2000)
    /// - `NETPROBE_BIND_ADDRESS`: source IP for TCP/HTTP probes
    /// - `NETPROBE_SCAN_WORKERS`: scan worker count (default: 100)
    /// - `NETPROBE_SCAN_TIMEOUT_MS`: scan per-port timeout (default: 500)
    ///
    /// Unparseable values fall back to the default.
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(ms) = lookup("NETPROBE_REPORT_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            if ms > 0 {
                cfg.report_interval = Duration::from_millis(ms);
            }
        }

        if let Some(addr) = lookup("NETPROBE_BIND_ADDRESS") {
            match addr.parse() {
                Ok(ip) => cfg.bind_address = Some(ip),
                Err(_) => tracing::warn!("Ignoring invalid NETPROBE_BIND_ADDRESS {:?}", addr),
            }
        }

        if let Some(workers) = lookup("NETPROBE_SCAN_WORKERS").and_then(|v| v.parse().ok()) {
            if workers > 0 {
                cfg.scan_workers = workers;
            }
        }

        if let Some(ms) = lookup("NETPROBE_SCAN_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            if ms > 0 {
                cfg.scan_timeout = Duration::from_millis(ms);
            }
        }

        cfg
    }
}

/// One entry of the target list file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetSpec {
    /// Identity; defaults to `address`.
    pub name: Option<String>,
    pub address: String,
    pub kind: ProbeKind,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// HTTP only; defaults to 200.
    pub expected_status: Option<u16>,
}

fn default_interval_ms() -> u64 {
    DEFAULT_INTERVAL_MS
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

impl TargetSpec {
    fn identity(&self) -> String {
        match &self.name {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => self.address.trim().to_string(),
        }
    }

    /// Validate this entry and build the immutable target.
    pub fn into_target(self, index: usize) -> Result<Target, ConfigError> {
        let identity = self.identity();
        let invalid = |reason: String| ConfigError::InvalidTarget {
            index,
            identity: identity.clone(),
            reason,
        };

        let expectation = match (self.kind, self.expected_status) {
            (ProbeKind::Http, None) => Expectation::Status(crate::probe::DEFAULT_EXPECTED_STATUS),
            (ProbeKind::Http, Some(code)) if (100..=599).contains(&code) => {
                Expectation::Status(code)
            }
            (ProbeKind::Http, Some(code)) => {
                return Err(invalid(format!("expected_status {} is not an HTTP status", code)))
            }
            (kind, Some(_)) => {
                return Err(invalid(format!("expected_status is not valid for {} probes", kind)))
            }
            (_, None) => Expectation::Reachable,
        };

        let target = Target {
            identity,
            address: self.address.trim().to_string(),
            kind: self.kind,
            interval: Duration::from_millis(self.interval_ms),
            timeout: Duration::from_millis(self.timeout_ms),
            expectation,
        };
        check_target(index, &target)?;
        Ok(target)
    }
}

/// Check the invariants every scheduled target must hold.
pub fn check_target(index: usize, target: &Target) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidTarget {
        index,
        identity: target.identity.clone(),
        reason,
    };

    if target.identity.is_empty() {
        return Err(invalid("identity is empty".to_string()));
    }
    if target.address.trim().is_empty() {
        return Err(invalid("address is empty".to_string()));
    }
    if target.interval.is_zero() {
        return Err(invalid("interval must be greater than zero".to_string()));
    }
    if target.timeout.is_zero() {
        return Err(invalid("timeout must be greater than zero".to_string()));
    }
    if target.timeout > target.interval {
        return Err(invalid(format!(
            "timeout {:?} exceeds interval {:?}",
            target.timeout, target.interval
        )));
    }
    if target.kind == ProbeKind::Tcp && !target.address.contains(':') {
        return Err(invalid("tcp address must be host:port".to_string()));
    }
    Ok(())
}

/// Validate a whole target list. Any invalid entry rejects the list.
pub fn validate_targets(specs: Vec<TargetSpec>) -> Result<Vec<Arc<Target>>, ConfigError> {
    let targets = specs
        .into_iter()
        .enumerate()
        .map(|(index, spec)| spec.into_target(index))
        .map(|target| target.map(Arc::new))
        .collect::<Result<Vec<_>, _>>()?;

    check_unique(&targets)?;
    Ok(targets)
}

/// Check every target and reject sets that reuse an identity.
pub fn check_targets(targets: &[Arc<Target>]) -> Result<(), ConfigError> {
    for (index, target) in targets.iter().enumerate() {
        check_target(index, target)?;
    }
    check_unique(targets)
}

fn check_unique(targets: &[Arc<Target>]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for target in targets {
        if !seen.insert(target.identity.as_str()) {
            return Err(ConfigError::DuplicateIdentity(target.identity.clone()));
        }
    }
    Ok(())
}

/// Parse and validate a JSON target list.
pub fn parse_targets(json: &str) -> Result<Vec<Arc<Target>>, ConfigError> {
    let specs: Vec<TargetSpec> = serde_json::from_str(json)?;
    validate_targets(specs)
}

/// Load and validate a JSON target list from disk.
pub fn load_targets(path: impl AsRef<Path>) -> Result<Vec<Arc<Target>>, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    parse_targets(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.report_interval, Duration::from_secs(2));
        assert_eq!(cfg.scan_workers, 100);
        assert!(cfg.bind_address.is_none());
    }

    #[test]
    fn test_config_from_env_values() {
        let vars: HashMap<&str, &str> = [
            ("NETPROBE_REPORT_INTERVAL_MS", "250"),
            ("NETPROBE_BIND_ADDRESS", "127.0.0.1"),
            ("NETPROBE_SCAN_WORKERS", "0"),
            ("NETPROBE_SCAN_TIMEOUT_MS", "nope"),
        ]
        .into_iter()
        .collect();
        let cfg = EngineConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.report_interval, Duration::from_millis(250));
        assert_eq!(cfg.bind_address, Some("127.0.0.1".parse().unwrap()));
        assert_eq!(cfg.scan_workers, 100);
        assert_eq!(cfg.scan_timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_parse_targets_with_defaults() {
        let targets = parse_targets(
            r#"[
                {"name": "web", "address": "http://127.0.0.1:8080", "kind": "http"},
                {"address": "127.0.0.1:22", "kind": "tcp", "interval_ms": 1000, "timeout_ms": 200}
            ]"#,
        )
        .unwrap();

        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].identity, "web");
        assert_eq!(targets[0].expectation, Expectation::Status(200));
        assert_eq!(targets[0].interval, Duration::from_millis(DEFAULT_INTERVAL_MS));
        assert_eq!(targets[1].identity, "127.0.0.1:22");
        assert_eq!(targets[1].expectation, Expectation::Reachable);
        assert_eq!(targets[1].timeout, Duration::from_millis(200));
    }

    #[test]
    fn test_invalid_entry_names_offender() {
        let err = parse_targets(
            r#"[
                {"name": "ok", "address": "127.0.0.1:22", "kind": "tcp"},
                {"name": "bad", "address": "127.0.0.1:23", "kind": "tcp", "interval_ms": 0}
            ]"#,
        )
        .unwrap_err();

        match err {
            ConfigError::InvalidTarget { index, identity, .. } => {
                assert_eq!(index, 1);
                assert_eq!(identity, "bad");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_timeout_above_interval_rejected() {
        let err = parse_targets(
            r#"[{"address": "example.com", "kind": "icmp", "interval_ms": 100, "timeout_ms": 101}]"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("exceeds interval"));
    }

    #[test]
    fn test_duplicate_identity_rejected() {
        let err = parse_targets(
            r#"[
                {"name": "a", "address": "127.0.0.1:22", "kind": "tcp"},
                {"name": "a", "address": "127.0.0.1:80", "kind": "tcp"}
            ]"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateIdentity(id) if id == "a"));
    }

    #[test]
    fn test_unknown_kind_and_misplaced_status_rejected() {
        assert!(matches!(
            parse_targets(r#"[{"address": "x:1", "kind": "udp"}]"#),
            Err(ConfigError::Parse(_))
        ));
        assert!(parse_targets(r#"[{"address": "x:1", "kind": "tcp", "expected_status": 200}]"#)
            .is_err());
        assert!(parse_targets(r#"[{"address": "x", "kind": "http", "expected_status": 42}]"#)
            .is_err());
        assert!(parse_targets(r#"[{"address": "  ", "kind": "icmp"}]"#).is_err());
    }

    #[test]
    fn test_load_targets_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"[{{"address": "127.0.0.1", "kind": "icmp"}}]"#).unwrap();

        let targets = load_targets(file.path()).unwrap();
        assert_eq!(targets[0].kind, ProbeKind::Icmp);

        assert!(matches!(
            load_targets("/nonexistent/targets.json"),
            Err(ConfigError::Read { .. })
        ));
    }
}
