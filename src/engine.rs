//! Engine startup: validates targets, checks ICMP privilege, and starts one
//! probe loop per target.

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::ConfigError;
use crate::probe::{
    is_ipv6_literal, IcmpProber, NetworkProber, PrivilegeError, ProbeError, ProbeOptions, Prober,
};
use crate::scheduler::{Scheduler, SchedulerError};
use crate::store::{ProbeKind, ResultStore, SnapshotEntry, Target};

/// Errors that abort startup. Nothing is scheduled when one is returned.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Privilege(#[from] PrivilegeError),
    #[error("failed to initialise probes: {0}")]
    Probe(#[from] ProbeError),
    #[error("startup cancelled")]
    Cancelled,
}

impl From<SchedulerError> for StartupError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::Config(e) => Self::Config(e),
            SchedulerError::Stopped => Self::Cancelled,
        }
    }
}

/// A running set of monitored targets.
pub struct Engine {
    scheduler: Scheduler,
}

impl Engine {
    /// Start monitoring with the built-in network prober.
    ///
    /// ICMP capability is checked here, before any loop starts, if any target
    /// uses ICMP. ICMPv6 is checked too when an ICMP target is an IPv6
    /// literal.
    pub async fn start(
        targets: Vec<Arc<Target>>,
        options: ProbeOptions,
        cancel: CancellationToken,
    ) -> Result<Self, StartupError> {
        let mut prober = NetworkProber::new(options)?;
        if targets.iter().any(|t| t.kind == ProbeKind::Icmp) {
            let mut icmp = IcmpProber::new()?;
            if needs_icmpv6(&targets) {
                icmp = icmp.with_ipv6()?;
            }
            prober = prober.with_icmp(icmp);
        }

        Self::start_with_prober(targets, Arc::new(prober), cancel).await
    }

    /// Start monitoring with a caller-supplied prober. Targets are validated
    /// before any loop starts.
    pub async fn start_with_prober(
        targets: Vec<Arc<Target>>,
        prober: Arc<dyn Prober>,
        cancel: CancellationToken,
    ) -> Result<Self, StartupError> {
        let store = Arc::new(ResultStore::new());
        let scheduler = Scheduler::new(store, prober, cancel);
        scheduler.start(targets).await?;

        Ok(Self { scheduler })
    }

    pub fn store(&self) -> &Arc<ResultStore> {
        self.scheduler.store()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Point-in-time status of every configured target.
    pub fn snapshot(&self) -> Vec<SnapshotEntry> {
        self.store().snapshot()
    }

    /// Wait for every probe loop to exit after cancellation.
    pub async fn join(&self) {
        self.scheduler.join().await;
    }

    /// Cancel all loops and wait for them.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }
}

fn needs_icmpv6(targets: &[Arc<Target>]) -> bool {
    targets
        .iter()
        .any(|t| t.kind == ProbeKind::Icmp && is_ipv6_literal(&t.address))
}
