//! Scheduler module for running periodic probes.
//!
//! One loop task per target probes immediately, then once per interval,
//! until the shared cancellation token fires or the target is removed.

use crate::config::{check_target, check_targets, ConfigError};
use crate::probe::{run_probe, Prober};
use crate::store::{ResultStore, Target};

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Reasons a target cannot be scheduled.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("scheduler has been cancelled")]
    Stopped,
}

/// Lifecycle of a single target's probe loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Probing,
    /// Terminal. A stopped loop is never restarted.
    Stopped,
}

struct LoopHandle {
    cancel: CancellationToken,
    state: watch::Receiver<LoopState>,
    task: Option<JoinHandle<()>>,
}

/// Owns the probe loops of all monitored targets.
pub struct Scheduler {
    store: Arc<ResultStore>,
    prober: Arc<dyn Prober>,
    cancel: CancellationToken,
    loops: RwLock<HashMap<String, LoopHandle>>,
}

impl Scheduler {
    /// Create a scheduler whose loops all observe `cancel`.
    pub fn new(
        store: Arc<ResultStore>,
        prober: Arc<dyn Prober>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            prober,
            cancel,
            loops: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<ResultStore> {
        &self.store
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Start monitoring every target. The whole set is validated, including
    /// against already scheduled identities, before any loop is spawned.
    pub async fn start(&self, targets: Vec<Arc<Target>>) -> Result<(), SchedulerError> {
        if self.cancel.is_cancelled() {
            return Err(SchedulerError::Stopped);
        }
        check_targets(&targets)?;
        {
            let loops = self.loops.read().await;
            if let Some(dup) = targets.iter().find(|t| loops.contains_key(&t.identity)) {
                return Err(ConfigError::DuplicateIdentity(dup.identity.clone()).into());
            }
        }

        tracing::info!("Starting scheduler with {} targets", targets.len());

        for target in targets {
            self.add_target(target).await?;
        }
        Ok(())
    }

    /// Add a target to be monitored. Its first probe runs immediately.
    ///
    /// Rejected once the scheduler has been cancelled.
    pub async fn add_target(&self, target: Arc<Target>) -> Result<(), SchedulerError> {
        check_target(0, &target)?;

        let mut loops = self.loops.write().await;
        if self.cancel.is_cancelled() {
            return Err(SchedulerError::Stopped);
        }
        if loops.contains_key(&target.identity) || !self.store.register(target.clone()) {
            return Err(ConfigError::DuplicateIdentity(target.identity.clone()).into());
        }

        tracing::info!(
            "Scheduler: Adding target {} ({} {})",
            target.identity,
            target.kind,
            target.address
        );

        let cancel = self.cancel.child_token();
        let (state_tx, state_rx) = watch::channel(LoopState::Idle);
        let task = tokio::spawn(run_probe_loop(
            target.clone(),
            self.prober.clone(),
            self.store.clone(),
            cancel.clone(),
            state_tx,
        ));

        loops.insert(
            target.identity.clone(),
            LoopHandle {
                cancel,
                state: state_rx,
                task: Some(task),
            },
        );
        Ok(())
    }

    /// Stop monitoring a target, wait for its loop to exit, and drop its entry
    /// from the result store.
    pub async fn remove_target(&self, identity: &str) -> bool {
        let handle = self.loops.write().await.remove(identity);

        let Some(mut handle) = handle else {
            return false;
        };

        handle.cancel.cancel();
        if let Some(task) = handle.task.take() {
            if let Err(e) = task.await {
                tracing::error!("Probe loop for {} panicked: {}", identity, e);
            }
        }
        self.store.remove(identity);
        tracing::info!("Scheduler: Removed target {}", identity);
        true
    }

    /// Current loop state for a target, if it is (or was) scheduled.
    pub async fn state(&self, identity: &str) -> Option<LoopState> {
        let loops = self.loops.read().await;
        loops.get(identity).map(|h| *h.state.borrow())
    }

    pub async fn len(&self) -> usize {
        self.loops.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Wait until every loop has exited.
    ///
    /// Only returns once all loops observed cancellation, so no result store
    /// write happens after it completes.
    pub async fn join(&self) {
        let tasks: Vec<(String, JoinHandle<()>)> = {
            let mut loops = self.loops.write().await;
            loops
                .iter_mut()
                .filter_map(|(id, h)| h.task.take().map(|t| (id.clone(), t)))
                .collect()
        };

        let count = tasks.len();
        for (identity, task) in tasks {
            if let Err(e) = task.await {
                tracing::error!("Probe loop for {} panicked: {}", identity, e);
            }
        }
        tracing::info!("Scheduler: {} probe loops stopped", count);
    }

    /// Cancel every loop and wait for all of them to exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.join().await;
    }
}

/// Run the probe loop for a single target.
async fn run_probe_loop(
    target: Arc<Target>,
    prober: Arc<dyn Prober>,
    store: Arc<ResultStore>,
    cancel: CancellationToken,
    state: watch::Sender<LoopState>,
) {
    let mut last_ok = None;

    if !cancel.is_cancelled() {
        probe_once(&target, prober.as_ref(), &store, &state, &mut last_ok).await;

        let first_tick = Instant::now() + target.interval;
        let mut interval = tokio::time::interval_at(first_tick, target.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    probe_once(&target, prober.as_ref(), &store, &state, &mut last_ok).await;
                }
            }
        }
    }

    state.send_replace(LoopState::Stopped);
    tracing::debug!("Probe loop for {} stopped", target.identity);
}

async fn probe_once(
    target: &Target,
    prober: &dyn Prober,
    store: &ResultStore,
    state: &watch::Sender<LoopState>,
    last_ok: &mut Option<bool>,
) {
    state.send_replace(LoopState::Probing);
    let outcome = run_probe(prober, target).await;

    match (&outcome.failure_detail, *last_ok) {
        (Some(detail), Some(true) | None) => {
            tracing::warn!("Probe failed for {}: {}", target.identity, detail)
        }
        (None, Some(false)) => tracing::info!("Probe recovered for {}", target.identity),
        _ => tracing::debug!(
            "Probe for {}: ok={} latency={:?}",
            target.identity,
            outcome.succeeded,
            outcome.latency
        ),
    }
    *last_ok = Some(outcome.succeeded);

    store.put(&target.identity, outcome);
    state.send_replace(LoopState::Idle);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeError;
    use crate::store::Status;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingProber {
        delay: Duration,
        fail: bool,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl CountingProber {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Prober for CountingProber {
        async fn probe(&self, _target: &Target) -> Result<Duration, ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.fail {
                Err(ProbeError::Refused)
            } else {
                Ok(self.delay)
            }
        }
    }

    fn target(id: &str, interval_ms: u64, timeout_ms: u64) -> Arc<Target> {
        Arc::new(
            Target::tcp(
                "127.0.0.1:9",
                Duration::from_millis(interval_ms),
                Duration::from_millis(timeout_ms),
            )
            .with_identity(id),
        )
    }

    fn scheduler(prober: Arc<CountingProber>) -> Scheduler {
        Scheduler::new(Arc::new(ResultStore::new()), prober, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_first_probe_runs_immediately() {
        let prober = Arc::new(CountingProber::default());
        let sched = scheduler(prober.clone());
        sched.start(vec![target("a", 60_000, 1_000)]).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(prober.calls(), 1);
        assert!(matches!(sched.store().get("a"), Some(Status::Healthy(_))));
        assert_eq!(sched.state("a").await, Some(LoopState::Idle));

        sched.shutdown().await;
    }

    #[tokio::test]
    async fn test_probes_never_overlap() {
        let prober = Arc::new(CountingProber {
            delay: Duration::from_millis(30),
            ..Default::default()
        });
        let sched = scheduler(prober.clone());
        sched.start(vec![target("a", 35, 35)]).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        sched.shutdown().await;

        assert!(prober.calls() >= 3);
        assert_eq!(prober.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_the_loop() {
        let prober = Arc::new(CountingProber {
            fail: true,
            ..Default::default()
        });
        let sched = scheduler(prober.clone());
        sched.start(vec![target("a", 20, 10)]).await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(prober.calls() >= 3);
        match sched.store().get("a") {
            Some(Status::Failed(o)) => {
                assert_eq!(o.failure_detail.as_deref(), Some("connection refused"))
            }
            other => panic!("unexpected status: {:?}", other),
        }
        sched.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_quiescent() {
        let prober = Arc::new(CountingProber {
            delay: Duration::from_millis(5),
            ..Default::default()
        });
        let sched = scheduler(prober.clone());
        sched
            .start(vec![target("a", 20, 10), target("b", 20, 10), target("c", 20, 10)])
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(70)).await;
        sched.shutdown().await;

        for id in ["a", "b", "c"] {
            assert_eq!(sched.state(id).await, Some(LoopState::Stopped));
        }

        let calls = prober.calls();
        let before: Vec<_> = sched
            .store()
            .snapshot()
            .into_iter()
            .map(|e| e.status.outcome().map(|o| o.observed_at))
            .collect();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let after: Vec<_> = sched
            .store()
            .snapshot()
            .into_iter()
            .map(|e| e.status.outcome().map(|o| o.observed_at))
            .collect();

        assert_eq!(prober.calls(), calls);
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_duplicate_identity_rejected() {
        let sched = scheduler(Arc::new(CountingProber::default()));
        let err = sched
            .start(vec![target("a", 1_000, 100), target("a", 1_000, 100)])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::Config(ConfigError::DuplicateIdentity(_))
        ));
        assert!(sched.is_empty().await);

        sched.add_target(target("b", 1_000, 100)).await.unwrap();
        assert!(sched.add_target(target("b", 1_000, 100)).await.is_err());
        sched.shutdown().await;
    }

    #[tokio::test]
    async fn test_remove_target_tears_down() {
        let prober = Arc::new(CountingProber::default());
        let sched = scheduler(prober.clone());
        sched
            .start(vec![target("a", 1_000, 100), target("b", 1_000, 100)])
            .await
            .unwrap();

        assert!(sched.remove_target("a").await);
        assert!(!sched.remove_target("a").await);
        assert!(sched.state("a").await.is_none());
        assert!(sched.store().get("a").is_none());

        let ids: Vec<_> = sched
            .store()
            .snapshot()
            .into_iter()
            .map(|e| e.target.identity.clone())
            .collect();
        assert_eq!(ids, vec!["b"]);
        sched.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancelled_before_start_is_rejected() {
        let prober = Arc::new(CountingProber::default());
        let sched = scheduler(prober.clone());
        sched.cancel_token().cancel();

        let err = sched.start(vec![target("a", 1_000, 100)]).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Stopped));
        sched.join().await;

        assert_eq!(prober.calls(), 0);
        assert!(sched.state("a").await.is_none());
        assert!(sched.store().is_empty());
    }

    #[tokio::test]
    async fn test_add_after_shutdown_is_rejected() {
        let prober = Arc::new(CountingProber::default());
        let sched = scheduler(prober.clone());
        sched.start(vec![target("a", 1_000, 100)]).await.unwrap();
        sched.shutdown().await;

        let err = sched.add_target(target("late", 1_000, 100)).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Stopped));
        assert!(sched.store().get("late").is_none());
        assert!(sched.state("late").await.is_none());
        assert_eq!(sched.store().snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_timing_is_rejected() {
        let prober = Arc::new(CountingProber::default());
        let sched = scheduler(prober.clone());

        for bad in [target("zero", 0, 50), target("slow", 50, 100)] {
            let err = sched.add_target(bad).await.unwrap_err();
            assert!(matches!(
                err,
                SchedulerError::Config(ConfigError::InvalidTarget { .. })
            ));
        }
        let err = sched
            .start(vec![target("ok", 1_000, 100), target("zero", 0, 50)])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::Config(ConfigError::InvalidTarget { index: 1, .. })
        ));

        assert!(sched.is_empty().await);
        assert!(sched.store().is_empty());
        assert_eq!(prober.calls(), 0);
        sched.shutdown().await;
    }
}
