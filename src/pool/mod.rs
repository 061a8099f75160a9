//! Fixed-size worker pool for one-shot fan-out jobs.
//!
//! A producer feeds jobs into a bounded queue, `W` workers pull until the
//! queue is closed and empty, and a coordinator drains the results channel
//! once every worker has exited.

mod scan;
mod services;

pub use scan::*;
pub use services::*;

use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Capacity of the job queue between the producer and the workers.
const JOB_QUEUE_CAPACITY: usize = 100;

/// Run `work` over every job with at most `workers` jobs in flight.
///
/// Each job is handed to exactly one worker. Jobs for which `work` returns
/// `None` produce no result. Results arrive in completion order.
///
/// If `cancel` fires, workers stop at their next pull; jobs not yet pulled
/// are skipped. `workers` below one is treated as one; callers that expose
/// the worker count validate it themselves.
pub async fn run_pool<J, R, F, Fut>(
    jobs: Vec<J>,
    workers: usize,
    cancel: CancellationToken,
    work: F,
) -> Vec<R>
where
    J: Send + 'static,
    R: Send + 'static,
    F: Fn(J) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<R>> + Send,
{
    let workers = workers.max(1);
    let (job_tx, job_rx) = mpsc::channel::<J>(JOB_QUEUE_CAPACITY);
    let (result_tx, mut result_rx) = mpsc::unbounded_channel::<R>();
    let job_rx = Arc::new(Mutex::new(job_rx));
    let work = Arc::new(work);

    let mut set = JoinSet::new();

    // Producer: closes the queue by dropping the sender when done.
    let producer_cancel = cancel.clone();
    set.spawn(async move {
        for job in jobs {
            tokio::select! {
                biased;
                _ = producer_cancel.cancelled() => break,
                sent = job_tx.send(job) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }
    });

    for _ in 0..workers {
        let job_rx = job_rx.clone();
        let result_tx = result_tx.clone();
        let work = work.clone();
        let cancel = cancel.clone();

        set.spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                let job = {
                    let mut rx = job_rx.lock().await;
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        job = rx.recv() => job,
                    }
                };
                let Some(job) = job else {
                    break;
                };
                if let Some(result) = work(job).await {
                    // The coordinator keeps the receiver until all workers exit.
                    let _ = result_tx.send(result);
                }
            }
        });
    }
    // Workers hold the only receiver handles, so the producer cannot block
    // once they are all gone.
    drop(job_rx);
    drop(result_tx);

    while let Some(res) = set.join_next().await {
        if let Err(e) = res {
            tracing::error!("Pool worker failed: {}", e);
        }
    }

    let mut results = Vec::new();
    while let Some(result) = result_rx.recv().await {
        results.push(result);
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_every_job_attempted_once() {
        for workers in [1, 3, 8, 500] {
            let attempts = Arc::new(std::sync::Mutex::new(HashMap::<u32, usize>::new()));
            let seen = attempts.clone();
            let jobs: Vec<u32> = (0..250).collect();

            let results = run_pool(jobs, workers, CancellationToken::new(), move |job| {
                let seen = seen.clone();
                async move {
                    *seen.lock().unwrap().entry(job).or_default() += 1;
                    (job % 3 == 0).then_some(job)
                }
            })
            .await;

            let attempts = attempts.lock().unwrap();
            assert_eq!(attempts.len(), 250);
            assert!(attempts.values().all(|&n| n == 1));

            let mut results = results;
            results.sort_unstable();
            assert_eq!(results, (0..250).filter(|j| j % 3 == 0).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn test_empty_job_set() {
        let results: Vec<u32> =
            run_pool(Vec::<u32>::new(), 4, CancellationToken::new(), |j| async move { Some(j) })
                .await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_worker_bound_respected() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (f, p) = (in_flight.clone(), peak.clone());

        run_pool((0..40).collect::<Vec<u32>>(), 4, CancellationToken::new(), move |_| {
            let (f, p) = (f.clone(), p.clone());
            async move {
                let now = f.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                f.fetch_sub(1, Ordering::SeqCst);
                None::<()>
            }
        })
        .await;

        assert!(peak.load(Ordering::SeqCst) <= 4);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_failed_workers_do_not_stall_producer() {
        let jobs: Vec<u32> = (0..500).collect();
        let finished = tokio::time::timeout(
            Duration::from_secs(3),
            run_pool(jobs, 2, CancellationToken::new(), |j| async move {
                if j < 10 {
                    panic!("worker failure on job {}", j);
                }
                Some(j)
            }),
        )
        .await;

        let results = finished.expect("pool should terminate after its workers fail");
        assert!(results.len() < 500);
    }

    #[tokio::test]
    async fn test_cancel_stops_workers() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let results =
            run_pool((0..1000).collect::<Vec<u32>>(), 4, cancel, |j| async move { Some(j) }).await;
        assert!(results.is_empty());
    }
}
