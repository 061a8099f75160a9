//! Snapshot rendering for terminal output.

use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::pool::PortResult;
use crate::probe::PingSummary;
use crate::store::{ResultStore, SnapshotEntry, Status};

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Render one snapshot as a status table. Pending, healthy and failed targets
/// are each shown distinctly.
pub fn render(entries: &[SnapshotEntry]) -> String {
    let name_w = entries
        .iter()
        .map(|e| e.target.identity.len())
        .max()
        .unwrap_or(0)
        .max("target".len());

    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<7}  {:<name_w$}  {:<4}  {:>10}  detail",
        "status", "target", "kind", "latency"
    );
    for entry in entries {
        let (label, latency, detail) = match &entry.status {
            Status::Pending => ("PENDING", "-".to_string(), "checking..."),
            Status::Healthy(o) => ("UP", format!("{:.1}ms", millis(o.latency)), ""),
            Status::Failed(o) => (
                "DOWN",
                format!("{:.1}ms", millis(o.latency)),
                o.failure_detail.as_deref().unwrap_or(""),
            ),
        };
        let _ = writeln!(
            out,
            "{:<7}  {:<name_w$}  {:<4}  {:>10}  {}",
            label, entry.target.identity, entry.target.kind, latency, detail
        );
    }
    out
}

/// Print a snapshot of `store` every `period` until cancelled.
pub async fn run_reporter(store: Arc<ResultStore>, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                println!("\n{}", render(&store.snapshot()));
            }
        }
    }
}

/// Render batch scan results.
pub fn render_scan(
    host: &str,
    results: &[PortResult],
    attempted: usize,
    elapsed: Duration,
) -> String {
    let mut out = String::new();
    let open: Vec<_> = results.iter().filter(|r| r.open).collect();

    if results.is_empty() {
        let _ = writeln!(out, "No open ports found on {}", host);
    }
    for r in results {
        let state = if r.open { "OPEN" } else { "CLOSED" };
        let service = r.service.unwrap_or("unknown");
        let _ = write!(out, "  Port {:>5}: {:<6} ({})", r.port, state, service);
        if let Some(detail) = &r.detail {
            let _ = write!(out, " {}", detail);
        }
        out.push('\n');
    }
    let _ = writeln!(out, "Scan completed in {:.2?}", elapsed);
    let _ = writeln!(out, "Open ports: {}/{}", open.len(), attempted);
    out
}

/// Render ping statistics in the familiar `ping` summary form.
pub fn render_ping(host: &str, summary: &PingSummary) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "--- {} ping statistics ---", host);
    let _ = writeln!(
        out,
        "{} packets transmitted, {} received, {:.1}% packet loss",
        summary.sent,
        summary.received,
        summary.loss_percent()
    );
    if let (Some(min), Some(avg), Some(max)) = (summary.min, summary.avg(), summary.max) {
        let _ = writeln!(
            out,
            "rtt min/avg/max = {:.2}/{:.2}/{:.2} ms",
            millis(min),
            millis(avg),
            millis(max)
        );
    }
    out
}
