//! netprobe - concurrent network probing engine.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use netprobe::config::{self, EngineConfig};
use netprobe::engine::Engine;
use netprobe::pool::{self, ScanOptions};
use netprobe::probe::{is_ipv6_literal, IcmpProber, PingSummary, ProbeOptions};
use netprobe::report;

/// Monitor targets over TCP/HTTP/ICMP, or run one-shot port scans.
#[derive(Debug, Parser)]
#[command(name = "netprobe", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Probe every target in a JSON list until interrupted.
    Monitor {
        /// Path to the JSON target list.
        #[arg(long)]
        targets: PathBuf,

        /// Status table refresh period in milliseconds.
        #[arg(long = "report-interval-ms")]
        report_interval_ms: Option<u64>,

        /// Local source address for TCP and HTTP probes.
        #[arg(long)]
        bind: Option<IpAddr>,
    },
    /// Scan a TCP port range on one host.
    Scan {
        #[arg(long, default_value = "localhost")]
        host: String,

        #[arg(long, default_value_t = 1)]
        start: u16,

        #[arg(long, default_value_t = 1024)]
        end: u16,

        /// Connect timeout per port in milliseconds.
        #[arg(long = "timeout-ms")]
        timeout_ms: Option<u64>,

        /// Number of concurrent workers.
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
        workers: Option<u32>,

        /// Also list closed ports.
        #[arg(long = "show-closed", default_value_t = false)]
        show_closed: bool,
    },
    /// Send ICMP echo requests to one host.
    Ping {
        #[arg(long)]
        host: String,

        #[arg(long, default_value_t = 4)]
        count: u32,

        #[arg(long = "interval-ms", default_value_t = 1000)]
        interval_ms: u64,

        #[arg(long = "timeout-ms", default_value_t = 2000)]
        timeout_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("netprobe=info".parse()?))
        .init();

    let cli = Cli::parse();
    let cfg = EngineConfig::load();

    // Ctrl-C is the single shutdown signal for every task.
    let cancel = CancellationToken::new();
    let cancel_ctrlc = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Interrupt received, shutting down...");
        cancel_ctrlc.cancel();
    });

    match cli.command {
        Command::Monitor {
            targets,
            report_interval_ms,
            bind,
        } => {
            let targets = config::load_targets(&targets).inspect_err(|e| {
                tracing::error!("Invalid target list: {}", e);
            })?;
            let options = ProbeOptions {
                bind_address: bind.or(cfg.bind_address),
            };
            let period = report_interval_ms
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(cfg.report_interval);

            tracing::info!("Monitoring {} targets", targets.len());
            let engine = Engine::start(targets, options, cancel.clone())
                .await
                .inspect_err(|e| tracing::error!("Startup failed: {}", e))?;

            let reporter = tokio::spawn(report::run_reporter(
                engine.store().clone(),
                period,
                cancel.clone(),
            ));

            cancel.cancelled().await;
            engine.join().await;
            let _ = reporter.await;

            println!("\n{}", report::render(&engine.snapshot()));
            tracing::info!("Monitor stopped");
        }
        Command::Scan {
            host,
            start,
            end,
            timeout_ms,
            workers,
            show_closed,
        } => {
            let ports = pool::port_range(start, end)?;
            let attempted = ports.len();
            let options = ScanOptions {
                timeout: timeout_ms.map(Duration::from_millis).unwrap_or(cfg.scan_timeout),
                workers: workers.map_or(cfg.scan_workers, |w| w as usize),
                retain_closed: show_closed,
                bind_address: cfg.bind_address,
                cancel: cancel.clone(),
            };

            let started = Instant::now();
            let results = pool::scan_with(&host, ports, options).await?;
            print!(
                "{}",
                report::render_scan(&host, &results, attempted, started.elapsed())
            );
        }
        Command::Ping {
            host,
            count,
            interval_ms,
            timeout_ms,
        } => {
            let mut prober = IcmpProber::new().inspect_err(|e| tracing::error!("{}", e))?;
            if is_ipv6_literal(&host) {
                prober = prober.with_ipv6().inspect_err(|e| tracing::error!("{}", e))?;
            }
            let timeout = Duration::from_millis(timeout_ms.max(1));
            let summary =
                run_ping_session(&prober, &host, count, interval_ms, timeout, &cancel).await;
            print!("{}", report::render_ping(&host, &summary));
        }
    }

    Ok(())
}

async fn run_ping_session(
    prober: &IcmpProber,
    host: &str,
    count: u32,
    interval_ms: u64,
    timeout: Duration,
    cancel: &CancellationToken,
) -> PingSummary {
    let mut summary = PingSummary::default();
    println!("PING {}", host);

    for seq in 1..=count {
        if cancel.is_cancelled() {
            break;
        }
        match prober.ping(host, timeout).await {
            Ok(rtt) => {
                println!(
                    "Reply from {}: seq={} time={:.2}ms",
                    host,
                    seq,
                    rtt.as_secs_f64() * 1000.0
                );
                summary.record(Some(rtt));
            }
            Err(e) => {
                println!("Request failed for seq {}: {}", seq, e);
                summary.record(None);
            }
        }

        if seq < count {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_millis(interval_ms)) => {}
            }
        }
    }
    summary
}
